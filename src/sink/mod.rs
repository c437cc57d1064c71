//! Consumer role: listens on both address families, keeps the freshest
//! snapshot, and serves it to local readers in place of real hardware.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::net::{recv_from_opt, SocketPair};
use crate::protocol::{PadState, ACK_PAYLOAD, PORT};
use crate::status::{Severity, StatusEvent, StatusReporter};

/// Minimum spacing between acknowledgments per address family.
pub const ACK_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period for the worker task to exit after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Receive buffer, deliberately larger than the wire size so oversized
/// datagrams arrive untruncated and fail the length check.
const RECV_BUF: usize = 64;

/// The freshest accepted snapshot, shared between the sink task (sole
/// writer) and any number of query callers.
#[derive(Clone, Default)]
pub struct SharedPadState {
    inner: Arc<Mutex<PadState>>,
}

impl SharedPadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the sequencing rule under the lock. Returns whether the
    /// incoming snapshot replaced the stored one.
    pub fn apply(&self, incoming: &PadState) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if crate::protocol::is_newer(incoming.packet_number, state.packet_number) {
            *state = *incoming;
            true
        } else {
            false
        }
    }

    /// Query contract: slot 0 serves the synthesized logical controller,
    /// every other slot reads as not connected.
    pub fn get(&self, slot: usize) -> Option<PadState> {
        if slot != 0 {
            return None;
        }
        Some(*self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Per-family acknowledgment rate limiter.
struct AckThrottle {
    last: Option<Instant>,
}

impl AckThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn should_send(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) <= ACK_INTERVAL => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub struct SinkOptions {
    pub port: u16,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self { port: PORT }
    }
}

/// Handle to the running sink worker.
pub struct SinkHandle {
    state: SharedPadState,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    v4_port: Option<u16>,
    v6_port: Option<u16>,
}

impl SinkHandle {
    /// Binds both families and spawns the receive loop.
    ///
    /// When neither family binds there is no data path at all; the worker
    /// parks until shutdown and readers keep seeing the neutral snapshot,
    /// with the failure reported on the status boundary.
    pub async fn spawn(options: SinkOptions, events: mpsc::Sender<StatusEvent>) -> Self {
        let mut reporter = StatusReporter::new(events);
        let state = SharedPadState::new();
        let cancel = CancellationToken::new();

        let sockets = match SocketPair::bind(options.port).await {
            Ok(sockets) => sockets,
            Err(e) => {
                warn!("{}", e);
                reporter.connection(Severity::Bad, format!("{e}"));

                let parked = cancel.clone();
                let task = tokio::spawn(async move { parked.cancelled().await });
                return Self {
                    state,
                    cancel,
                    task,
                    v4_port: None,
                    v6_port: None,
                };
            }
        };

        let v4_port = sockets.v4_port();
        let v6_port = sockets.v6_port();

        reporter.connection(Severity::Pending, "Waiting for a bridge to connect");

        info!("Sink listening on UDP port {}", options.port);

        let task = tokio::spawn(run_sink(sockets, state.clone(), cancel.clone()));

        Self {
            state,
            cancel,
            task,
            v4_port,
            v6_port,
        }
    }

    /// The shared snapshot served to local readers.
    pub fn state(&self) -> SharedPadState {
        self.state.clone()
    }

    /// Actual IPv4 port (differs from the requested one when bound to 0).
    pub fn v4_port(&self) -> Option<u16> {
        self.v4_port
    }

    /// Actual IPv6 port.
    pub fn v6_port(&self) -> Option<u16> {
        self.v6_port
    }

    /// Cooperative shutdown with a bounded grace period.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            warn!("Sink task did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

async fn run_sink(sockets: SocketPair, state: SharedPadState, cancel: CancellationToken) {
    let mut buf4 = [0u8; RECV_BUF];
    let mut buf6 = [0u8; RECV_BUF];
    let mut ack4 = AckThrottle::new();
    let mut ack6 = AckThrottle::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = recv_from_opt(sockets.v4(), &mut buf4) => {
                if let Ok((len, peer)) = result {
                    accept_datagram(&sockets, &state, &buf4[..len], peer, &mut ack4).await;
                }
            }

            result = recv_from_opt(sockets.v6(), &mut buf6) => {
                if let Ok((len, peer)) = result {
                    accept_datagram(&sockets, &state, &buf6[..len], peer, &mut ack6).await;
                }
            }
        }
    }

    info!("Sink loop stopped");
}

async fn accept_datagram(
    sockets: &SocketPair,
    state: &SharedPadState,
    payload: &[u8],
    peer: std::net::SocketAddr,
    throttle: &mut AckThrottle,
) {
    let Some(packet) = PadState::decode(payload) else {
        debug!("Ignoring malformed {}-byte datagram from {}", payload.len(), peer);
        return;
    };

    if state.apply(&packet) {
        trace!("Accepted packet {} from {}", packet.packet_number, peer);
    } else {
        trace!("Rejected stale packet {} from {}", packet.packet_number, peer);
    }

    // Duplicates still refresh the peer's liveness view, so the ack decision
    // only depends on the per-family throttle, not on acceptance.
    if throttle.should_send(Instant::now()) {
        sockets.send_to(ACK_PAYLOAD, peer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WIRE_SIZE;
    use tokio::net::UdpSocket;

    fn numbered(packet_number: u32, buttons: u16) -> PadState {
        PadState {
            packet_number,
            buttons,
            ..PadState::default()
        }
    }

    #[test]
    fn apply_is_idempotent() {
        let state = SharedPadState::new();

        assert!(state.apply(&numbered(1, 0x1)));
        assert!(!state.apply(&numbered(1, 0x2)));

        assert_eq!(state.get(0).unwrap().buttons, 0x1);
    }

    #[test]
    fn apply_accepts_wraparound() {
        let state = SharedPadState::new();

        assert!(state.apply(&numbered(0xFFFF_FFF0, 0x1)));
        assert!(state.apply(&numbered(5, 0x2)));
        assert!(!state.apply(&numbered(0xFFFF_FFF0, 0x3)));

        assert_eq!(state.get(0).unwrap().buttons, 0x2);
    }

    #[test]
    fn only_slot_zero_is_served() {
        let state = SharedPadState::new();
        state.apply(&numbered(1, 0x1));

        assert!(state.get(0).is_some());
        for slot in 1..4 {
            assert!(state.get(slot).is_none());
        }
    }

    #[test]
    fn throttle_passes_first_and_spaced_acks() {
        let mut throttle = AckThrottle::new();
        let start = Instant::now();

        assert!(throttle.should_send(start));
        assert!(!throttle.should_send(start + Duration::from_millis(100)));
        assert!(!throttle.should_send(start + Duration::from_millis(250)));
        assert!(throttle.should_send(start + Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn sink_accepts_updates_and_acks_with_throttle() {
        let (events, _events_rx) = mpsc::channel(16);
        let sink = SinkHandle::spawn(SinkOptions { port: 0 }, events).await;
        let port = sink.v4_port().expect("IPv4 socket");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{port}");

        // Two quick packets: both land, state keeps the newer one, and the
        // 250ms throttle allows exactly one ack.
        client
            .send_to(&numbered(1, 0x1).encode(), &target)
            .await
            .unwrap();
        client
            .send_to(&numbered(2, 0x3).encode(), &target)
            .await
            .unwrap();

        let mut ack = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut ack))
            .await
            .expect("first ack")
            .unwrap();
        assert_eq!(&ack[..len], ACK_PAYLOAD);

        let second =
            tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut ack)).await;
        assert!(second.is_err(), "second ack must be throttled");

        // Give the sink a moment to apply both packets, then check the state.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = sink.state();
        assert_eq!(state.get(0).unwrap().packet_number, 2);
        assert_eq!(state.get(0).unwrap().buttons, 0x3);

        // A stale resend leaves the state untouched.
        client
            .send_to(&numbered(1, 0x1).encode(), &target)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.state().get(0).unwrap().packet_number, 2);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn sink_ignores_malformed_datagrams() {
        let (events, _events_rx) = mpsc::channel(16);
        let sink = SinkHandle::spawn(SinkOptions { port: 0 }, events).await;
        let port = sink.v4_port().expect("IPv4 socket");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{port}");

        client.send_to(&[0u8; WIRE_SIZE - 3], &target).await.unwrap();
        client.send_to(&[0u8; WIRE_SIZE + 5], &target).await.unwrap();

        let mut ack = [0u8; 16];
        let acked =
            tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut ack)).await;
        assert!(acked.is_err(), "malformed datagrams are never acked");

        assert_eq!(sink.state().get(0).unwrap(), PadState::default());

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn sink_serves_both_families_and_rejects_cross_family_duplicate() {
        let (events, _events_rx) = mpsc::channel(16);
        let sink = SinkHandle::spawn(SinkOptions { port: 0 }, events).await;
        let v4_port = sink.v4_port().expect("IPv4 socket");
        let v6_port = sink.v6_port().expect("IPv6 socket");
        assert_eq!(v4_port, v6_port, "both families listen on one port");

        let client4 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client6 = UdpSocket::bind("[::1]:0").await.unwrap();
        let mut ack = [0u8; 16];

        client4
            .send_to(&numbered(1, 0x1).encode(), format!("127.0.0.1:{v4_port}"))
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client4.recv_from(&mut ack))
            .await
            .expect("v4 ack")
            .unwrap();
        assert_eq!(&ack[..len], ACK_PAYLOAD);

        // Same sequence number again, this time over IPv6: the stored state
        // keeps the first snapshot, but the v6 side has its own throttle and
        // still gets an ack.
        client6
            .send_to(&numbered(1, 0x2).encode(), format!("[::1]:{v6_port}"))
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client6.recv_from(&mut ack))
            .await
            .expect("v6 ack")
            .unwrap();
        assert_eq!(&ack[..len], ACK_PAYLOAD);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.state().get(0).unwrap().buttons, 0x1);

        // A genuinely newer packet over IPv6 replaces it.
        client6
            .send_to(&numbered(2, 0x4).encode(), format!("[::1]:{v6_port}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.state().get(0).unwrap().packet_number, 2);
        assert_eq!(sink.state().get(0).unwrap().buttons, 0x4);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn sink_parks_on_total_bind_failure() {
        let blocker = SocketPair::bind(0).await.unwrap();
        let port = blocker.v4_port().expect("IPv4 socket");
        assert_eq!(blocker.v6_port(), Some(port));

        let (events, mut events_rx) = mpsc::channel(16);
        let sink = SinkHandle::spawn(SinkOptions { port }, events).await;

        assert!(sink.v4_port().is_none());
        assert!(sink.v6_port().is_none());

        let event = events_rx.recv().await.expect("bind failure report");
        assert!(matches!(
            event,
            StatusEvent::Connection {
                severity: Severity::Bad,
                ..
            }
        ));

        // Readers see the neutral snapshot, and shutdown still completes.
        assert_eq!(sink.state().get(0).unwrap(), PadState::default());
        sink.shutdown().await;
    }
}
