//! Producer role: polls local controllers, combines them, and bridges the
//! combined snapshot to a resolved destination over both address families.

use std::net::SocketAddr;
use std::time::Duration;

use statum::{machine, state, transition};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::input::{GilrsSource, NullSource, PadCombiner, PadSource};
use crate::net::{self, recv_from_opt, NetError, ResolveError, SocketPair};
use crate::protocol::PORT;
use crate::status::{Severity, StatusEvent, StatusReporter};

/// Poll/send cadence while a destination is resolved. Keeps controller
/// polling responsive without burning a core.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Wake cadence while no destination is resolved; every wake retries
/// resolution, so this doubles as the resolver retry interval.
const RESOLVE_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Length of one throughput/liveness reporting window. Unchanged state is
/// resent at least once per window as a heartbeat.
const REPORT_INTERVAL: Duration = Duration::from_millis(1000);

/// Grace period for the worker task to exit after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const RECV_BUF: usize = 64;

/// Counters for the current ~1s reporting window.
struct ReportWindow {
    packets: u32,
    replies: u32,
    started: Instant,
}

impl ReportWindow {
    fn new() -> Self {
        Self {
            packets: 0,
            replies: 0,
            started: Instant::now(),
        }
    }
}

pub struct SenderOptions {
    /// Destination UDP port. The bridge's own sockets bind ephemeral ports.
    pub port: u16,
    /// Target host to resolve right away, as if the user had entered it.
    pub initial_target: Option<String>,
    /// Controller backend override; `None` means gilrs.
    pub source: Option<Box<dyn PadSource + Send>>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            port: PORT,
            initial_target: None,
            source: None,
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Initializing,
    Running,
}

/// The bridge worker. Owns both sockets, the controller source, the combiner
/// and the resolved destination set; nothing here is shared with other tasks.
#[machine]
pub struct BridgeWorker<BridgeState> {
    sockets: SocketPair,
    source: Box<dyn PadSource + Send>,
    combiner: PadCombiner,
    reporter: StatusReporter,
    target_rx: watch::Receiver<String>,
    cancel: CancellationToken,
    port: u16,
    destination: Option<Vec<SocketAddr>>,
    window: ReportWindow,
}

impl BridgeWorker<Initializing> {
    async fn create(
        port: u16,
        source: Option<Box<dyn PadSource + Send>>,
        target_rx: watch::Receiver<String>,
        events: mpsc::Sender<StatusEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, NetError> {
        let mut reporter = StatusReporter::new(events);

        let sockets = match SocketPair::bind(0).await {
            Ok(sockets) => sockets,
            Err(e) => {
                reporter.connection(Severity::Bad, format!("{e}"));
                return Err(e);
            }
        };

        let source = match source {
            Some(source) => source,
            None => match GilrsSource::new() {
                Ok(source) => Box::new(source) as Box<dyn PadSource + Send>,
                Err(e) => {
                    // Degraded mode: keep looping with no pads rather than
                    // taking the process down.
                    warn!("Controller backend unavailable: {}", e);
                    reporter.input(Severity::Bad, format!("{e}"));
                    Box::new(NullSource)
                }
            },
        };

        Ok(Self::builder()
            .sockets(sockets)
            .source(source)
            .combiner(PadCombiner::new())
            .reporter(reporter)
            .target_rx(target_rx)
            .cancel(cancel)
            .port(port)
            .destination(None)
            .window(ReportWindow::new())
            .build())
    }
}

#[transition]
impl BridgeWorker<Initializing> {
    /// Emits the initial status line-up and hands over to the running loop.
    fn initialize(mut self) -> BridgeWorker<Running> {
        self.reporter.empty_resolve();
        self.reporter.input_connected(0);
        self.reporter.empty_connection();
        self.reporter.icon(Severity::Bad);

        info!("Bridge worker started, destination port {}", self.port);
        self.transition()
    }
}

impl BridgeWorker<Running> {
    async fn run(mut self) {
        let mut buf4 = [0u8; RECV_BUF];
        let mut buf6 = [0u8; RECV_BUF];
        let mut target_open = true;

        loop {
            let tick = if self.destination.is_some() {
                POLL_INTERVAL
            } else {
                RESOLVE_RETRY_INTERVAL
            };

            let mut target_changed = false;

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                changed = self.target_rx.changed(), if target_open => {
                    match changed {
                        Ok(()) => target_changed = true,
                        // Boundary side dropped; keep running with the last
                        // value and stop polling the channel.
                        Err(_) => target_open = false,
                    }
                }

                result = recv_from_opt(self.sockets.v4(), &mut buf4) => {
                    if result.is_ok() {
                        self.window.replies += 1;
                    }
                }

                result = recv_from_opt(self.sockets.v6(), &mut buf6) => {
                    if result.is_ok() {
                        self.window.replies += 1;
                    }
                }

                _ = tokio::time::sleep(tick) => {}
            }

            self.drain_replies();

            if target_changed || self.destination.is_none() {
                self.resolve_destination().await;
            }

            self.poll_and_send().await;
        }

        info!("Bridge loop stopped");
    }

    /// Empties both receive queues without blocking; every datagram from the
    /// sink is an acknowledgment, its content carries no semantics.
    fn drain_replies(&mut self) {
        let mut buf = [0u8; RECV_BUF];

        for socket in [self.sockets.v4(), self.sockets.v6()] {
            let Some(socket) = socket else { continue };
            while let Ok((_, peer)) = socket.try_recv_from(&mut buf) {
                debug!("Reply from {}", peer);
                self.window.replies += 1;
            }
        }
    }

    /// Re-resolves the pending target string, replacing the destination set
    /// wholesale. Failures leave the destination empty; the unresolved tick
    /// retries automatically.
    async fn resolve_destination(&mut self) {
        self.destination = None;

        let host = self.target_rx.borrow_and_update().trim().to_string();

        self.reporter.empty_connection();
        self.reporter.icon(Severity::Bad);

        if host.is_empty() {
            self.reporter.empty_resolve();
            return;
        }

        self.reporter.resolve(Severity::Pending, "Resolving...");

        match net::resolve(&host, self.port).await {
            Ok(addrs) => {
                info!("Resolved {} to {} address(es)", host, addrs.len());
                self.reporter.resolve(Severity::Good, addrs[0].to_string());
                self.destination = Some(addrs);
            }
            Err(e @ ResolveError::HostNotFound) => {
                self.reporter.resolve(Severity::Bad, e.to_string());
            }
            Err(e) => {
                warn!("Resolution of {} failed: {}", host, e);
                self.reporter.resolve(Severity::Bad, e.to_string());
            }
        }
    }

    /// One poll cycle: combine the pads, transmit on change or heartbeat,
    /// and close out the reporting window when it is due.
    async fn poll_and_send(&mut self) {
        let changed = self.combiner.poll_cycle(self.source.as_mut());
        self.reporter.input_connected(self.combiner.connected_mask());

        let sendable = self.destination.is_some() && (changed || self.combiner.connected());
        if !sendable {
            self.reporter.icon(Severity::Bad);
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.window.started);
        let trigger_report = elapsed >= REPORT_INTERVAL;

        if changed || trigger_report {
            self.window.packets += 1;

            let payload = self.combiner.combined().encode();
            if let Some(addrs) = &self.destination {
                for addr in addrs {
                    self.sockets.send_to(&payload, *addr).await;
                }
            }
        }

        if trigger_report {
            let elapsed_ms = elapsed.as_millis().max(1) as u64;
            let pps = u64::from(self.window.packets) * 1000 / elapsed_ms;

            if self.window.replies > 0 {
                self.reporter.icon(Severity::Good);
                self.reporter
                    .connection(Severity::Good, format!("Connected (packets per second {pps})"));
            } else {
                self.reporter.icon(Severity::Pending);
                self.reporter.connection(
                    Severity::None,
                    format!("Attempting to connect... (packets per second {pps})"),
                );
            }

            self.window.packets = 0;
            self.window.replies = 0;
            self.window.started = now;
        }
    }
}

/// Handle to the running bridge worker.
pub struct SenderHandle {
    target_tx: watch::Sender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SenderHandle {
    /// Binds the sockets, initializes the controller backend and spawns the
    /// bridge loop.
    ///
    /// A worker that cannot bind either family has no way to transmit; it
    /// parks until shutdown after reporting the failure, mirroring the
    /// degraded path taken when the controller backend is unavailable.
    pub async fn spawn(options: SenderOptions, events: mpsc::Sender<StatusEvent>) -> Self {
        let (target_tx, target_rx) = watch::channel(String::new());
        let cancel = CancellationToken::new();

        let task = match BridgeWorker::create(
            options.port,
            options.source,
            target_rx,
            events,
            cancel.clone(),
        )
        .await
        {
            Ok(worker) => tokio::spawn(async move {
                worker.initialize().run().await;
            }),
            Err(e) => {
                warn!("{}", e);
                let parked = cancel.clone();
                tokio::spawn(async move { parked.cancelled().await })
            }
        };

        let handle = Self {
            target_tx,
            cancel,
            task,
        };

        if let Some(target) = options.initial_target {
            handle.set_target(&target);
        }

        handle
    }

    /// Updates the pending target host (trimmed) and wakes the worker for
    /// re-resolution. May be called at any time.
    pub fn set_target(&self, host: &str) {
        self.target_tx.send_replace(host.trim().to_string());
    }

    /// Cooperative shutdown with a bounded grace period.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            warn!("Bridge task did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::MAX_PADS;
    use crate::protocol::{PadState, ACK_PAYLOAD, WIRE_SIZE};
    use tokio::net::UdpSocket;

    /// One always-connected pad on slot 0 with a fixed snapshot.
    struct StaticPad {
        state: PadState,
    }

    impl PadSource for StaticPad {
        fn poll(&mut self, slot: usize) -> Option<PadState> {
            (slot == 0).then_some(self.state)
        }
    }

    fn static_pad(buttons: u16) -> Box<dyn PadSource + Send> {
        Box::new(StaticPad {
            state: PadState {
                packet_number: 1,
                buttons,
                ..PadState::default()
            },
        })
    }

    async fn recv_packet(socket: &UdpSocket) -> (PadState, std::net::SocketAddr) {
        let mut buf = [0u8; 64];
        let (len, peer) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram within deadline")
            .unwrap();
        assert_eq!(len, WIRE_SIZE);
        (PadState::decode(&buf[..len]).unwrap(), peer)
    }

    #[tokio::test]
    async fn sends_on_change_and_heartbeats_when_idle() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let (events, _events_rx) = mpsc::channel(64);
        let sender = SenderHandle::spawn(
            SenderOptions {
                port,
                initial_target: Some("127.0.0.1".to_string()),
                source: Some(static_pad(0x1)),
            },
            events,
        )
        .await;

        // Connect transition counts as a change: first packet arrives fast.
        let (first, _) = recv_packet(&peer).await;
        assert_eq!(first.buttons, 0x1);
        let first_number = first.packet_number;

        // The pad never changes again, but the heartbeat must keep resending
        // the same packet number at least once per report window.
        let (heartbeat, _) = recv_packet(&peer).await;
        assert_eq!(heartbeat.packet_number, first_number);
        assert_eq!(heartbeat.buttons, 0x1);

        sender.shutdown().await;
    }

    #[tokio::test]
    async fn acks_flip_connection_status_to_good() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let (events, mut events_rx) = mpsc::channel(256);
        let sender = SenderHandle::spawn(
            SenderOptions {
                port,
                initial_target: Some("127.0.0.1".to_string()),
                source: Some(static_pad(0x2)),
            },
            events,
        )
        .await;

        // Answer the first packet like the sink would.
        let (_, bridge_addr) = recv_packet(&peer).await;
        peer.send_to(ACK_PAYLOAD, bridge_addr).await.unwrap();

        // Within the next report window the connection channel must go Good.
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut saw_good = false;
        while Instant::now() < deadline {
            let next = tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
            if let Ok(Some(StatusEvent::Connection { severity, message })) = next {
                if severity == Severity::Good {
                    assert!(message.contains("packets per second"));
                    saw_good = true;
                    break;
                }
            }
        }
        assert!(saw_good, "expected a Good connection report after an ack");

        sender.shutdown().await;
    }

    #[tokio::test]
    async fn no_pads_means_no_traffic() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        struct NoPads;
        impl PadSource for NoPads {
            fn poll(&mut self, _slot: usize) -> Option<PadState> {
                None
            }
        }

        let (events, _events_rx) = mpsc::channel(64);
        let sender = SenderHandle::spawn(
            SenderOptions {
                port,
                initial_target: Some("127.0.0.1".to_string()),
                source: Some(Box::new(NoPads)),
            },
            events,
        )
        .await;

        let mut buf = [0u8; 64];
        let got = tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await;
        assert!(got.is_err(), "no connected pad must suppress transmission");

        sender.shutdown().await;
    }

    #[tokio::test]
    async fn unresolved_target_reports_empty_resolve_status() {
        let (events, mut events_rx) = mpsc::channel(64);
        let sender = SenderHandle::spawn(
            SenderOptions {
                port: PORT,
                initial_target: None,
                source: Some(Box::new(StaticPad {
                    state: PadState::default(),
                })),
            },
            events,
        )
        .await;

        let mut saw_prompt = false;
        for _ in 0..8 {
            let next = tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
            if let Ok(Some(StatusEvent::Resolve { severity, .. })) = next {
                assert_eq!(severity, Severity::None);
                saw_prompt = true;
                break;
            }
        }
        assert!(saw_prompt, "empty target must surface the enter-address prompt");

        sender.shutdown().await;
    }

    #[test]
    fn static_pad_covers_only_slot_zero() {
        let mut pad = StaticPad {
            state: PadState::default(),
        };
        assert!(pad.poll(0).is_some());
        for slot in 1..MAX_PADS {
            assert!(pad.poll(slot).is_none());
        }
    }
}
