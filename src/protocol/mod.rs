//! Wire protocol shared by the sender and the sink.
//!
//! A packet is exactly one encoded [`PadState`] — no header, no versioning.
//! Both endpoints agree on the 16-byte little-endian layout below; anything
//! with a different length is dropped on receipt.

/// UDP port used by both address families in both directions.
pub const PORT: u16 = 6668;

/// Payload of the rate-limited acknowledgment datagram. The sender only
/// counts its arrival, the content is never inspected.
pub const ACK_PAYLOAD: &[u8; 4] = b"okay";

/// Encoded size of one [`PadState`] on the wire.
pub const WIRE_SIZE: usize = 16;

/// Sequence distance threshold, just below the u32 wraparound midpoint.
/// See [`is_newer`].
pub const SEQUENCE_THRESHOLD: u32 = 0xFFFF_FF00;

pub const BUTTON_DPAD_UP: u16 = 0x0001;
pub const BUTTON_DPAD_DOWN: u16 = 0x0002;
pub const BUTTON_DPAD_LEFT: u16 = 0x0004;
pub const BUTTON_DPAD_RIGHT: u16 = 0x0008;
pub const BUTTON_START: u16 = 0x0010;
pub const BUTTON_BACK: u16 = 0x0020;
pub const BUTTON_LEFT_THUMB: u16 = 0x0040;
pub const BUTTON_RIGHT_THUMB: u16 = 0x0080;
pub const BUTTON_LEFT_SHOULDER: u16 = 0x0100;
pub const BUTTON_RIGHT_SHOULDER: u16 = 0x0200;
pub const BUTTON_GUIDE: u16 = 0x0400;
pub const BUTTON_A: u16 = 0x1000;
pub const BUTTON_B: u16 = 0x2000;
pub const BUTTON_X: u16 = 0x4000;
pub const BUTTON_Y: u16 = 0x8000;

/// One immutable snapshot of a logical controller.
///
/// `packet_number` increases monotonically (mod 2^32) whenever the input
/// changes; receivers use it to discard stale or duplicate datagrams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PadState {
    pub packet_number: u32,
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub thumb_lx: i16,
    pub thumb_ly: i16,
    pub thumb_rx: i16,
    pub thumb_ry: i16,
}

impl PadState {
    /// Encodes the snapshot into its fixed little-endian wire form.
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.packet_number.to_le_bytes());
        buf[4..6].copy_from_slice(&self.buttons.to_le_bytes());
        buf[6] = self.left_trigger;
        buf[7] = self.right_trigger;
        buf[8..10].copy_from_slice(&self.thumb_lx.to_le_bytes());
        buf[10..12].copy_from_slice(&self.thumb_ly.to_le_bytes());
        buf[12..14].copy_from_slice(&self.thumb_rx.to_le_bytes());
        buf[14..16].copy_from_slice(&self.thumb_ry.to_le_bytes());
        buf
    }

    /// Decodes a received datagram. Returns `None` unless the payload is
    /// exactly [`WIRE_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != WIRE_SIZE {
            return None;
        }

        Some(Self {
            packet_number: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            buttons: u16::from_le_bytes(buf[4..6].try_into().ok()?),
            left_trigger: buf[6],
            right_trigger: buf[7],
            thumb_lx: i16::from_le_bytes(buf[8..10].try_into().ok()?),
            thumb_ly: i16::from_le_bytes(buf[10..12].try_into().ok()?),
            thumb_rx: i16::from_le_bytes(buf[12..14].try_into().ok()?),
            thumb_ry: i16::from_le_bytes(buf[14..16].try_into().ok()?),
        })
    }
}

/// Wraparound-tolerant sequencing rule.
///
/// `incoming` replaces `stored` iff the circular distance between the two
/// counters is positive and below [`SEQUENCE_THRESHOLD`]. This rejects
/// duplicates and reordered datagrams while still accepting a legitimate
/// wraparound of the counter.
pub fn is_newer(incoming: u32, stored: u32) -> bool {
    let dist = incoming.wrapping_sub(stored);
    dist > 0 && dist < SEQUENCE_THRESHOLD
}
