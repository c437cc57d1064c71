//! Merges up to four physical controllers into one logical controller.

use crate::protocol::PadState;

use super::PadSource;

/// Number of physical controller slots.
pub const MAX_PADS: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    connected: bool,
    prev_connected: bool,
    state: PadState,
    prev_state: PadState,
}

/// Poll-cycle state of the combiner.
///
/// Every [`poll_cycle`](PadCombiner::poll_cycle) re-polls all slots and
/// synthesizes the combined snapshot from scratch: buttons ORed together,
/// triggers by maximum, each stick axis independently by larger magnitude.
/// The combined packet number advances by exactly one per cycle in which any
/// slot's packet number or connectivity changed, so it is itself a valid
/// wraparound-safe counter for the receiving side.
pub struct PadCombiner {
    slots: [SlotState; MAX_PADS],
    combined: PadState,
    connected: bool,
    connected_mask: u8,
}

impl Default for PadCombiner {
    fn default() -> Self {
        Self::new()
    }
}

impl PadCombiner {
    pub fn new() -> Self {
        Self {
            slots: [SlotState::default(); MAX_PADS],
            combined: PadState::default(),
            connected: false,
            connected_mask: 0,
        }
    }

    /// Runs one poll cycle against `source`. Returns whether any physical
    /// input or connectivity changed since the previous cycle.
    pub fn poll_cycle(&mut self, source: &mut dyn PadSource) -> bool {
        source.refresh();

        let mut changed = false;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            slot.prev_state = slot.state;
            slot.prev_connected = slot.connected;

            match source.poll(index) {
                Some(state) => {
                    if state.packet_number != slot.prev_state.packet_number {
                        changed = true;
                    }
                    if !slot.prev_connected {
                        changed = true;
                    }
                    slot.state = state;
                    slot.connected = true;
                }
                None => {
                    if slot.prev_connected {
                        changed = true;
                    }
                    // A departed pad must not leave stale input behind.
                    slot.state = PadState::default();
                    slot.connected = false;
                }
            }
        }

        let prev_number = self.combined.packet_number;

        let mut combined = PadState::default();
        let mut connected = false;
        let mut mask = 0u8;

        for (index, slot) in self.slots.iter().enumerate() {
            connected |= slot.connected;
            mask |= u8::from(slot.connected) << index;

            combined.buttons |= slot.state.buttons;
            combined.left_trigger = combined.left_trigger.max(slot.state.left_trigger);
            combined.right_trigger = combined.right_trigger.max(slot.state.right_trigger);

            max_magnitude(&mut combined.thumb_lx, slot.state.thumb_lx);
            max_magnitude(&mut combined.thumb_ly, slot.state.thumb_ly);
            max_magnitude(&mut combined.thumb_rx, slot.state.thumb_rx);
            max_magnitude(&mut combined.thumb_ry, slot.state.thumb_ry);
        }

        combined.packet_number = prev_number.wrapping_add(u32::from(changed));

        self.combined = combined;
        self.connected = connected;
        self.connected_mask = mask;

        changed
    }

    /// The combined snapshot from the most recent cycle.
    pub fn combined(&self) -> &PadState {
        &self.combined
    }

    /// Whether at least one physical controller is connected.
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Bitmask of occupied slots, bit N for slot N.
    pub fn connected_mask(&self) -> u8 {
        self.connected_mask
    }
}

/// Per-axis merge: the value with the larger absolute magnitude wins. Axes
/// are compared independently, never coupled across axes of one controller.
fn max_magnitude(current: &mut i16, candidate: i16) {
    if current.unsigned_abs() < candidate.unsigned_abs() {
        *current = candidate;
    }
}
