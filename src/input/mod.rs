//! Local controller input.
//!
//! [`PadSource`] is the boundary to the platform controller backend; the
//! sender only ever talks to the trait so the combiner stays testable without
//! hardware. [`GilrsSource`] is the production implementation on top of gilrs.

pub mod combiner;

use std::collections::HashMap;

use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use tracing::{debug, info, warn};

use crate::protocol::{self, PadState};

pub use combiner::{PadCombiner, MAX_PADS};

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Failed to initialize controller backend: {0}")]
    InitializationError(String),
}

/// Boundary to the platform controller API: one snapshot per physical slot.
pub trait PadSource {
    /// Pumps the backend's event queue. Called once per poll cycle, before
    /// the per-slot polls.
    fn refresh(&mut self) {}

    /// Returns the current snapshot for a physical slot, or `None` when no
    /// controller occupies it.
    fn poll(&mut self, slot: usize) -> Option<PadState>;
}

/// Source that never reports a controller. Used when the gilrs backend
/// fails to initialize, so the sender keeps looping in a degraded state.
pub struct NullSource;

impl PadSource for NullSource {
    fn poll(&mut self, _slot: usize) -> Option<PadState> {
        None
    }
}

/// gilrs-backed [`PadSource`].
///
/// gilrs is event driven, so the source keeps one accumulated [`PadState`]
/// per gamepad and bumps its packet number on every event that touches it.
/// The first four gamepads seen are pinned to slots 0..3 in discovery order.
pub struct GilrsSource {
    gilrs: Gilrs,
    slots: [Option<GamepadId>; MAX_PADS],
    states: HashMap<GamepadId, PadState>,
}

impl GilrsSource {
    pub fn new() -> Result<Self, InputError> {
        let gilrs = Gilrs::new()
            .map_err(|e| InputError::InitializationError(e.to_string()))?;

        let mut source = Self {
            gilrs,
            slots: [None; MAX_PADS],
            states: HashMap::new(),
        };

        // Pads that were already connected at startup never produce a
        // Connected event, so enumerate them up front.
        let present: Vec<GamepadId> =
            source.gilrs.gamepads().map(|(id, _)| id).collect();
        for id in present {
            source.attach(id);
        }

        Ok(source)
    }

    fn attach(&mut self, id: GamepadId) {
        if self.slots.contains(&Some(id)) {
            return;
        }

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(id);
                self.states.insert(id, PadState::default());
                info!("Controller {} attached", id);
            }
            None => warn!("Controller {} ignored, all slots occupied", id),
        }
    }

    fn detach(&mut self, id: GamepadId) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| **slot == Some(id)) {
            *slot = None;
            self.states.remove(&id);
            info!("Controller {} detached", id);
        }
    }

    fn apply_event(&mut self, id: GamepadId, event: EventType) {
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };

        let touched = match event {
            EventType::ButtonPressed(button, _) => match button_mask(button) {
                Some(mask) => {
                    state.buttons |= mask;
                    true
                }
                None => false,
            },
            EventType::ButtonReleased(button, _) => match button_mask(button) {
                Some(mask) => {
                    state.buttons &= !mask;
                    true
                }
                None => false,
            },
            EventType::ButtonChanged(Button::LeftTrigger2, value, _) => {
                state.left_trigger = trigger_value(value);
                true
            }
            EventType::ButtonChanged(Button::RightTrigger2, value, _) => {
                state.right_trigger = trigger_value(value);
                true
            }
            EventType::AxisChanged(axis, value, _) => match axis {
                Axis::LeftStickX => {
                    state.thumb_lx = axis_value(value);
                    true
                }
                Axis::LeftStickY => {
                    state.thumb_ly = axis_value(value);
                    true
                }
                Axis::RightStickX => {
                    state.thumb_rx = axis_value(value);
                    true
                }
                Axis::RightStickY => {
                    state.thumb_ry = axis_value(value);
                    true
                }
                Axis::LeftZ => {
                    state.left_trigger = trigger_value(value);
                    true
                }
                Axis::RightZ => {
                    state.right_trigger = trigger_value(value);
                    true
                }
                _ => false,
            },
            _ => false,
        };

        if touched {
            state.packet_number = state.packet_number.wrapping_add(1);
        }
    }
}

impl PadSource for GilrsSource {
    fn refresh(&mut self) {
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            debug!("gilrs event from {}: {:?}", id, event);

            match event {
                EventType::Connected => self.attach(id),
                EventType::Disconnected => self.detach(id),
                other => self.apply_event(id, other),
            }
        }
    }

    fn poll(&mut self, slot: usize) -> Option<PadState> {
        let id = self.slots.get(slot).copied().flatten()?;
        self.states.get(&id).copied()
    }
}

fn button_mask(button: Button) -> Option<u16> {
    match button {
        Button::South => Some(protocol::BUTTON_A),
        Button::East => Some(protocol::BUTTON_B),
        Button::West => Some(protocol::BUTTON_X),
        Button::North => Some(protocol::BUTTON_Y),
        Button::Start => Some(protocol::BUTTON_START),
        Button::Select => Some(protocol::BUTTON_BACK),
        Button::Mode => Some(protocol::BUTTON_GUIDE),
        Button::LeftTrigger => Some(protocol::BUTTON_LEFT_SHOULDER),
        Button::RightTrigger => Some(protocol::BUTTON_RIGHT_SHOULDER),
        Button::LeftThumb => Some(protocol::BUTTON_LEFT_THUMB),
        Button::RightThumb => Some(protocol::BUTTON_RIGHT_THUMB),
        Button::DPadUp => Some(protocol::BUTTON_DPAD_UP),
        Button::DPadDown => Some(protocol::BUTTON_DPAD_DOWN),
        Button::DPadLeft => Some(protocol::BUTTON_DPAD_LEFT),
        Button::DPadRight => Some(protocol::BUTTON_DPAD_RIGHT),
        _ => None,
    }
}

fn trigger_value(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn axis_value(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16
}
