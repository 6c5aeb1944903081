//! Input sources that produce [`InputEvent`] samples
//!
//! ```text
//! gilrs ──► ControllerInput ──► ControllerState ──snapshot every poll──► EventSink
//! ```
//!
//! [`gamepad`] owns the hardware side. Everything in this module is plain
//! state tracking so it can be exercised without a controller attached.

pub mod gamepad;

pub use gamepad::{GamepadHandle, GamepadSource, SourceError};

use crate::event::InputEvent;
use std::collections::BTreeMap;

/// Canonical button names understood by the consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ButtonType {
    A,
    B,
    X,
    Y,
    LeftBumper,
    RightBumper,
    Back,
    Start,
    Guide,
    LeftStick,
    RightStick,
    DPadUp,
    DPadDown,
    DPadLeft,
    DPadRight,
}

impl ButtonType {
    pub const ALL: [ButtonType; 15] = [
        ButtonType::A,
        ButtonType::B,
        ButtonType::X,
        ButtonType::Y,
        ButtonType::LeftBumper,
        ButtonType::RightBumper,
        ButtonType::Back,
        ButtonType::Start,
        ButtonType::Guide,
        ButtonType::LeftStick,
        ButtonType::RightStick,
        ButtonType::DPadUp,
        ButtonType::DPadDown,
        ButtonType::DPadLeft,
        ButtonType::DPadRight,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ButtonType::A => "A",
            ButtonType::B => "B",
            ButtonType::X => "X",
            ButtonType::Y => "Y",
            ButtonType::LeftBumper => "L",
            ButtonType::RightBumper => "R",
            ButtonType::Back => "BACK",
            ButtonType::Start => "START",
            ButtonType::Guide => "GUIDE",
            ButtonType::LeftStick => "LSTICK",
            ButtonType::RightStick => "RSTICK",
            ButtonType::DPadUp => "DPAD_UP",
            ButtonType::DPadDown => "DPAD_DOWN",
            ButtonType::DPadLeft => "DPAD_LEFT",
            ButtonType::DPadRight => "DPAD_RIGHT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxisType {
    LeftX,
    LeftY,
    RightX,
    RightY,
}

impl AxisType {
    pub fn name(self) -> &'static str {
        match self {
            AxisType::LeftX => "left_x",
            AxisType::LeftY => "left_y",
            AxisType::RightX => "right_x",
            AxisType::RightY => "right_y",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerType {
    Left,
    Right,
}

impl TriggerType {
    pub fn name(self) -> &'static str {
        match self {
            TriggerType::Left => "lt",
            TriggerType::Right => "rt",
        }
    }
}

/// One decoded change reported by the hardware layer
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControllerInput {
    Button { button: ButtonType, pressed: bool },
    Axis { axis: AxisType, value: f32 },
    Trigger { trigger: TriggerType, value: f32 },
}

/// Latest known position of every control
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControllerState {
    buttons: BTreeMap<ButtonType, bool>,
    left_x: f32,
    left_y: f32,
    right_x: f32,
    right_y: f32,
    left_trigger: f32,
    right_trigger: f32,
}

impl ControllerState {
    pub fn apply(&mut self, input: ControllerInput, deadzone: f32) {
        match input {
            ControllerInput::Button { button, pressed } => {
                self.buttons.insert(button, pressed);
            }
            ControllerInput::Axis { axis, value } => {
                let value = apply_deadzone(value, deadzone);
                match axis {
                    AxisType::LeftX => self.left_x = value,
                    AxisType::LeftY => self.left_y = value,
                    AxisType::RightX => self.right_x = value,
                    AxisType::RightY => self.right_y = value,
                }
            }
            ControllerInput::Trigger { trigger, value } => {
                let value = apply_deadzone(value, deadzone).max(0.0);
                match trigger {
                    TriggerType::Left => self.left_trigger = value,
                    TriggerType::Right => self.right_trigger = value,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Full sample: every button, both sticks and both triggers
    pub fn snapshot(&self) -> InputEvent {
        let mut builder = InputEvent::builder();
        for button in ButtonType::ALL {
            let pressed = self.buttons.get(&button).copied().unwrap_or(false);
            builder = builder.button(button.name(), pressed);
        }
        builder
            .axis(AxisType::LeftX.name(), self.left_x as f64)
            .axis(AxisType::LeftY.name(), self.left_y as f64)
            .axis(AxisType::RightX.name(), self.right_x as f64)
            .axis(AxisType::RightY.name(), self.right_y as f64)
            .trigger(TriggerType::Left.name(), self.left_trigger as f64)
            .trigger(TriggerType::Right.name(), self.right_trigger as f64)
            .build()
    }
}

/// Zeroes values inside the deadzone and rescales the rest to the full range
pub fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadzone_zeroes_small_values_and_rescales() {
        assert_eq!(apply_deadzone(0.04, 0.05), 0.0);
        assert_eq!(apply_deadzone(-0.04, 0.05), 0.0);
        assert!((apply_deadzone(1.0, 0.05) - 1.0).abs() < 1e-6);
        assert!((apply_deadzone(-0.525, 0.05) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn snapshot_carries_full_state() {
        let mut state = ControllerState::default();
        state.apply(
            ControllerInput::Button {
                button: ButtonType::A,
                pressed: true,
            },
            0.05,
        );
        state.apply(
            ControllerInput::Axis {
                axis: AxisType::LeftX,
                value: 1.0,
            },
            0.05,
        );
        state.apply(
            ControllerInput::Trigger {
                trigger: TriggerType::Right,
                value: 0.02,
            },
            0.05,
        );

        let event = state.snapshot();
        assert_eq!(event.buttons().len(), ButtonType::ALL.len());
        assert!(event.is_pressed("A"));
        assert!(!event.is_pressed("DPAD_UP"));
        assert!((event.axes()["left_x"] - 1.0).abs() < 1e-6);
        assert_eq!(event.axes()["right_y"], 0.0);
        assert_eq!(event.triggers()["rt"], 0.0);
        assert_eq!(event.triggers().len(), 2);
    }

    #[test]
    fn release_and_reset_clear_buttons() {
        let mut state = ControllerState::default();
        let press = |pressed| ControllerInput::Button {
            button: ButtonType::Start,
            pressed,
        };
        state.apply(press(true), 0.0);
        assert!(state.snapshot().is_pressed("START"));
        state.apply(press(false), 0.0);
        assert!(!state.snapshot().is_pressed("START"));

        state.apply(press(true), 0.0);
        state.reset();
        assert_eq!(state, ControllerState::default());
    }
}
