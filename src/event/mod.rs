//! Canonical controller sample shared by every input source and the transport
//!
//! An [`InputEvent`] is one snapshot of a controller: which buttons are held,
//! where the analog sticks sit and how far the triggers are pulled. Sources
//! with very different raw formats (gilrs gamepads, HID polling, raw
//! Bluetooth reports) all normalise into this shape before handing a sample
//! to the transport.
//!
//! # Wire shape
//!
//! ```text
//! {"buttons": {"A": 1}, "axes": {"left_x": -0.5}, "triggers": {"lt": 0.25}}
//! ```
//!
//! Maps are ordered so the serialized form is stable for a given sample.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pressed / released as it travels on the wire
pub const PRESSED: u8 = 1;
pub const RELEASED: u8 = 0;

/// One immutable controller sample
///
/// Built through [`InputEvent::builder`], which clamps every analog value into
/// its normalized range. Once built the sample cannot be changed; the
/// transport consumes it exactly once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    #[serde(default)]
    buttons: BTreeMap<String, u8>,
    #[serde(default)]
    axes: BTreeMap<String, f64>,
    #[serde(default)]
    triggers: BTreeMap<String, f64>,
}

impl InputEvent {
    pub fn builder() -> InputEventBuilder {
        InputEventBuilder::default()
    }

    /// Button name to pressed-state (0 or 1)
    pub fn buttons(&self) -> &BTreeMap<String, u8> {
        &self.buttons
    }

    /// Axis name to value in [-1.0, 1.0]
    pub fn axes(&self) -> &BTreeMap<String, f64> {
        &self.axes
    }

    /// Trigger name to value in [0.0, 1.0]
    pub fn triggers(&self) -> &BTreeMap<String, f64> {
        &self.triggers
    }

    pub fn is_pressed(&self, button: &str) -> bool {
        self.buttons.get(button).is_some_and(|state| *state != RELEASED)
    }

    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty() && self.axes.is_empty() && self.triggers.is_empty()
    }

    /// Re-applies range normalization to a sample that came off the wire
    ///
    /// Peers may send anything; the receiving side calls this before trusting
    /// the values.
    pub fn normalized(self) -> Self {
        let mut builder = InputEventBuilder::default();
        for (name, state) in self.buttons {
            builder = builder.button(name, state != RELEASED);
        }
        for (name, value) in self.axes {
            builder = builder.axis(name, value);
        }
        for (name, value) in self.triggers {
            builder = builder.trigger(name, value);
        }
        builder.build()
    }
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pressed: Vec<&str> = self
            .buttons
            .iter()
            .filter(|(_, state)| **state != RELEASED)
            .map(|(name, _)| name.as_str())
            .collect();
        write!(
            f,
            "pressed=[{}] axes={} triggers={}",
            pressed.join(","),
            self.axes.len(),
            self.triggers.len()
        )
    }
}

/// Accumulates a sample before it is frozen into an [`InputEvent`]
#[derive(Debug, Default)]
pub struct InputEventBuilder {
    buttons: BTreeMap<String, u8>,
    axes: BTreeMap<String, f64>,
    triggers: BTreeMap<String, f64>,
}

impl InputEventBuilder {
    pub fn button(mut self, name: impl Into<String>, pressed: bool) -> Self {
        let state = if pressed { PRESSED } else { RELEASED };
        self.buttons.insert(name.into(), state);
        self
    }

    /// Axis values outside [-1.0, 1.0] are clamped, NaN becomes 0.0
    pub fn axis(mut self, name: impl Into<String>, value: f64) -> Self {
        self.axes.insert(name.into(), clamp_or_zero(value, -1.0, 1.0));
        self
    }

    /// Trigger values outside [0.0, 1.0] are clamped, NaN becomes 0.0
    pub fn trigger(mut self, name: impl Into<String>, value: f64) -> Self {
        self.triggers
            .insert(name.into(), clamp_or_zero(value, 0.0, 1.0));
        self
    }

    pub fn build(self) -> InputEvent {
        InputEvent {
            buttons: self.buttons,
            axes: self.axes,
            triggers: self.triggers,
        }
    }
}

fn clamp_or_zero(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(min, max)
    }
}

/// Anything that accepts controller samples for delivery
///
/// Producers only ever see this seam. Implementations must return without
/// waiting on network I/O.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: InputEvent);
}
