//! gilrs-backed gamepad source
//!
//! Polls the first connected gamepad, folds every hardware event into a
//! [`ControllerState`] and hands a full snapshot to an [`EventSink`] once per
//! poll interval (30 ms by default).
//!
//! # State Machine
//!
//! ```text
//! Initializing ──initialize()──► Polling ──shutdown──► (thread exits)
//! ```
//!
//! gilrs contexts are tied to the thread that created them, so the source
//! runs on its own OS thread rather than a tokio task. Submitting to the
//! sink never blocks on the network.

use super::{AxisType, ButtonType, ControllerInput, ControllerState, TriggerType};
use crate::config::SourceSettings;
use crate::event::EventSink;
use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use statum::{machine, state};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to initialize gamepad source: {0}")]
    InitializationError(String),

    #[error("Gamepad thread error: {0}")]
    ThreadError(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum SourceState {
    Initializing,
    Polling,
}

#[machine]
pub struct GamepadSource<S: SourceState> {
    gilrs: Gilrs,
    active_gamepad: Option<GamepadId>,
    settings: SourceSettings,
    controller: ControllerState,
}

impl<S: SourceState> GamepadSource<S> {
    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }
}

impl GamepadSource<Initializing> {
    pub fn create(settings: SourceSettings) -> Result<Self, SourceError> {
        debug!("Creating gamepad source with settings: {:?}", settings);
        let gilrs = Gilrs::new().map_err(|e| {
            error!("Failed to initialize gilrs: {}", e);
            SourceError::InitializationError(e.to_string())
        })?;
        info!("Successfully initialized gilrs");

        Ok(Self::new(gilrs, None, settings, ControllerState::default()))
    }

    /// Picks the first connected gamepad and starts polling
    pub fn initialize(mut self) -> GamepadSource<Polling> {
        let mut count = 0;
        for (id, gamepad) in self.gilrs.gamepads() {
            info!("  [{}] ID: {}, Name: {}", count, id, gamepad.name());
            if self.active_gamepad.is_none() {
                self.active_gamepad = Some(id);
            }
            count += 1;
        }

        match self.active_gamepad {
            Some(id) => info!("Selected gamepad {} out of {}", id, count),
            None => warn!("No gamepad connected, waiting for one"),
        }
        self.transition()
    }
}

impl GamepadSource<Polling> {
    pub fn active_gamepad(&self) -> Option<GamepadId> {
        self.active_gamepad
    }

    /// Drains pending hardware events into the controller state
    fn drain_events(&mut self) {
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            match event {
                EventType::Connected if self.active_gamepad.is_none() => {
                    info!("Gamepad {} connected, selecting it", id);
                    self.active_gamepad = Some(id);
                    self.controller.reset();
                    continue;
                }
                EventType::Disconnected if self.active_gamepad == Some(id) => {
                    warn!("Active gamepad {} disconnected", id);
                    self.active_gamepad = None;
                    self.controller.reset();
                    continue;
                }
                _ => {}
            }

            if self.active_gamepad != Some(id) {
                continue;
            }
            if let Some(input) = map_gilrs_event(event) {
                debug!("Controller input: {:?}", input);
                self.controller
                    .apply(input, self.settings.joystick_deadzone);
            }
        }
    }

    /// Runs until `shutdown` is cancelled, emitting one sample per interval
    pub fn run_polling_loop(&mut self, sink: &dyn EventSink, shutdown: &CancellationToken) {
        info!(
            "Starting gamepad polling every {}ms",
            self.settings.poll_interval_ms
        );
        let interval = self.settings.poll_interval();
        let mut next_emit = Instant::now();
        let mut emitted = 0u64;
        let mut last_log = Instant::now();

        while !shutdown.is_cancelled() {
            self.drain_events();

            let now = Instant::now();
            if now >= next_emit {
                next_emit = now + interval;
                if self.active_gamepad.is_some() {
                    sink.submit(self.controller.snapshot());
                    emitted += 1;
                }
            }

            if now.duration_since(last_log) >= STATS_INTERVAL {
                info!(
                    "Gamepad source stats: emitted {} samples in last {} seconds",
                    emitted,
                    STATS_INTERVAL.as_secs()
                );
                emitted = 0;
                last_log = now;
            }

            std::thread::sleep(IDLE_SLEEP);
        }
        info!("Gamepad polling stopped");
    }
}

/// Running gamepad thread
pub struct GamepadHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl GamepadHandle {
    /// Starts polling on a dedicated thread
    ///
    /// Waits until gilrs is up so initialization failures surface here.
    pub fn spawn(
        settings: SourceSettings,
        sink: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, SourceError> {
        info!("Spawning gamepad source with settings: {:?}", settings);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), SourceError>>(1);
        let token = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("gamepad-source".to_string())
            .spawn(move || {
                let source = match GamepadSource::create(settings) {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut polling = source.initialize();
                polling.run_polling_loop(sink.as_ref(), &token);
            })
            .map_err(|e| SourceError::ThreadError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                thread: Some(thread),
                shutdown,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(e) => Err(SourceError::ThreadError(format!(
                "gamepad thread exited during startup: {}",
                e
            ))),
        }
    }

    /// Stops polling and waits for the thread to finish
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Gamepad thread panicked");
            }
        }
    }
}

impl Drop for GamepadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_gilrs_event(event: EventType) -> Option<ControllerInput> {
    match event {
        EventType::ButtonPressed(button, _) => map_button(button).map(|button| {
            ControllerInput::Button {
                button,
                pressed: true,
            }
        }),
        EventType::ButtonReleased(button, _) => map_button(button).map(|button| {
            ControllerInput::Button {
                button,
                pressed: false,
            }
        }),
        // Analog triggers report through ButtonChanged on most backends
        EventType::ButtonChanged(Button::LeftTrigger2, value, _) => {
            Some(ControllerInput::Trigger {
                trigger: TriggerType::Left,
                value,
            })
        }
        EventType::ButtonChanged(Button::RightTrigger2, value, _) => {
            Some(ControllerInput::Trigger {
                trigger: TriggerType::Right,
                value,
            })
        }
        EventType::AxisChanged(axis, value, _) => map_axis(axis, value),
        _ => None,
    }
}

fn map_axis(axis: Axis, value: f32) -> Option<ControllerInput> {
    let axis_input = |axis| Some(ControllerInput::Axis { axis, value });
    match axis {
        Axis::LeftStickX => axis_input(AxisType::LeftX),
        Axis::LeftStickY => axis_input(AxisType::LeftY),
        Axis::RightStickX => axis_input(AxisType::RightX),
        Axis::RightStickY => axis_input(AxisType::RightY),
        Axis::LeftZ => Some(ControllerInput::Trigger {
            trigger: TriggerType::Left,
            value,
        }),
        Axis::RightZ => Some(ControllerInput::Trigger {
            trigger: TriggerType::Right,
            value,
        }),
        _ => None,
    }
}

fn map_button(button: Button) -> Option<ButtonType> {
    match button {
        Button::South => Some(ButtonType::A),
        Button::East => Some(ButtonType::B),
        Button::West => Some(ButtonType::X),
        Button::North => Some(ButtonType::Y),
        Button::LeftTrigger => Some(ButtonType::LeftBumper),
        Button::RightTrigger => Some(ButtonType::RightBumper),
        Button::Select => Some(ButtonType::Back),
        Button::Start => Some(ButtonType::Start),
        Button::Mode => Some(ButtonType::Guide),
        Button::LeftThumb => Some(ButtonType::LeftStick),
        Button::RightThumb => Some(ButtonType::RightStick),
        Button::DPadUp => Some(ButtonType::DPadUp),
        Button::DPadDown => Some(ButtonType::DPadDown),
        Button::DPadLeft => Some(ButtonType::DPadLeft),
        Button::DPadRight => Some(ButtonType::DPadRight),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_buttons_follow_xbox_layout() {
        assert_eq!(map_button(Button::South), Some(ButtonType::A));
        assert_eq!(map_button(Button::East), Some(ButtonType::B));
        assert_eq!(map_button(Button::West), Some(ButtonType::X));
        assert_eq!(map_button(Button::North), Some(ButtonType::Y));
        assert_eq!(map_button(Button::LeftTrigger2), None);
    }

    #[test]
    fn z_axes_become_triggers() {
        assert_eq!(
            map_axis(Axis::LeftZ, 0.5),
            Some(ControllerInput::Trigger {
                trigger: TriggerType::Left,
                value: 0.5
            })
        );
        assert_eq!(
            map_axis(Axis::RightStickY, -0.25),
            Some(ControllerInput::Axis {
                axis: AxisType::RightY,
                value: -0.25
            })
        );
        assert_eq!(map_axis(Axis::DPadX, 1.0), None);
    }
}
