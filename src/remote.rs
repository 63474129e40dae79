//! Handheld remote read outside the session loop.
//!
//! A background reader publishes the newest axis values into a watch slot;
//! the session only ever takes the latest value, whole, with `borrow()`.

use tokio::sync::watch;

use crate::codec::{self, Frame, Modality, REMOTE_VALUES};

/// Remote axes in wire units: centre and half-range per axis
pub const AXIS_CENTER: [f32; REMOTE_VALUES] = [128.0, 128.0, 124.0, 120.0];
pub const AXIS_RANGE: [f32; REMOTE_VALUES] = [127.0, 127.0, 114.0, 107.0];

/// Stick values below this are treated as centred
pub const DEADZONE: f32 = 0.05;

/// Writer half, owned by the background reader
#[derive(Debug)]
pub struct RemoteWriter {
    tx: watch::Sender<Option<[f32; REMOTE_VALUES]>>,
}

impl RemoteWriter {
    pub fn publish(&self, values: [f32; REMOTE_VALUES]) {
        // no receivers left means the session is gone; nothing to do
        let _ = self.tx.send(Some(values));
    }

    /// Publish normalized stick positions (-1..1) as wire units
    pub fn publish_axes(&self, axes: [f32; REMOTE_VALUES]) {
        let mut values = [0.0f32; REMOTE_VALUES];
        for i in 0..REMOTE_VALUES {
            values[i] = AXIS_CENTER[i] + apply_deadzone(axes[i], DEADZONE) * AXIS_RANGE[i];
        }
        self.publish(values);
    }
}

/// Reader half, owned by the session
#[derive(Debug, Clone)]
pub struct RemoteSlot {
    rx: watch::Receiver<Option<[f32; REMOTE_VALUES]>>,
}

impl RemoteSlot {
    pub fn latest(&self) -> Option<[f32; REMOTE_VALUES]> {
        *self.rx.borrow()
    }

    /// Latest value as a remote frame; `Frame::Timeout` until the reader published once
    pub fn frame(&self) -> Frame {
        match self.latest() {
            Some(values) => Frame::new(Modality::Remote, codec::encode_f32_vec(&values)),
            None => Frame::Timeout,
        }
    }
}

pub fn remote_slot() -> (RemoteWriter, RemoteSlot) {
    let (tx, rx) = watch::channel(None);
    (RemoteWriter { tx }, RemoteSlot { rx })
}

pub fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        value.signum() * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}

#[cfg(feature = "gamepad")]
pub use gamepad::spawn_gamepad_reader;

#[cfg(feature = "gamepad")]
mod gamepad {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use gilrs::{Axis, Event, EventType, GamepadId, Gilrs};
    use tracing::{info, warn};

    use super::RemoteWriter;
    use crate::codec::REMOTE_VALUES;

    const POLL_PERIOD: Duration = Duration::from_millis(5);

    /// Axis order on the remote frame
    const AXES: [Axis; REMOTE_VALUES] = [
        Axis::LeftStickX,
        Axis::LeftStickY,
        Axis::RightStickX,
        Axis::RightStickY,
    ];

    struct GamepadRemote {
        gilrs: Gilrs,
        gamepad_id: Option<GamepadId>,
        axes: [f32; REMOTE_VALUES],
    }

    impl GamepadRemote {
        fn new() -> Result<Self> {
            let gilrs =
                Gilrs::new().map_err(|e| anyhow!("Failed to initialize gamepad system: {}", e))?;
            let gamepad_id = gilrs
                .gamepads()
                .find(|(_, g)| g.is_connected())
                .map(|(id, g)| {
                    info!("✓ Remote gamepad connected: {}", g.name());
                    id
                });
            Ok(Self {
                gilrs,
                gamepad_id,
                axes: [0.0; REMOTE_VALUES],
            })
        }

        /// Process pending events; true when axes changed
        fn update(&mut self) -> bool {
            let mut changed = false;
            while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
                match event {
                    EventType::Connected if self.gamepad_id.is_none() => {
                        info!("✓ Remote gamepad connected: {}", self.gilrs.gamepad(id).name());
                        self.gamepad_id = Some(id);
                    }
                    EventType::Disconnected if Some(id) == self.gamepad_id => {
                        warn!("Remote gamepad disconnected");
                        self.gamepad_id = None;
                    }
                    EventType::AxisChanged(axis, value, _) if Some(id) == self.gamepad_id => {
                        if let Some(i) = AXES.iter().position(|a| *a == axis) {
                            self.axes[i] = value;
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }
            changed
        }
    }

    /// Poll the first connected gamepad on an OS thread until `shutdown` is set
    pub fn spawn_gamepad_reader(
        writer: RemoteWriter,
        shutdown: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("remote-gamepad".to_string())
            .spawn(move || {
                let mut remote = match GamepadRemote::new() {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!("Remote gamepad unavailable: {:#}", e);
                        return;
                    }
                };
                while !shutdown.load(Ordering::SeqCst) {
                    if remote.update() {
                        writer.publish_axes(remote.axes);
                    }
                    std::thread::sleep(POLL_PERIOD);
                }
            })
            .context("Failed to spawn gamepad thread")
    }
}
