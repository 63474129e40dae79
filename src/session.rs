//! Session state machine driven by the simulator's handshake flags.
//!
//! ```text
//! Idle -> Acquiring | Controlling | Avatar -> Flushing -> Done
//! ```
//!
//! Every tick reads the input device, then one flag. The mode's ready flag
//! processes the frame and advances the counter, `q` ends the session, and so
//! do the reading limit, the idle timeout and Ctrl-C. Flushing always runs, so
//! buffered samples reach disk even when the loop stopped on an error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, Decoded, Frame, HandshakeFlag};
use crate::command::CommandVector;
use crate::config::{InputDevice, RuntimeConfig};
use crate::error::PipelineError;
use crate::imu::{ImuAngles, WrapGuard};
use crate::kinematics::{preprocess, KinematicChain, Pose, PoseSnapshots, ReferencePose};
use crate::mapper::ControlMapper;
use crate::modality::{select_modality, InputModality, Reading};
use crate::observation::Observation;
use crate::recorder::{self, AcquisitionRecorder, ControlRecorder};
use crate::remote::RemoteSlot;
use crate::transport::{Channel, Transport};

/// Log a progress line every this many accepted frames
const REPORT_EVERY: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SessionMode {
    /// Record calibration maneuvers to disk
    Acquisition,
    /// Map live input to simulator commands
    Control,
    /// Forward the skeleton on render requests
    Avatar,
}

impl SessionMode {
    /// Flag meaning "process this frame" in this mode
    pub fn ready_flag(&self) -> HandshakeFlag {
        match self {
            SessionMode::Acquisition => HandshakeFlag::Acquire,
            SessionMode::Control => HandshakeFlag::Control,
            SessionMode::Avatar => HandshakeFlag::Render,
        }
    }

    fn running_state(&self) -> SessionState {
        match self {
            SessionMode::Acquisition => SessionState::Acquiring,
            SessionMode::Control => SessionState::Controlling,
            SessionMode::Avatar => SessionState::Avatar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Controlling,
    Avatar,
    Flushing,
    Done,
}

/// Why the running state ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Quit,
    ReadingLimit,
    IdleTimeout,
    Shutdown,
    /// Acquisition data already on disk for this subject, device and instance
    ExistingData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Process exit status: 0 success, 1 acquisition collision
    pub status: i32,
    pub reason: ExitReason,
    pub frames: u64,
    pub written: Vec<PathBuf>,
}

/// Mutable per-process calibration state, owned by the session
#[derive(Debug, Default)]
pub struct SessionContext {
    /// First relativized pose; captured once
    pub reference: ReferencePose,
    pub wrap_guard: WrapGuard,
    /// Last successfully decoded input reading
    pub last_reading: Option<Reading>,
    /// Last accepted simulator calibration sample
    pub last_calibration: Option<Vec<f64>>,
    /// Intermediate poses of the last preprocessed frame
    pub last_snapshots: Option<PoseSnapshots>,
}

enum Tick {
    Idle,
    Accepted,
    Skipped,
    Quit,
}

/// Channels a session reads from, given its mode and bench-test switches
pub fn channels_for(config: &RuntimeConfig, mode: SessionMode) -> Vec<Channel> {
    let mut channels = Vec::new();
    let gamepad = config.input_device == InputDevice::Remote
        && config.remote_source == crate::config::RemoteSource::Gamepad;
    if !config.dummy_read && !gamepad {
        channels.push(select_modality(config).channel());
    }
    if !config.simulate_flag {
        channels.push(Channel::SimulatorFlag);
    }
    if mode == SessionMode::Acquisition && !config.dummy_simulator {
        channels.push(Channel::SimulatorCalibration);
    }
    channels
}

pub struct Session<T: Transport> {
    config: RuntimeConfig,
    mode: SessionMode,
    transport: T,
    input: Box<dyn InputModality>,
    chain: KinematicChain,
    mapper: Option<ControlMapper>,
    remote: Option<RemoteSlot>,
    context: SessionContext,
    state: SessionState,
    frames: u64,
    last_accepted: Option<Instant>,
    started: Instant,
    shutdown: Arc<AtomicBool>,
    acquisition: AcquisitionRecorder,
    control: ControlRecorder,
}

impl<T: Transport> Session<T> {
    pub fn new(
        config: RuntimeConfig,
        mode: SessionMode,
        transport: T,
        mapper: Option<ControlMapper>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        if mode == SessionMode::Control && mapper.is_none() {
            bail!("control session needs a control mapper");
        }
        if mode == SessionMode::Avatar && !config.input_device.is_pose() {
            bail!(
                "avatar mode forwards a skeleton, `{}` has none",
                config.input_device.as_str()
            );
        }

        let input = select_modality(&config);
        let chain = KinematicChain::from_config(&config.body_parts);
        let acquisition =
            AcquisitionRecorder::new(input.raw_columns(), config.calibration_columns.clone());
        let control = ControlRecorder::new(&config.regression_outputs);

        Ok(Self {
            config,
            mode,
            transport,
            input,
            chain,
            mapper,
            remote: None,
            context: SessionContext::default(),
            state: SessionState::Idle,
            frames: 0,
            last_accepted: None,
            started: Instant::now(),
            shutdown,
            acquisition,
            control,
        })
    }

    /// Read remote samples from a background reader instead of the socket
    pub fn with_remote(mut self, slot: RemoteSlot) -> Self {
        self.remote = Some(slot);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until quit, then flush. Errors from the loop are returned after flushing.
    pub async fn run(&mut self) -> Result<SessionOutcome> {
        if self.mode == SessionMode::Acquisition {
            let folder = self.config.subject_folder();
            let existing = recorder::existing_acquisitions(&folder, self.config.instance)?;
            if let Some(first) = existing.first() {
                warn!(
                    "Data for instance {} already exists ({}); delete it or pick another instance",
                    self.config.instance,
                    first.display()
                );
                self.transport.close().await;
                self.state = SessionState::Done;
                return Ok(SessionOutcome {
                    status: 1,
                    reason: ExitReason::ExistingData,
                    frames: 0,
                    written: Vec::new(),
                });
            }
        }

        self.state = self.mode.running_state();
        self.started = Instant::now();
        info!(
            "Session started: {:?} with {} input",
            self.mode,
            self.input.device().as_str()
        );

        let looped = self.run_loop().await;

        self.state = SessionState::Flushing;
        let flushed = self.flush().await;
        self.transport.close().await;
        self.state = SessionState::Done;

        let reason = looped?;
        let written = flushed?;
        info!(
            "Session done after {} frames ({:?}, {:.1}s)",
            self.frames,
            reason,
            self.started.elapsed().as_secs_f64()
        );
        Ok(SessionOutcome {
            status: 0,
            reason,
            frames: self.frames,
            written,
        })
    }

    async fn run_loop(&mut self) -> Result<ExitReason> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(ExitReason::Shutdown);
            }
            if let Some(limit) = self.config.n_readings {
                if self.frames >= limit {
                    return Ok(ExitReason::ReadingLimit);
                }
            }
            if let Some(last) = self.last_accepted {
                if last.elapsed() > self.config.idle_timeout() {
                    info!(
                        "No frame accepted for {} ms, ending session",
                        self.config.idle_timeout_ms
                    );
                    return Ok(ExitReason::IdleTimeout);
                }
            }

            match self.tick().await? {
                Tick::Quit => return Ok(ExitReason::Quit),
                Tick::Accepted => {
                    self.last_accepted = Some(Instant::now());
                    self.frames += 1;
                    if self.frames % REPORT_EVERY == 0 {
                        let elapsed = self.started.elapsed().as_secs_f64();
                        info!(
                            "⏱️  {} frames in {:.1}s ({:.1} Hz)",
                            self.frames,
                            elapsed,
                            self.frames as f64 / elapsed.max(f64::EPSILON)
                        );
                    }
                }
                Tick::Idle | Tick::Skipped => {}
            }
        }
    }

    async fn tick(&mut self) -> Result<Tick> {
        let frame = self.read_input().await?;
        self.take_reading(&frame);

        let flag = match self.read_flag().await {
            Ok(Some(flag)) => flag,
            Ok(None) => return Ok(Tick::Idle),
            Err(e) => {
                let recoverable = e
                    .downcast_ref::<PipelineError>()
                    .map(PipelineError::is_recoverable)
                    .unwrap_or(false);
                if recoverable {
                    warn!("{:#}, skipping tick", e);
                    return Ok(Tick::Skipped);
                }
                return Err(e);
            }
        };

        if flag == HandshakeFlag::Quit {
            info!("Quit flag received");
            return Ok(Tick::Quit);
        }
        if flag != self.mode.ready_flag() {
            debug!("Ignoring {:?} flag in {:?} mode", flag, self.mode);
            return Ok(Tick::Skipped);
        }

        match self.mode {
            SessionMode::Acquisition => self.acquire().await,
            SessionMode::Control => self.control().await,
            SessionMode::Avatar => self.render().await,
        }
    }

    async fn read_input(&mut self) -> Result<Frame> {
        if self.config.dummy_read {
            return Ok(Frame::new(self.input.modality(), self.input.dummy_frame()));
        }
        if let Some(slot) = &self.remote {
            return Ok(slot.frame());
        }
        self.transport.recv(self.input.channel()).await
    }

    /// Decode the input frame; a good reading replaces the last-known one
    fn take_reading(&mut self, frame: &Frame) {
        match self.input.decode(frame) {
            Decoded::Ok(reading) => self.context.last_reading = Some(reading),
            Decoded::Timeout => {}
            Decoded::SizeMismatch { expected, got } => {
                warn!(
                    "{:?} frame is {} bytes, expected {}; no reading this tick",
                    self.input.modality(),
                    got,
                    expected
                );
            }
            Decoded::Malformed(reason) => {
                warn!("Malformed {:?} frame: {}", self.input.modality(), reason);
            }
        }
    }

    async fn read_flag(&mut self) -> Result<Option<HandshakeFlag>> {
        if self.config.simulate_flag {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.simulated_tick_ms))
                .await;
            return Ok(Some(self.mode.ready_flag()));
        }
        let frame = self.transport.recv(Channel::SimulatorFlag).await?;
        Ok(codec::decode_flag(&frame)?)
    }

    /// Simulator calibration sample; reuses the previous one on a bad read
    async fn read_calibration(&mut self) -> Result<Vec<f64>> {
        let n = self.config.calibration_columns.len();
        if self.config.dummy_simulator {
            return Ok(vec![0.0; n]);
        }

        let frame = self.transport.recv(Channel::SimulatorCalibration).await?;
        let decoded = match frame.bytes() {
            None => Decoded::Timeout,
            Some(bytes) => codec::decode_f32_vec(bytes, n),
        };
        match decoded {
            Decoded::Ok(values) => {
                let values: Vec<f64> = values.into_iter().map(|v| v as f64).collect();
                self.context.last_calibration = Some(values.clone());
                Ok(values)
            }
            other => {
                if let Decoded::SizeMismatch { expected, got } = other {
                    warn!(
                        "Calibration frame is {} bytes, expected {}; reusing previous sample",
                        got, expected
                    );
                }
                Ok(self
                    .context
                    .last_calibration
                    .clone()
                    .unwrap_or_else(|| vec![0.0; n]))
            }
        }
    }

    /// Canonical observation for `reading`, running the kinematic chain for pose devices
    fn observe(&mut self, reading: &Reading) -> Result<Observation, PipelineError> {
        let names = self.input.feature_names();
        if let Some(joints) = reading.joints() {
            let base =
                Pose::from_joints(&self.chain, &joints).map_err(PipelineError::MissingFeature)?;
            let snapshots = preprocess(base, &self.chain, &mut self.context.reference);
            let obs = Observation::from_euler(names, &snapshots.euler);
            self.context.last_snapshots = Some(snapshots);
            return Ok(obs);
        }

        let values = match reading {
            Reading::Values(values) if self.config.input_device == InputDevice::Imu => {
                let raw = [values[0], values[1], values[2]];
                self.context
                    .wrap_guard
                    .apply(ImuAngles::from_array(raw))
                    .to_array()
                    .to_vec()
            }
            Reading::Values(values) => values.clone(),
            _ => Vec::new(),
        };
        Ok(Observation::new(names, values))
    }

    async fn acquire(&mut self) -> Result<Tick> {
        let Some(reading) = self.context.last_reading.clone() else {
            warn!("No input reading yet, skipping acquisition tick");
            return Ok(Tick::Skipped);
        };
        if self.config.input_device.is_pose() {
            // keep the reference pose and snapshots current for a later control phase
            self.observe(&reading)?;
        }
        let calibration = self.read_calibration().await?;
        let row = self.input.raw_row(&reading);
        self.acquisition.push(self.frames, row, calibration);
        Ok(Tick::Accepted)
    }

    async fn control(&mut self) -> Result<Tick> {
        let reading = self
            .context
            .last_reading
            .clone()
            .ok_or(PipelineError::NoInputData)?;
        let obs = self.observe(&reading)?;

        let mapper = self
            .mapper
            .as_ref()
            .context("control session has no mapper")?;
        let command: CommandVector = match mapper.map(&obs) {
            Ok(command) => command,
            Err(e) if e.is_recoverable() => {
                warn!("{}, skipping tick", e);
                return Ok(Tick::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        self.transport.send(&codec::encode_command(&command)).await?;
        self.control.push(self.frames, command);
        Ok(Tick::Accepted)
    }

    async fn render(&mut self) -> Result<Tick> {
        let Some(joints) = self.context.last_reading.as_ref().and_then(Reading::joints) else {
            warn!("No skeleton yet, skipping render request");
            return Ok(Tick::Skipped);
        };
        self.transport
            .send(&codec::encode_avatar(&joints, self.frames))
            .await?;
        Ok(Tick::Accepted)
    }

    async fn flush(&mut self) -> Result<Vec<PathBuf>> {
        let now = Local::now();
        let mut written = Vec::new();
        match self.mode {
            SessionMode::Acquisition => {
                let folder = self.config.subject_folder();
                if let Some(path) = self.acquisition.flush(&folder, &now)? {
                    written.push(path);
                }
            }
            SessionMode::Control => {
                if !self.control.is_empty() {
                    let folder = &self.config.control_folder;
                    written.push(self.control.flush(folder, &self.config.file_stem(), &now)?);
                    if let Some(snapshots) = &self.context.last_snapshots {
                        written.push(recorder::dump_diagnostics(folder, snapshots)?);
                    }
                }
            }
            SessionMode::Avatar => {}
        }
        Ok(written)
    }
}
