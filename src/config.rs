use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::COMMAND_LEN;
use crate::error::PipelineError;

/// Input device driving the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InputDevice {
    /// Optical motion capture skeleton (rigid bodies)
    Motive,
    /// Array of body-worn IMUs
    Imus,
    /// Single IMU (roll/pitch/yaw)
    Imu,
    /// Handheld remote (4 axes)
    Remote,
}

impl InputDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputDevice::Motive => "motive",
            InputDevice::Imus => "imus",
            InputDevice::Imu => "imu",
            InputDevice::Remote => "remote",
        }
    }

    /// Whether frames from this device go through the kinematic chain
    pub fn is_pose(&self) -> bool {
        matches!(self, InputDevice::Motive | InputDevice::Imus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ControlStyle {
    /// Fixed affine rescale of two features, no fitted model
    Simple,
    /// Per-output linear projection + regression
    Maxmin,
    /// Shared projection, calibration clamp, shared regression, /90
    New,
}

impl ControlStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlStyle::Simple => "simple",
            ControlStyle::Maxmin => "maxmin",
            ControlStyle::New => "new",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionType {
    Full,
    Signals,
    Bones,
}

/// Where remote samples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteSource {
    /// Datagrams on the `read_remote` channel
    Udp,
    /// Local gamepad polled in a background thread
    Gamepad,
}

/// One UDP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
}

impl ChannelConfig {
    fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context(format!("Invalid channel address {}:{}", self.host, self.port))
    }
}

/// UDP channels, one per logical stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub read_skeleton: ChannelConfig,
    pub read_imu_array: ChannelConfig,
    pub read_imu_single: ChannelConfig,
    pub read_remote: ChannelConfig,
    pub read_simulator_flag: ChannelConfig,
    pub read_simulator_calibration: ChannelConfig,
    pub write_command: ChannelConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            read_skeleton: ChannelConfig::local(9000),
            read_imu_array: ChannelConfig::local(9001),
            read_imu_single: ChannelConfig::local(9002),
            read_remote: ChannelConfig::local(9003),
            read_simulator_flag: ChannelConfig::local(30011),
            read_simulator_calibration: ChannelConfig::local(30012),
            write_command: ChannelConfig::local(30000),
        }
    }
}

/// A tracked body part and its kinematic parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyPartConfig {
    pub name: String,
    /// Rigid body / IMU id carried on the wire
    pub id: u8,
    #[serde(default)]
    pub parent: Option<String>,
}

impl BodyPartConfig {
    fn new(name: &str, id: u8, parent: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            id,
            parent: parent.map(str::to_string),
        }
    }
}

/// Runtime configuration, loaded once from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub subject_name: String,
    pub input_device: InputDevice,
    pub instance: u32,
    pub control_style: ControlStyle,
    pub dim_reduction: ReductionType,

    /// Body parts in kinematic-chain declaration order (parents first)
    pub body_parts: Vec<BodyPartConfig>,
    /// Rigid bodies streamed per skeleton frame; the chain uses a subset of them
    pub n_rigid_bodies: usize,
    /// Wire position of each canonical quaternion component [x, y, z, w]
    pub quaternion_order: [usize; 4],
    pub imu_quaternion_order: [usize; 4],
    /// Bytes per IMU record in an IMU-array frame
    pub imu_record_size: usize,
    /// IMU device name (case-insensitive) -> joint id
    pub imu_ids: BTreeMap<String, u8>,

    /// Output channels in command-vector order
    pub regression_outputs: Vec<String>,
    /// Column names of the simulator calibration frame
    pub calibration_columns: Vec<String>,

    /// Frame-count limit; `None` runs until a quit flag or idle timeout
    pub n_readings: Option<u64>,
    pub idle_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Tick period used when flags are simulated
    pub simulated_tick_ms: u64,

    pub data_folder: PathBuf,
    pub control_folder: PathBuf,
    /// Explicit mapping artifact; defaults to `<subject folder>/<device>_<style>.json`
    pub mapping_path: Option<PathBuf>,

    pub remote_gain: f64,
    pub imu_gain: f64,
    pub remote_source: RemoteSource,

    /// Synthesize input frames instead of reading sockets
    pub dummy_read: bool,
    /// Pretend the simulator always answers ready
    pub simulate_flag: bool,
    /// Replace simulator calibration frames with zeros
    pub dummy_simulator: bool,

    pub log_level: String,
    pub channels: ChannelsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            subject_name: "subject".to_string(),
            input_device: InputDevice::Motive,
            instance: 0,
            control_style: ControlStyle::Simple,
            dim_reduction: ReductionType::Signals,
            body_parts: vec![
                BodyPartConfig::new("torso", 1, None),
                BodyPartConfig::new("upperarm", 2, Some("torso")),
                BodyPartConfig::new("forearm", 3, Some("upperarm")),
                BodyPartConfig::new("hand", 4, Some("forearm")),
            ],
            n_rigid_bodies: 21,
            quaternion_order: [0, 1, 2, 3],
            imu_quaternion_order: [0, 1, 2, 3],
            imu_record_size: 104,
            imu_ids: (1..=4u8).map(|i| (format!("{:08}", i - 1), i)).collect(),
            regression_outputs: vec!["pitch".to_string(), "roll".to_string()],
            calibration_columns: [
                "roll", "pitch", "yaw", "thrust", "maneuver", "period", "amplitude", "instance",
                "time",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            n_readings: None,
            idle_timeout_ms: 1000,
            read_timeout_ms: 50,
            simulated_tick_ms: 100,
            data_folder: PathBuf::from("data"),
            control_folder: PathBuf::from("data/control"),
            mapping_path: None,
            remote_gain: 1.0,
            imu_gain: 1.0,
            remote_source: RemoteSource::Udp,
            dummy_read: false,
            simulate_flag: false,
            dummy_simulator: false,
            log_level: "info".to_string(),
            channels: ChannelsConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        let config: RuntimeConfig = serde_json::from_str(&data)
            .context(format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.input_device.is_pose() && self.body_parts.is_empty() {
            return Err(PipelineError::Config(format!(
                "input device `{}` needs at least one body part",
                self.input_device.as_str()
            )));
        }

        if self.input_device == InputDevice::Motive && self.n_rigid_bodies < self.body_parts.len() {
            return Err(PipelineError::Config(format!(
                "n_rigid_bodies {} cannot carry {} body parts",
                self.n_rigid_bodies,
                self.body_parts.len()
            )));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for part in &self.body_parts {
            if let Some(parent) = &part.parent {
                // parents must be declared first so the reverse walk sees children before parents
                if !names.contains(parent.as_str()) {
                    return Err(PipelineError::Config(format!(
                        "body part `{}` has parent `{}` which is not declared before it",
                        part.name, parent
                    )));
                }
            }
            if !names.insert(part.name.as_str()) {
                return Err(PipelineError::Config(format!("duplicate body part `{}`", part.name)));
            }
            if !ids.insert(part.id) {
                return Err(PipelineError::Config(format!("duplicate body part id {}", part.id)));
            }
        }

        for (label, order) in [
            ("quaternion_order", self.quaternion_order),
            ("imu_quaternion_order", self.imu_quaternion_order),
        ] {
            let mut sorted = order;
            sorted.sort_unstable();
            if sorted != [0, 1, 2, 3] {
                return Err(PipelineError::Config(format!(
                    "{label} must be a permutation of 0..4, got {order:?}"
                )));
            }
        }

        if self.imu_record_size < crate::codec::IMU_RECORD_MIN_SIZE {
            return Err(PipelineError::Config(format!(
                "imu_record_size {} is smaller than the {}-byte record layout",
                self.imu_record_size,
                crate::codec::IMU_RECORD_MIN_SIZE
            )));
        }

        if self.regression_outputs.len() > COMMAND_LEN {
            return Err(PipelineError::Config(format!(
                "{} regression outputs do not fit in a {}-slot command vector",
                self.regression_outputs.len(),
                COMMAND_LEN
            )));
        }
        if self.control_style == ControlStyle::Simple && self.regression_outputs.len() < 2 {
            return Err(PipelineError::Config(
                "simple control needs two regression outputs".to_string(),
            ));
        }

        if self.calibration_columns.len() < crate::recorder::CALIBRATION_TAIL_COLUMNS {
            return Err(PipelineError::Config(format!(
                "calibration_columns needs at least {} entries (maneuver, period, amplitude, instance, time)",
                crate::recorder::CALIBRATION_TAIL_COLUMNS
            )));
        }

        if self.idle_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "idle_timeout_ms and read_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// `<subject>_<device>`, used for folder and file names
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.subject_name, self.input_device.as_str())
    }

    /// Folder holding this subject's acquisitions and fitted mappings
    pub fn subject_folder(&self) -> PathBuf {
        self.data_folder.join(self.file_stem())
    }

    pub fn resolved_mapping_path(&self) -> PathBuf {
        match &self.mapping_path {
            Some(path) => path.clone(),
            None => self.subject_folder().join(format!(
                "{}_{}.json",
                self.input_device.as_str(),
                self.control_style.as_str()
            )),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"subject_name": "alice", "input_device": "remote", "instance": 3}"#,
        )
        .unwrap();
        assert_eq!(config.subject_name, "alice");
        assert_eq!(config.input_device, InputDevice::Remote);
        assert_eq!(config.idle_timeout_ms, 1000);
        assert_eq!(config.file_stem(), "alice_remote");
        assert!(config
            .resolved_mapping_path()
            .ends_with("alice_remote/remote_simple.json"));
    }

    #[test]
    fn test_parent_must_precede_child() {
        let mut config = RuntimeConfig::default();
        config.body_parts = vec![
            BodyPartConfig::new("forearm", 3, Some("upperarm")),
            BodyPartConfig::new("upperarm", 2, None),
        ];
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = RuntimeConfig::default();
        config.body_parts[1].id = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quaternion_order_must_be_permutation() {
        let mut config = RuntimeConfig::default();
        config.quaternion_order = [0, 0, 2, 3];
        assert!(config.validate().is_err());

        config.quaternion_order = [3, 0, 1, 2];
        config.validate().unwrap();
    }

    #[test]
    fn test_skeleton_needs_a_body_per_part() {
        let mut config = RuntimeConfig::default();
        config.n_rigid_bodies = 3;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.n_rigid_bodies = 4;
        config.validate().unwrap();

        // only the skeleton stream is sized by it
        config.n_rigid_bodies = 0;
        config.input_device = InputDevice::Imus;
        config.validate().unwrap();
    }

    #[test]
    fn test_too_many_outputs_rejected() {
        let mut config = RuntimeConfig::default();
        config.regression_outputs = (0..11).map(|i| format!("out{i}")).collect();
        assert!(config.validate().is_err());
    }
}
