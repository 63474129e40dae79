//! Input devices behind one interface, chosen once at session start.
//! Downstream stages only see `Reading` and the canonical `Observation`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::{
    self, Decoded, Frame, ImuArrayLayout, ImuSample, JointSample, Modality, IMU_SINGLE_SIZE,
    REMOTE_SIZE, REMOTE_VALUES, SKELETON_RECORD_SIZE,
};
use crate::config::{InputDevice, RuntimeConfig};
use crate::kinematics::{KinematicChain, Pose};
use crate::observation::pose_feature_names;
use crate::transport::Channel;

/// Decoded numeric form of one input frame
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Joints(Vec<JointSample>),
    Imus(Vec<ImuSample>),
    Values(Vec<f64>),
}

impl Reading {
    /// Flat numeric row, as written to the acquisition file
    pub fn raw_row(&self) -> Vec<f64> {
        match self {
            Reading::Joints(joints) => joints.iter().flat_map(|j| j.to_row()).collect(),
            Reading::Imus(imus) => imus.iter().flat_map(|s| s.to_row()).collect(),
            Reading::Values(values) => values.clone(),
        }
    }

    /// Joint samples, for devices that feed the kinematic chain
    pub fn joints(&self) -> Option<Vec<JointSample>> {
        match self {
            Reading::Joints(joints) => Some(joints.clone()),
            Reading::Imus(imus) => Some(imus.iter().map(ImuSample::joint).collect()),
            Reading::Values(_) => None,
        }
    }
}

pub trait InputModality: Send + Sync {
    fn device(&self) -> InputDevice;

    fn modality(&self) -> Modality;

    /// Socket this device is read from
    fn channel(&self) -> Channel;

    /// Nominal datagram size in bytes, the size of `dummy_frame`
    fn expected_size(&self) -> usize;

    /// Names of the canonical features, in observation order
    fn feature_names(&self) -> Arc<[String]>;

    fn feature_count(&self) -> usize {
        self.feature_names().len()
    }

    /// Column names of `raw_row`
    fn raw_columns(&self) -> Vec<String>;

    /// Acquisition row for `reading`, one value per raw column
    fn raw_row(&self, reading: &Reading) -> Vec<f64> {
        reading.raw_row()
    }

    fn decode(&self, frame: &Frame) -> Decoded<Reading>;

    /// Frame used when reads are simulated
    fn dummy_frame(&self) -> Vec<u8>;
}

fn check_chain(chain: &KinematicChain, joints: &[JointSample]) -> Result<(), String> {
    Pose::from_joints(chain, joints)
        .map(|_| ())
        .map_err(|part| format!("no joint for body part `{part}`"))
}

fn part_columns<'a>(parts: impl IntoIterator<Item = &'a str>, middle: [&str; 3]) -> Vec<String> {
    parts
        .into_iter()
        .flat_map(|part| {
            let mut cols = vec![format!("ID_{part}")];
            cols.extend(middle.iter().map(|m| format!("{m}_{part}")));
            cols.extend(["x", "y", "z", "w"].iter().map(|q| format!("quat_{q}_{part}")));
            cols
        })
        .collect()
}

/// Optical motion capture rigid bodies. The tracker streams `n_bodies`
/// records per frame; the chain picks its parts out of them by id.
pub struct SkeletonInput {
    chain: KinematicChain,
    order: [usize; 4],
    n_bodies: usize,
    names: Arc<[String]>,
    slots: Vec<String>,
}

impl SkeletonInput {
    pub fn new(chain: KinematicChain, order: [usize; 4], n_bodies: usize) -> Self {
        let names = pose_feature_names(chain.names()).into();
        let slots = (1..=n_bodies).map(|k| format!("rb{k}")).collect();
        Self {
            chain,
            order,
            n_bodies,
            names,
            slots,
        }
    }
}

impl InputModality for SkeletonInput {
    fn device(&self) -> InputDevice {
        InputDevice::Motive
    }

    fn modality(&self) -> Modality {
        Modality::Skeleton
    }

    fn channel(&self) -> Channel {
        Channel::Skeleton
    }

    fn expected_size(&self) -> usize {
        self.n_bodies * SKELETON_RECORD_SIZE
    }

    fn feature_names(&self) -> Arc<[String]> {
        self.names.clone()
    }

    fn raw_columns(&self) -> Vec<String> {
        part_columns(self.slots.iter().map(String::as_str), ["x", "y", "z"])
    }

    fn decode(&self, frame: &Frame) -> Decoded<Reading> {
        let Some(bytes) = frame.bytes() else {
            return Decoded::Timeout;
        };
        match codec::decode_skeleton(bytes, self.n_bodies, &self.order) {
            Decoded::Ok(joints) => match check_chain(&self.chain, &joints) {
                Ok(()) => Decoded::Ok(Reading::Joints(joints)),
                Err(reason) => Decoded::Malformed(reason),
            },
            other => other.map(Reading::Joints),
        }
    }

    fn dummy_frame(&self) -> Vec<u8> {
        let used: Vec<u8> = self.chain.links().iter().map(|l| l.id).collect();
        let spare = (1..=u8::MAX)
            .filter(|id| !used.contains(id))
            .take(self.n_bodies.saturating_sub(used.len()));
        let joints: Vec<JointSample> = used
            .iter()
            .copied()
            .chain(spare)
            .map(JointSample::identity)
            .collect();
        codec::encode_skeleton(&joints, &self.order)
    }
}

/// Array of body-worn IMUs
pub struct ImuArrayInput {
    chain: KinematicChain,
    order: [usize; 4],
    record_size: usize,
    ids: BTreeMap<String, u8>,
    names: Arc<[String]>,
}

impl ImuArrayInput {
    pub fn new(
        chain: KinematicChain,
        order: [usize; 4],
        record_size: usize,
        ids: &BTreeMap<String, u8>,
    ) -> Self {
        let names = pose_feature_names(chain.names()).into();
        let ids = ids.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect();
        Self {
            chain,
            order,
            record_size,
            ids,
            names,
        }
    }

    fn device_name(&self, id: u8) -> String {
        self.ids
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| format!("{id:08}"))
    }
}

impl InputModality for ImuArrayInput {
    fn device(&self) -> InputDevice {
        InputDevice::Imus
    }

    fn modality(&self) -> Modality {
        Modality::ImuArray
    }

    fn channel(&self) -> Channel {
        Channel::ImuArray
    }

    fn expected_size(&self) -> usize {
        self.chain.len() * self.record_size
    }

    fn feature_names(&self) -> Arc<[String]> {
        self.names.clone()
    }

    fn raw_columns(&self) -> Vec<String> {
        part_columns(self.chain.names(), ["roll", "pitch", "yaw"])
    }

    /// Chain parts only, in chain order; the stream may carry extra devices
    fn raw_row(&self, reading: &Reading) -> Vec<f64> {
        let Reading::Imus(samples) = reading else {
            return reading.raw_row();
        };
        self.chain
            .links()
            .iter()
            .filter_map(|l| samples.iter().find(|s| s.id == l.id))
            .flat_map(|s| s.to_row())
            .collect()
    }

    fn decode(&self, frame: &Frame) -> Decoded<Reading> {
        let Some(bytes) = frame.bytes() else {
            return Decoded::Timeout;
        };
        let layout = ImuArrayLayout {
            record_size: self.record_size,
            order: &self.order,
            ids: &self.ids,
        };
        match codec::decode_imu_array(bytes, &layout) {
            Decoded::Ok(samples) => {
                let joints: Vec<JointSample> = samples.iter().map(ImuSample::joint).collect();
                match check_chain(&self.chain, &joints) {
                    Ok(()) => Decoded::Ok(Reading::Imus(samples)),
                    Err(reason) => Decoded::Malformed(reason),
                }
            }
            other => other.map(Reading::Imus),
        }
    }

    fn dummy_frame(&self) -> Vec<u8> {
        self.chain
            .links()
            .iter()
            .flat_map(|l| {
                codec::encode_imu_record(
                    &self.device_name(l.id),
                    0,
                    [0.0; 3],
                    [0.0, 0.0, 0.0, 1.0],
                    &self.order,
                    self.record_size,
                )
            })
            .collect()
    }
}

/// Single IMU reporting roll/pitch/yaw in degrees
pub struct ImuSingleInput {
    names: Arc<[String]>,
}

impl ImuSingleInput {
    pub fn new() -> Self {
        let names: Vec<String> = ["roll_imu", "pitch_imu", "yaw_imu"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            names: names.into(),
        }
    }
}

impl Default for ImuSingleInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InputModality for ImuSingleInput {
    fn device(&self) -> InputDevice {
        InputDevice::Imu
    }

    fn modality(&self) -> Modality {
        Modality::ImuSingle
    }

    fn channel(&self) -> Channel {
        Channel::ImuSingle
    }

    fn expected_size(&self) -> usize {
        IMU_SINGLE_SIZE
    }

    fn feature_names(&self) -> Arc<[String]> {
        self.names.clone()
    }

    fn raw_columns(&self) -> Vec<String> {
        self.names.to_vec()
    }

    fn decode(&self, frame: &Frame) -> Decoded<Reading> {
        let Some(bytes) = frame.bytes() else {
            return Decoded::Timeout;
        };
        codec::decode_imu_single(bytes).map(|angles| Reading::Values(angles.to_vec()))
    }

    fn dummy_frame(&self) -> Vec<u8> {
        vec![0u8; IMU_SINGLE_SIZE]
    }
}

/// Handheld remote with four axes
pub struct RemoteInput {
    names: Arc<[String]>,
}

impl RemoteInput {
    pub fn new() -> Self {
        let names: Vec<String> = (1..=REMOTE_VALUES).map(|i| format!("remote{i}")).collect();
        Self {
            names: names.into(),
        }
    }
}

impl Default for RemoteInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InputModality for RemoteInput {
    fn device(&self) -> InputDevice {
        InputDevice::Remote
    }

    fn modality(&self) -> Modality {
        Modality::Remote
    }

    fn channel(&self) -> Channel {
        Channel::Remote
    }

    fn expected_size(&self) -> usize {
        REMOTE_SIZE
    }

    fn feature_names(&self) -> Arc<[String]> {
        self.names.clone()
    }

    fn raw_columns(&self) -> Vec<String> {
        self.names.to_vec()
    }

    fn decode(&self, frame: &Frame) -> Decoded<Reading> {
        let Some(bytes) = frame.bytes() else {
            return Decoded::Timeout;
        };
        codec::decode_f32_vec(bytes, REMOTE_VALUES)
            .map(|values| Reading::Values(values.into_iter().map(|v| v as f64).collect()))
    }

    fn dummy_frame(&self) -> Vec<u8> {
        vec![0u8; REMOTE_SIZE]
    }
}

/// Pick the input implementation for the configured device
pub fn select_modality(config: &RuntimeConfig) -> Box<dyn InputModality> {
    let chain = KinematicChain::from_config(&config.body_parts);
    match config.input_device {
        InputDevice::Motive => Box::new(SkeletonInput::new(
            chain,
            config.quaternion_order,
            config.n_rigid_bodies,
        )),
        InputDevice::Imus => Box::new(ImuArrayInput::new(
            chain,
            config.imu_quaternion_order,
            config.imu_record_size,
            &config.imu_ids,
        )),
        InputDevice::Imu => Box::new(ImuSingleInput::new()),
        InputDevice::Remote => Box::new(RemoteInput::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn config_for(device: InputDevice) -> RuntimeConfig {
        RuntimeConfig {
            input_device: device,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn test_dummy_frames_decode_for_every_device() {
        for device in [
            InputDevice::Motive,
            InputDevice::Imus,
            InputDevice::Imu,
            InputDevice::Remote,
        ] {
            let input = select_modality(&config_for(device));
            let bytes = input.dummy_frame();
            assert_eq!(bytes.len(), input.expected_size(), "{device:?}");

            let reading = input.decode(&Frame::new(input.modality(), bytes)).ok();
            assert!(reading.is_some(), "{device:?}");
            assert_eq!(
                input.raw_row(&reading.unwrap()).len(),
                input.raw_columns().len(),
                "{device:?}"
            );
        }
    }

    #[test]
    fn test_timeout_passes_through() {
        let input = select_modality(&config_for(InputDevice::Motive));
        assert_eq!(input.decode(&Frame::Timeout), Decoded::Timeout);
    }

    #[test]
    fn test_short_skeleton_is_size_mismatch() {
        let input = select_modality(&config_for(InputDevice::Motive));
        let mut bytes = input.dummy_frame();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            input.decode(&Frame::new(Modality::Skeleton, bytes)),
            Decoded::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_skeleton_missing_body_part_is_malformed() {
        let config = config_for(InputDevice::Motive);
        let input = select_modality(&config);
        let joints: Vec<JointSample> = (30..30 + config.n_rigid_bodies as u8)
            .map(JointSample::identity)
            .collect();
        let bytes = codec::encode_skeleton(&joints, &config.quaternion_order);
        assert!(matches!(
            input.decode(&Frame::new(Modality::Skeleton, bytes)),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn test_skeleton_with_more_bodies_than_chain() {
        let config = config_for(InputDevice::Motive);
        let input = select_modality(&config);
        let joints: Vec<JointSample> = (1..=21).rev().map(JointSample::identity).collect();
        let bytes = codec::encode_skeleton(&joints, &config.quaternion_order);
        assert_eq!(bytes.len(), input.expected_size());

        let reading = input.decode(&Frame::new(Modality::Skeleton, bytes)).ok().unwrap();
        let decoded = reading.joints().unwrap();
        assert_eq!(decoded.len(), 21);
        assert_eq!(decoded[0].id, 1);
        assert_eq!(input.raw_row(&reading).len(), input.raw_columns().len());
        assert_eq!(input.raw_columns()[..2], ["ID_rb1".to_string(), "x_rb1".to_string()]);

        let chain = KinematicChain::from_config(&config.body_parts);
        assert_eq!(Pose::from_joints(&chain, &decoded).unwrap().len(), 4);
    }

    #[test]
    fn test_imu_array_keeps_chain_parts_of_larger_stream() {
        let config = config_for(InputDevice::Imus);
        let input = select_modality(&config);
        let mut ids = config.imu_ids.clone();
        ids.insert("00000009".to_string(), 9);
        let order = config.imu_quaternion_order;
        let bytes: Vec<u8> = ["00000009", "00000003", "00000000", "00000002", "00000001"]
            .iter()
            .flat_map(|name| {
                codec::encode_imu_record(
                    name,
                    0,
                    [1.0, 2.0, 3.0],
                    [0.0, 0.0, 0.0, 1.0],
                    &order,
                    config.imu_record_size,
                )
            })
            .collect();

        // the extra device is unknown to this config
        assert!(matches!(
            input.decode(&Frame::new(Modality::ImuArray, bytes.clone())),
            Decoded::Malformed(_)
        ));

        let wider = RuntimeConfig {
            imu_ids: ids,
            ..config.clone()
        };
        let input = select_modality(&wider);
        let reading = input.decode(&Frame::new(Modality::ImuArray, bytes)).ok().unwrap();
        assert_eq!(reading.joints().unwrap().len(), 5);
        let row = input.raw_row(&reading);
        assert_eq!(row.len(), input.raw_columns().len());
        assert_eq!(row[0], 1.0);
    }

    #[test]
    fn test_feature_counts() {
        let config = config_for(InputDevice::Motive);
        assert_eq!(select_modality(&config).feature_count(), config.body_parts.len() * 3);
        assert_eq!(select_modality(&config_for(InputDevice::Imu)).feature_count(), 3);
        assert_eq!(select_modality(&config_for(InputDevice::Remote)).feature_count(), 4);
    }

    #[test]
    fn test_reading_joints_only_for_pose_devices() {
        assert!(Reading::Values(vec![1.0]).joints().is_none());
        assert_eq!(
            Reading::Joints(vec![JointSample::identity(1)]).joints().unwrap().len(),
            1
        );
    }
}
