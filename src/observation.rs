use std::sync::Arc;

use crate::error::PipelineError;
use crate::kinematics::EulerPose;

/// Angle labels per body part, in feature order
pub const ANGLE_LABELS: [&str; 3] = ["roll", "pitch", "yaw"];

/// Feature names for a pose: `roll_<part>`, `pitch_<part>`, `yaw_<part>` for each part
pub fn pose_feature_names<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    parts
        .into_iter()
        .flat_map(|part| ANGLE_LABELS.iter().map(move |a| format!("{a}_{part}")))
        .collect()
}

/// Canonical named feature vector for one frame.
/// Layout is fixed per session by the input modality:
/// - pose devices: [roll, pitch, yaw] per body part, chain order
/// - single IMU: [roll_imu, pitch_imu, yaw_imu]
/// - remote: [remote1..remote4]
#[derive(Debug, Clone)]
pub struct Observation {
    names: Arc<[String]>,
    data: Vec<f64>,
}

impl Observation {
    pub fn new(names: Arc<[String]>, data: Vec<f64>) -> Self {
        debug_assert_eq!(names.len(), data.len());
        Self { names, data }
    }

    /// Flatten per-part Euler angles in `names` order
    pub fn from_euler(names: Arc<[String]>, euler: &EulerPose) -> Self {
        let data = euler.iter().flat_map(|(_, angles)| angles).collect();
        Self::new(names, data)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.data[i])
    }

    /// Values for `names`, in that order
    pub fn select(&self, names: &[String]) -> Result<Vec<f64>, PipelineError> {
        names
            .iter()
            .map(|n| self.get(n).ok_or_else(|| PipelineError::MissingFeature(n.clone())))
            .collect()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_feature_names_part_major() {
        let names = pose_feature_names(["torso", "hand"]);
        assert_eq!(
            names,
            vec!["roll_torso", "pitch_torso", "yaw_torso", "roll_hand", "pitch_hand", "yaw_hand"]
        );
    }

    #[test]
    fn test_select_in_requested_order() {
        let names: Arc<[String]> = vec!["a".to_string(), "b".to_string(), "c".to_string()].into();
        let obs = Observation::new(names, vec![1.0, 2.0, 3.0]);

        assert_eq!(obs.select(&["c".to_string(), "a".to_string()]).unwrap(), vec![3.0, 1.0]);
        assert!(matches!(
            obs.select(&["z".to_string()]),
            Err(PipelineError::MissingFeature(_))
        ));
    }
}
