//! Per-frame kinematic preprocessing: relativize to parent, debias against
//! the first observed pose, extract roll/pitch/yaw.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::Serialize;

use crate::codec::JointSample;
use crate::config::BodyPartConfig;

/// Quaternions shorter than this are treated as "no rotation"
const MIN_QUAT_NORM: f64 = 1e-9;

/// Position and orientation ([x, y, z, w]) of one body part
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PartPose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

impl PartPose {
    pub fn identity() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn from_joint(joint: &JointSample) -> Self {
        Self {
            position: joint.position.map(|p| p as f64),
            orientation: joint.orientation.map(|q| q as f64),
        }
    }

    fn rotation(&self) -> UnitQuaternion<f64> {
        let [x, y, z, w] = self.orientation;
        let q = Quaternion::new(w, x, y, z);
        if q.norm() < MIN_QUAT_NORM || !q.norm().is_finite() {
            return UnitQuaternion::identity();
        }
        UnitQuaternion::from_quaternion(q)
    }

    fn translation(&self) -> Vector3<f64> {
        Vector3::from(self.position)
    }

    fn from_parts(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        let q = rotation.quaternion();
        Self {
            position: [translation.x, translation.y, translation.z],
            orientation: [q.i, q.j, q.k, q.w],
        }
    }

    /// This pose expressed in the frame of `base`
    fn relative_to(&self, base: &PartPose) -> Self {
        let base_inv = base.rotation().inverse();
        Self::from_parts(
            base_inv * (self.translation() - base.translation()),
            base_inv * self.rotation(),
        )
    }

    /// Roll, pitch, yaw in radians (R = Rz(yaw) * Ry(pitch) * Rx(roll))
    pub fn euler(&self) -> [f64; 3] {
        let (roll, pitch, yaw) = self.rotation().euler_angles();
        [roll, pitch, yaw]
    }
}

/// A body part in the chain, with the index of its parent
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub name: String,
    pub id: u8,
    pub parent: Option<usize>,
}

/// Parent/child hierarchy of the tracked body parts, in declaration order
#[derive(Debug, Clone)]
pub struct KinematicChain {
    links: Vec<ChainLink>,
}

impl KinematicChain {
    /// Build from validated config (parents declared before children)
    pub fn from_config(parts: &[BodyPartConfig]) -> Self {
        let links = parts
            .iter()
            .map(|part| ChainLink {
                name: part.name.clone(),
                id: part.id,
                parent: part
                    .parent
                    .as_ref()
                    .and_then(|p| parts.iter().position(|other| &other.name == p)),
            })
            .collect();
        Self { links }
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.links.iter().map(|l| l.name.as_str())
    }
}

/// Body part name -> pose, in chain order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pose {
    parts: Vec<(String, PartPose)>,
}

impl Pose {
    pub fn new(parts: Vec<(String, PartPose)>) -> Self {
        Self { parts }
    }

    /// Pick each chain link's joint by id. Returns the name of the first
    /// body part whose joint is missing.
    pub fn from_joints(chain: &KinematicChain, joints: &[JointSample]) -> Result<Self, String> {
        let mut parts = Vec::with_capacity(chain.len());
        for link in chain.links() {
            let joint = joints
                .iter()
                .find(|j| j.id == link.id)
                .ok_or_else(|| link.name.clone())?;
            parts.push((link.name.clone(), PartPose::from_joint(joint)));
        }
        Ok(Self { parts })
    }

    pub fn get(&self, name: &str) -> Option<&PartPose> {
        self.parts.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PartPose)> {
        self.parts.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Roll/pitch/yaw per body part, in chain order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EulerPose {
    parts: Vec<(String, [f64; 3])>,
}

impl EulerPose {
    pub fn get(&self, name: &str) -> Option<[f64; 3]> {
        self.parts.iter().find(|(n, _)| n == name).map(|(_, a)| *a)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, [f64; 3])> {
        self.parts.iter().map(|(n, a)| (n.as_str(), *a))
    }

    /// First body part of the chain (the root)
    pub fn root(&self) -> Option<[f64; 3]> {
        self.parts.first().map(|(_, a)| *a)
    }
}

/// Express every body part relative to its parent. Links are visited in
/// reverse declaration order so each child reads its parent's absolute pose
/// before the parent itself is rewritten. The root stays absolute.
pub fn relativize(pose: &Pose, chain: &KinematicChain) -> Pose {
    let mut parts = pose.parts.clone();
    for (i, link) in chain.links().iter().enumerate().rev() {
        if let Some(p) = link.parent {
            if i < parts.len() && p < parts.len() {
                parts[i].1 = parts[i].1.relative_to(&parts[p].1);
            }
        }
    }
    Pose { parts }
}

/// Remove the reference offset from every body part
pub fn debias(pose: &Pose, reference: &Pose) -> Pose {
    let parts = pose
        .parts
        .iter()
        .map(|(name, part)| {
            let unbiased = match reference.get(name) {
                Some(r) => part.relative_to(r),
                None => *part,
            };
            (name.clone(), unbiased)
        })
        .collect();
    Pose { parts }
}

pub fn euler_angles(pose: &Pose) -> EulerPose {
    EulerPose {
        parts: pose
            .parts
            .iter()
            .map(|(name, part)| (name.clone(), part.euler()))
            .collect(),
    }
}

/// First relativized pose of the process; set once, never replaced
#[derive(Debug, Clone, Default)]
pub struct ReferencePose {
    pose: Option<Pose>,
}

impl ReferencePose {
    pub fn get(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.pose.is_some()
    }

    /// Capture `candidate` if nothing is stored yet, then return the stored pose
    pub fn get_or_capture(&mut self, candidate: &Pose) -> &Pose {
        self.pose.get_or_insert_with(|| candidate.clone())
    }
}

/// Every intermediate stage of one preprocessed frame
#[derive(Debug, Clone, Serialize)]
pub struct PoseSnapshots {
    pub base: Pose,
    pub relativized: Pose,
    pub reference: Pose,
    pub debiased: Pose,
    pub euler: EulerPose,
}

/// Relativize, debias (capturing the reference on first use), extract Euler angles
pub fn preprocess(base: Pose, chain: &KinematicChain, reference: &mut ReferencePose) -> PoseSnapshots {
    let relativized = relativize(&base, chain);
    let reference = reference.get_or_capture(&relativized).clone();
    let debiased = debias(&relativized, &reference);
    let euler = euler_angles(&debiased);
    PoseSnapshots {
        base,
        relativized,
        reference,
        debiased,
        euler,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn yaw_part(deg: f64) -> PartPose {
        let q = UnitQuaternion::from_euler_angles(0.0, 0.0, deg.to_radians());
        PartPose::from_parts(Vector3::zeros(), q)
    }

    fn arm_chain() -> KinematicChain {
        KinematicChain::from_config(&[
            BodyPartConfig {
                name: "torso".into(),
                id: 1,
                parent: None,
            },
            BodyPartConfig {
                name: "upperarm".into(),
                id: 2,
                parent: Some("torso".into()),
            },
            BodyPartConfig {
                name: "forearm".into(),
                id: 3,
                parent: Some("upperarm".into()),
            },
        ])
    }

    fn arm_pose(a: f64, b: f64, c: f64) -> Pose {
        Pose::new(vec![
            ("torso".into(), yaw_part(a)),
            ("upperarm".into(), yaw_part(b)),
            ("forearm".into(), yaw_part(c)),
        ])
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_relativize_uses_absolute_parent() {
        let chain = arm_chain();
        let rel = relativize(&arm_pose(10.0, 30.0, 60.0), &chain);

        assert_close(rel.get("torso").unwrap().euler()[2].to_degrees(), 10.0);
        assert_close(rel.get("upperarm").unwrap().euler()[2].to_degrees(), 20.0);
        assert_close(rel.get("forearm").unwrap().euler()[2].to_degrees(), 30.0);
    }

    #[test]
    fn test_relativize_is_deterministic() {
        let chain = arm_chain();
        let pose = arm_pose(5.0, -40.0, 70.0);
        assert_eq!(relativize(&pose, &chain), relativize(&pose, &chain));
    }

    #[test]
    fn test_relative_position_in_parent_frame() {
        let chain = arm_chain();
        let mut parts = vec![
            ("torso".to_string(), yaw_part(90.0)),
            ("upperarm".to_string(), yaw_part(90.0)),
            ("forearm".to_string(), yaw_part(90.0)),
        ];
        parts[1].1.position = [0.0, 1.0, 0.0];
        let rel = relativize(&Pose::new(parts), &chain);
        // torso rotated +90 deg about z, so world +y is local +x
        let p = rel.get("upperarm").unwrap().position;
        assert_close(p[0], 1.0);
        assert_close(p[1], 0.0);
    }

    #[test]
    fn test_debias_against_itself_is_zero() {
        let pose = arm_pose(12.0, -33.0, 48.0);
        let eul = euler_angles(&debias(&pose, &pose));
        for (_, angles) in eul.iter() {
            for a in angles {
                assert_close(a, 0.0);
            }
        }
    }

    #[test]
    fn test_reference_captured_once() {
        let chain = arm_chain();
        let mut reference = ReferencePose::default();

        let first = preprocess(arm_pose(0.0, 10.0, 20.0), &chain, &mut reference);
        for (_, angles) in first.euler.iter() {
            for a in angles {
                assert_close(a, 0.0);
            }
        }

        let second = preprocess(arm_pose(0.0, 40.0, 20.0), &chain, &mut reference);
        assert_eq!(second.reference, first.reference);
        // upperarm turned 30 deg further, forearm kept its absolute yaw
        assert_close(second.euler.get("upperarm").unwrap()[2].to_degrees(), 30.0);
        assert_close(second.euler.get("forearm").unwrap()[2].to_degrees(), -30.0);
    }

    #[test]
    fn test_euler_convention() {
        let q = UnitQuaternion::from_euler_angles(0.1, -0.2, FRAC_PI_2 / 2.0);
        let part = PartPose::from_parts(Vector3::zeros(), q);
        let [r, p, y] = part.euler();
        assert_close(r, 0.1);
        assert_close(p, -0.2);
        assert_close(y, FRAC_PI_2 / 2.0);
    }

    #[test]
    fn test_zero_quaternion_treated_as_identity() {
        let part = PartPose {
            position: [0.0; 3],
            orientation: [0.0; 4],
        };
        assert_eq!(part.euler(), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_from_joints_reports_missing_part() {
        let chain = arm_chain();
        let joints = vec![JointSample::identity(1), JointSample::identity(3)];
        assert_eq!(Pose::from_joints(&chain, &joints), Err("upperarm".to_string()));
    }
}
