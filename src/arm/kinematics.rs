// Planar 2-link kinematics with base yaw, in the firmware's shoulder-origin frame
//
// Angles are measured from +Z, rotating toward +X. The elbow angle is relative
// to the upper arm, 0 = straight.

use std::sync::Arc;

use crate::calibration::{Calibration, CalibrationParameters};
use crate::config::ToolDefaults;
use crate::error::{ArmError, Result};
use crate::messages::{CartesianPose, JointAngles};

/// Slack allowed on |cos(elbow)| before a target counts as out of reach
const REACH_TOLERANCE: f64 = 1e-6;

/// Planar (x_p, z_p) of the tool for given shoulder and elbow angles
pub fn planar_forward(params: &CalibrationParameters, shoulder: f64, elbow: f64) -> (f64, f64) {
    let phi = shoulder + params.shoulder_offset;
    let e_eff = elbow + params.elbow_offset;
    let phi2 = phi + e_eff;

    let x = params.l1 * phi.sin() + params.l2 * phi2.sin() + params.x0;
    let z = params.l1 * phi.cos() + params.l2 * phi2.cos() + params.z0;
    (x, z)
}

/// Forward/inverse transforms bound to one calibration snapshot
#[derive(Debug, Clone)]
pub struct KinematicsModel {
    calibration: Arc<Calibration>,
}

impl KinematicsModel {
    pub fn new(calibration: Arc<Calibration>) -> Self {
        Self { calibration }
    }

    fn params(&self) -> &CalibrationParameters {
        self.calibration.params()
    }

    /// Tool pose for a joint configuration; wrist, roll and gripper are copied through
    pub fn forward(&self, joints: &JointAngles) -> CartesianPose {
        let (x_p, z) = planar_forward(self.params(), joints.shoulder, joints.elbow);
        CartesianPose {
            x: joints.base.cos() * x_p,
            y: joints.base.sin() * x_p,
            z,
            wrist: Some(joints.wrist),
            roll: Some(joints.roll),
            gripper: Some(joints.gripper),
        }
    }

    /// Joint angles reaching `pose`, elbow-forward branch only
    ///
    /// Wrist, roll and gripper come from the pose when set, otherwise from
    /// `tool`. Fails with `ArmError::Unreachable` when the planar distance is
    /// outside `[|L1 - L2|, L1 + L2]` or a coordinate is not finite.
    pub fn inverse(&self, pose: &CartesianPose, tool: &ToolDefaults) -> Result<JointAngles> {
        let p = self.params();

        if !(pose.x.is_finite() && pose.y.is_finite() && pose.z.is_finite()) {
            return Err(ArmError::Unreachable {
                radius: f64::NAN,
                distance: f64::INFINITY,
            });
        }

        let base = if pose.x.abs() + pose.y.abs() > 1e-9 {
            pose.y.atan2(pose.x)
        } else {
            0.0
        };
        let x_p = pose.x.hypot(pose.y);

        let x_s = x_p - p.x0;
        let z_s = pose.z - p.z0;
        let r2 = x_s * x_s + z_s * z_s;

        let cos_e = (r2 - p.l1 * p.l1 - p.l2 * p.l2) / (2.0 * p.l1 * p.l2);
        if cos_e.abs() > 1.0 + REACH_TOLERANCE {
            let radius = r2.sqrt();
            let distance = if cos_e > 0.0 {
                radius - (p.l1 + p.l2)
            } else {
                (p.l1 - p.l2).abs() - radius
            };
            return Err(ArmError::Unreachable { radius, distance });
        }

        // The elbow-backward solution (-acos) is never produced
        let e_eff = cos_e.clamp(-1.0, 1.0).acos();

        let k1 = p.l1 + p.l2 * e_eff.cos();
        let k2 = p.l2 * e_eff.sin();
        let phi = x_s.atan2(z_s) - k2.atan2(k1);

        Ok(JointAngles {
            base,
            shoulder: phi - p.shoulder_offset,
            elbow: e_eff - p.elbow_offset,
            wrist: pose.wrist.unwrap_or(tool.wrist),
            roll: pose.roll.unwrap_or(tool.roll),
            gripper: pose.gripper.unwrap_or(tool.gripper),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn model() -> KinematicsModel {
        KinematicsModel::new(Arc::new(
            Calibration::initial(CalibrationParameters::reference()).unwrap(),
        ))
    }

    fn joints(base: f64, shoulder: f64, elbow: f64) -> JointAngles {
        JointAngles {
            base,
            shoulder,
            elbow,
            ..JointAngles::default()
        }
    }

    #[test]
    fn test_inverse_reference_target() {
        let q = model()
            .inverse(&CartesianPose::new(235.0, 0.0, 234.0), &ToolDefaults::default())
            .unwrap();
        assert_abs_diff_eq!(q.base, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(q.shoulder, -0.473822, epsilon = 1e-4);
        assert_abs_diff_eq!(q.elbow, 1.972540, epsilon = 1e-4);
    }

    #[test]
    fn test_forward_reference_joints() {
        let pose = model().forward(&joints(0.0, -0.473822, 1.972540));
        assert_abs_diff_eq!(pose.x, 235.0, epsilon = 0.01);
        assert_abs_diff_eq!(pose.y, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.z, 234.0, epsilon = 0.01);
    }

    #[test]
    fn test_forward_is_repeatable() {
        let m = model();
        let q = joints(0.4, 0.2, 1.1);
        assert_eq!(m.forward(&q), m.forward(&q));
    }

    #[test]
    fn test_round_trip_over_workspace() {
        let m = model();
        let tool = ToolDefaults::default();
        let params = CalibrationParameters::reference();
        let mut checked = 0;
        for &base in &[-1.2, -0.3, 0.0, 0.7, 1.5] {
            for &shoulder in &[-0.6, -0.2, 0.0, 0.3, 0.6] {
                for &elbow in &[0.3, 0.8, 1.2, 1.6, 1.9] {
                    // Behind the shoulder the same point is reached with base + π
                    let (x_p, _) = planar_forward(&params, shoulder, elbow);
                    if x_p <= 10.0 {
                        continue;
                    }
                    checked += 1;
                    let q = joints(base, shoulder, elbow);
                    let back = m.inverse(&m.forward(&q), &tool).unwrap();
                    assert_abs_diff_eq!(back.base, base, epsilon = 0.01);
                    assert_abs_diff_eq!(back.shoulder, shoulder, epsilon = 0.01);
                    assert_abs_diff_eq!(back.elbow, elbow, epsilon = 0.01);
                }
            }
        }
        assert!(checked > 40);
    }

    #[test]
    fn test_full_stretch_is_reachable() {
        let p = CalibrationParameters::reference();
        let reach = p.l1 + p.l2;
        let theta: f64 = 0.5;
        let pose = CartesianPose::new(p.x0 + reach * theta.sin(), 0.0, p.z0 + reach * theta.cos());

        let q = model().inverse(&pose, &ToolDefaults::default()).unwrap();
        // e_eff = elbow + elbow_offset ≈ 0 when fully stretched
        assert_abs_diff_eq!(q.elbow + p.elbow_offset, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(q.shoulder + p.shoulder_offset, theta, epsilon = 1e-4);
    }

    #[test]
    fn test_beyond_reach_fails() {
        let p = CalibrationParameters::reference();
        let reach = p.l1 + p.l2;
        let pose = CartesianPose::new(p.x0 + reach + 1.0, 0.0, p.z0);

        match model().inverse(&pose, &ToolDefaults::default()) {
            Err(ArmError::Unreachable { distance, .. }) => {
                assert_abs_diff_eq!(distance, 1.0, epsilon = 1e-6)
            }
            other => panic!("expected Unreachable, got {:?}", other),
        }
    }

    #[test]
    fn test_inside_inner_radius_fails() {
        let p = CalibrationParameters::reference();
        let pose = CartesianPose::new(p.x0 + 10.0, 0.0, p.z0);
        assert!(matches!(
            model().inverse(&pose, &ToolDefaults::default()),
            Err(ArmError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_non_finite_target_fails() {
        let m = model();
        let tool = ToolDefaults::default();
        for pose in [
            CartesianPose::new(f64::NAN, 0.0, 234.0),
            CartesianPose::new(235.0, f64::INFINITY, 234.0),
            CartesianPose::new(235.0, 0.0, f64::NEG_INFINITY),
        ] {
            assert!(matches!(
                m.inverse(&pose, &tool),
                Err(ArmError::Unreachable { .. })
            ));
        }
    }

    #[test]
    fn test_origin_axis_gives_zero_base() {
        let p = CalibrationParameters::reference();
        // Straight above the shoulder axis, x = y = 0
        let pose = CartesianPose::new(0.0, 0.0, 400.0 + p.z0);
        let q = model().inverse(&pose, &ToolDefaults::default()).unwrap();
        assert_eq!(q.base, 0.0);
    }

    #[test]
    fn test_tool_fields_pass_through() {
        let tool = ToolDefaults {
            wrist: 0.2,
            roll: -0.1,
            gripper: 2.5,
        };
        let pose = CartesianPose::new(235.0, 10.0, 234.0).with_gripper(3.0);
        let q = model().inverse(&pose, &tool).unwrap();
        assert_eq!(q.wrist, 0.2);
        assert_eq!(q.roll, -0.1);
        assert_eq!(q.gripper, 3.0);
    }
}
