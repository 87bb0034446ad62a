// Guarded joint sweep that collects calibration samples, and their CSV form
//
// The arm visits a shoulder × elbow grid at base 0. Each grid point is
// approached in small interpolated steps; every step is validated against the
// sweep envelope before it is sent and the reported pose is checked against a
// Cartesian box after it settles. A point that trips either check sends the arm
// back to the candle pose and is skipped.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::CalibrationSample;
use crate::arm::{ArmLink, MotionController, candle_joints};
use crate::config::SweepPlan;
use crate::error::{ArmError, Result};
use crate::messages::{Feedback, JointAngles};
use crate::persist::write_atomic;

/// One CSV row: measured joints and the firmware's reported position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    #[serde(alias = "b_fb")]
    pub base: f64,
    #[serde(alias = "s_fb")]
    pub shoulder: f64,
    #[serde(alias = "e_fb")]
    pub elbow: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SweepRecord {
    pub fn from_feedback(fb: &Feedback) -> Self {
        Self {
            base: fb.base,
            shoulder: fb.shoulder,
            elbow: fb.elbow,
            x: fb.x,
            y: fb.y,
            z: fb.z,
        }
    }

    /// Planar sample, or `None` when |y| shows the arm was not in the x-z plane
    pub fn to_sample(&self, max_abs_y: f64) -> Option<CalibrationSample> {
        (self.y.abs() <= max_abs_y).then_some(CalibrationSample {
            shoulder: self.shoulder,
            elbow: self.elbow,
            x: self.x,
            z: self.z,
        })
    }
}

/// Records usable by the fitter
pub fn planar_samples(records: &[SweepRecord], max_abs_y: f64) -> Vec<CalibrationSample> {
    let samples: Vec<_> = records.iter().filter_map(|r| r.to_sample(max_abs_y)).collect();
    let dropped = records.len() - samples.len();
    if dropped > 0 {
        warn!("Dropped {} samples with |y| > {:.1} mm", dropped, max_abs_y);
    }
    samples
}

enum Approach {
    Reached(Feedback),
    /// Stopped by the guard or the box; `base` is where to retreat
    Aborted { reason: String, base: f64 },
    /// Feedback went missing, position unknown
    Lost,
}

/// Walk the sweep grid and return one record per grid point reached
///
/// The starting candle pose is recorded too when it lies inside the box.
pub fn collect_samples<L: ArmLink>(
    controller: &MotionController<L>,
    plan: &SweepPlan,
) -> Result<Vec<SweepRecord>> {
    let gripper = controller.settings().tool.gripper;
    let settle = Duration::from_millis(plan.step_settle_ms);
    let mut records = Vec::new();

    info!(
        "Collecting samples over {} shoulder x {} elbow angles",
        plan.shoulders.len(),
        plan.elbows.len()
    );

    let start = controller.sweep_step(candle_joints(gripper), plan.speed, settle)?;
    match box_violation(plan, &start) {
        None => records.push(SweepRecord::from_feedback(&start)),
        Some(reason) => warn!("Candle pose not recorded: {}", reason),
    }

    for &shoulder in &plan.shoulders {
        for &elbow in &plan.elbows {
            match approach(controller, plan, shoulder, elbow, gripper, settle)? {
                Approach::Reached(fb) => {
                    debug!(
                        "sample s={:.3} e={:.3} -> x={:.1} z={:.1}",
                        fb.shoulder, fb.elbow, fb.x, fb.z
                    );
                    records.push(SweepRecord::from_feedback(&fb));
                }
                Approach::Aborted { reason, base } => {
                    warn!(
                        "Skipping shoulder {:.2} elbow {:.2}: {}",
                        shoulder, elbow, reason
                    );
                    let retreat = JointAngles {
                        base,
                        ..candle_joints(gripper)
                    };
                    controller.sweep_step(retreat, plan.speed, settle)?;
                }
                Approach::Lost => {
                    warn!(
                        "Skipping shoulder {:.2} elbow {:.2}: no feedback",
                        shoulder, elbow
                    );
                }
            }
        }
    }

    info!("Collected {} samples", records.len());
    Ok(records)
}

fn approach<L: ArmLink>(
    controller: &MotionController<L>,
    plan: &SweepPlan,
    shoulder: f64,
    elbow: f64,
    gripper: f64,
    settle: Duration,
) -> Result<Approach> {
    let start = match controller.get_pose() {
        Ok(fb) => fb,
        Err(ArmError::Timeout(_)) => return Ok(Approach::Lost),
        Err(e) => return Err(e),
    };

    let steps = plan.steps.max(1);
    let mut last = start;
    for k in 1..=steps {
        let u = f64::from(k) / f64::from(steps);
        let joints = JointAngles {
            base: lerp(start.base, 0.0, u),
            shoulder: lerp(start.shoulder, shoulder, u),
            elbow: lerp(start.elbow, elbow, u),
            wrist: 0.0,
            roll: 0.0,
            gripper,
        };

        let fb = match controller.sweep_step(joints, plan.speed, settle) {
            Ok(fb) => fb,
            Err(ArmError::LimitViolation { reason }) => {
                return Ok(Approach::Aborted {
                    reason,
                    base: last.base,
                });
            }
            Err(ArmError::Timeout(_)) => return Ok(Approach::Lost),
            Err(e) => return Err(e),
        };

        if let Some(reason) = box_violation(plan, &fb) {
            return Ok(Approach::Aborted {
                reason,
                base: fb.base,
            });
        }
        last = fb;
    }
    Ok(Approach::Reached(last))
}

fn lerp(from: f64, to: f64, u: f64) -> f64 {
    from + u * (to - from)
}

fn box_violation(plan: &SweepPlan, fb: &Feedback) -> Option<String> {
    if !(fb.z >= plan.z_min) {
        Some(format!("z {:.1} mm below {:.1} mm", fb.z, plan.z_min))
    } else if !(fb.x >= plan.x_min && fb.x <= plan.x_max) {
        Some(format!(
            "x {:.1} mm outside [{:.1}, {:.1}] mm",
            fb.x, plan.x_min, plan.x_max
        ))
    } else {
        None
    }
}

pub fn write_samples_csv(path: &Path, records: &[SweepRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ArmError::Io(e.into_error()))?;
    write_atomic(path, &bytes)?;
    info!("Wrote {} samples to {}", records.len(), path.display());
    Ok(())
}

/// Read samples; files written by older collection scripts (`b_fb`, `s_fb`,
/// `e_fb` columns) are accepted too
pub fn read_samples_csv(path: &Path) -> Result<Vec<SweepRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<SweepRecord>, _>>()?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::SimLink;
    use crate::arm::link::mock::MockLink;
    use crate::calibration::{Calibration, CalibrationCell, CalibrationParameters, fit};
    use crate::config::{ArmConfig, FitOptions};
    use crate::messages::Command;
    use approx::assert_abs_diff_eq;

    fn config() -> ArmConfig {
        let mut config = ArmConfig::default();
        config.motion.settle_ms = 0;
        config.motion.feedback_timeout_ms = 20;
        config.sweep.step_settle_ms = 0;
        config
    }

    fn controller<L: ArmLink>(link: L, config: &ArmConfig) -> MotionController<L> {
        let cell =
            CalibrationCell::new(Calibration::initial(CalibrationParameters::reference()).unwrap());
        MotionController::new(link, cell, config)
    }

    #[test]
    fn test_sweep_skips_points_below_floor_and_fits() {
        let config = config();
        let sim = SimLink::new(CalibrationParameters::reference()).unwrap();
        let controller = controller(sim, &config);

        let records = collect_samples(&controller, &config.sweep).unwrap();
        // Candle plus 22 of the 25 grid points; the rest dip below the floor
        assert_eq!(records.len(), 23);
        assert!(records.iter().all(|r| r.z >= config.safety.z_floor));

        let samples = planar_samples(&records, config.fit.max_abs_y);
        assert_eq!(samples.len(), 23);
        let report = fit(&samples, &FitOptions::default()).unwrap();
        assert!(report.rms() < 1e-6);
        assert_abs_diff_eq!(report.params().l1, 238.839, epsilon = 1e-3);
    }

    #[test]
    fn test_box_violation_retreats_to_candle() {
        let mut config = config();
        config.sweep.shoulders = vec![0.6];
        config.sweep.elbows = vec![1.0];
        config.sweep.z_min = 300.0;
        let sim = SimLink::new(CalibrationParameters::reference()).unwrap();
        let controller = controller(sim, &config);

        let records = collect_samples(&controller, &config.sweep).unwrap();
        assert_eq!(records.len(), 1);

        let sim = controller.into_link();
        assert_eq!(sim.joints().shoulder, 0.0);
        assert_eq!(sim.joints().elbow, 0.0);
    }

    #[test]
    fn test_missing_feedback_skips_points() {
        let config = config();
        let candle = Feedback {
            x: 43.0,
            z: 553.0,
            ..Feedback::default()
        };
        let controller = controller(MockLink::with_feedback([candle]), &config);

        let records = collect_samples(&controller, &config.sweep).unwrap();
        assert_eq!(records.len(), 1);

        let link = controller.into_link();
        assert_eq!(link.motion().len(), 1);
        assert!(matches!(link.motion()[0], Command::JointMove(_)));
    }

    #[test]
    fn test_y_filter() {
        let on_plane = SweepRecord {
            base: 0.0,
            shoulder: 0.1,
            elbow: 1.0,
            x: 300.0,
            y: 1.5,
            z: 300.0,
        };
        let off_plane = SweepRecord { y: 12.0, ..on_plane };
        let samples = planar_samples(&[on_plane, off_plane], 2.0);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].shoulder, 0.1);
    }

    #[test]
    fn test_csv_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        let record = SweepRecord {
            base: 0.0,
            shoulder: -0.3,
            elbow: 1.4,
            x: 246.4,
            y: 0.0,
            z: 366.8,
        };
        write_samples_csv(&path, &[record]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("base,shoulder,elbow,x,y,z"));
        assert_eq!(read_samples_csv(&path).unwrap(), vec![record]);
    }

    #[test]
    fn test_reads_legacy_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples_safe.csv");
        std::fs::write(
            &path,
            "t_unix,base_cmd,shoulder_cmd,elbow_cmd,x,y,z,tit,b_fb,s_fb,e_fb,t_fb,r_fb,g_fb\n\
             1700000000.0,0.0,0.3,1.0,406.9,0.1,289.2,0,0.001,0.302,0.998,0,0,3.1\n",
        )
        .unwrap();

        let records = read_samples_csv(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].shoulder, 0.302);
        assert_eq!(records[0].elbow, 0.998);
        assert_eq!(records[0].z, 289.2);
    }
}
