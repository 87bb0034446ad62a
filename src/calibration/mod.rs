// Calibration parameters for the planar arm model
//
// The live record is a versioned value behind an ArcSwap. Readers take a
// snapshot per operation; the only writer is `CalibrationCell::publish`, which
// accepts nothing but a fitter report.

mod fit;
mod sweep;

pub use fit::{CalibrationSample, FitReport, fit};
pub use sweep::{
    SweepRecord, collect_samples, planar_samples, read_samples_csv, write_samples_csv,
};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ArmError, Result};
use crate::persist::write_atomic;

/// Link lengths, frame offsets and joint zero offsets of the planar model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Shoulder -> elbow (mm)
    #[serde(rename = "L1")]
    pub l1: f64,
    /// Elbow -> tool (mm)
    #[serde(rename = "L2")]
    pub l2: f64,
    #[serde(rename = "X0")]
    pub x0: f64,
    #[serde(rename = "Z0")]
    pub z0: f64,
    /// rad
    pub shoulder_offset: f64,
    /// rad
    pub elbow_offset: f64,
}

impl CalibrationParameters {
    /// Values fitted on the reference arm
    pub fn reference() -> Self {
        Self {
            l1: 238.839,
            l2: 316.731,
            x0: -0.186,
            z0: -0.371,
            shoulder_offset: 0.126072,
            elbow_offset: -0.085031,
        }
    }

    pub(crate) fn to_array(self) -> [f64; 6] {
        [
            self.l1,
            self.l2,
            self.x0,
            self.z0,
            self.shoulder_offset,
            self.elbow_offset,
        ]
    }

    pub(crate) fn from_array(p: [f64; 6]) -> Self {
        Self {
            l1: p[0],
            l2: p[1],
            x0: p[2],
            z0: p[3],
            shoulder_offset: p[4],
            elbow_offset: p[5],
        }
    }

    /// Link lengths must be positive and every value finite
    pub fn validate(&self) -> Result<()> {
        if self.to_array().iter().any(|v| !v.is_finite()) {
            return Err(ArmError::Validation(format!(
                "calibration contains non-finite values: {:?}",
                self
            )));
        }
        if self.l1 <= 0.0 || self.l2 <= 0.0 {
            return Err(ArmError::Validation(format!(
                "link lengths must be positive (L1={}, L2={})",
                self.l1, self.l2
            )));
        }
        Ok(())
    }

}

/// On-disk form; the stamp is optional so hand-made legacy files still load
#[derive(Debug, Serialize, Deserialize)]
struct CalibrationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<u32>,
    #[serde(flatten)]
    params: CalibrationParameters,
}

fn stamp(version: u64, params: &CalibrationParameters) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_le_bytes());
    for value in params.to_array() {
        hasher.update(&value.to_le_bytes());
    }
    hasher.finalize()
}

/// A stamped, immutable calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    version: u64,
    params: CalibrationParameters,
}

impl Calibration {
    /// Version-0 record used to bootstrap before any fit has run
    pub fn initial(params: CalibrationParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self { version: 0, params })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn params(&self) -> &CalibrationParameters {
        &self.params
    }

    /// CRC32 over the little-endian bytes of the version and the six values
    pub fn checksum(&self) -> u32 {
        stamp(self.version, &self.params)
    }

    /// Load a record, rejecting it if its checksum stamp does not match
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let record: CalibrationRecord = serde_json::from_str(&text)?;
        record.params.validate()?;

        let version = match (record.version, record.checksum) {
            (Some(version), Some(stored)) => {
                let computed = stamp(version, &record.params);
                if stored != computed {
                    return Err(ArmError::CalibrationTampered {
                        path: path.display().to_string(),
                        stored,
                        computed,
                    });
                }
                version
            }
            _ => {
                warn!(
                    "Calibration {} has no version/checksum stamp; edits cannot be detected",
                    path.display()
                );
                0
            }
        };

        info!("Loaded calibration v{} from {}", version, path.display());
        Ok(Self {
            version,
            params: record.params,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let record = CalibrationRecord {
            version: Some(self.version),
            checksum: Some(self.checksum()),
            params: self.params,
        };
        let json = serde_json::to_string_pretty(&record)?;
        write_atomic(path, json.as_bytes())
    }
}

/// Shared handle to the live calibration
#[derive(Debug, Clone)]
pub struct CalibrationCell {
    current: Arc<ArcSwap<Calibration>>,
    /// Serialises publishers so the file on disk and the live record agree
    writer: Arc<Mutex<()>>,
}

impl CalibrationCell {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(calibration)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Load from `path`, or bootstrap from the reference values if it does not exist
    pub fn open_or_reference(path: &Path) -> Result<Self> {
        if path.exists() {
            Ok(Self::new(Calibration::load(path)?))
        } else {
            warn!(
                "No calibration at {}, using reference parameters",
                path.display()
            );
            Ok(Self::new(Calibration::initial(
                CalibrationParameters::reference(),
            )?))
        }
    }

    pub fn snapshot(&self) -> Arc<Calibration> {
        self.current.load_full()
    }

    /// Swap in the parameters from a successful fit as the next version
    pub fn publish(&self, report: &FitReport) -> Arc<Calibration> {
        let _writer = self.lock_writer();
        let next = self.next(report);
        self.swap(next, report)
    }

    /// Persist the next version first, then swap in that same record
    pub fn publish_to(&self, report: &FitReport, path: &Path) -> Result<Arc<Calibration>> {
        let _writer = self.lock_writer();
        let next = self.next(report);
        next.save(path)?;
        Ok(self.swap(next, report))
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self, report: &FitReport) -> Calibration {
        Calibration {
            version: self.current.load().version + 1,
            params: *report.params(),
        }
    }

    fn swap(&self, next: Calibration, report: &FitReport) -> Arc<Calibration> {
        let published = Arc::new(next);
        self.current.store(Arc::clone(&published));
        info!(
            "Published calibration v{} (rms {:.3} mm over {} samples)",
            published.version,
            report.rms(),
            report.samples_used()
        );
        published
    }
}
