// Error taxonomy shared by the link, kinematics, safety, fitter and mission store

use std::time::Duration;

/// Everything that can go wrong between a caller and the arm
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?} waiting for feedback")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(
        "Target unreachable: radius {radius:.3} mm is {distance:.3} mm outside the reachable band"
    )]
    Unreachable { radius: f64, distance: f64 },

    #[error("Limit violation: {reason}")]
    LimitViolation { reason: String },

    #[error("Calibration fit rejected: {0}")]
    Fit(String),

    #[error("Calibration record {path} failed its checksum (stored {stored:08X}, computed {computed:08X})")]
    CalibrationTampered {
        path: String,
        stored: u32,
        computed: u32,
    },

    #[error("Index {index} out of range for mission '{mission}' with {len} steps")]
    Index {
        mission: String,
        index: usize,
        len: usize,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Mission '{mission}' stopped at step {step} of pass {pass}: {source}")]
    Playback {
        mission: String,
        pass: u32,
        step: usize,
        #[source]
        source: Box<ArmError>,
    },
}

impl ArmError {
    pub(crate) fn limit(reason: impl Into<String>) -> Self {
        ArmError::LimitViolation {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArmError>;
