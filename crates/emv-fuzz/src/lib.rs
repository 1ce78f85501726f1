//! EMV Fuzz - terminal fuzzing sessions
//!
//! A [`FuzzEngine`] sends a preset's base commands and their mutations over
//! any [`emv_card::Transport`], compares every answer with the unmutated
//! baseline and records deviations as [`Anomaly`] values. Sessions, anomalies,
//! terminals and presets live in a [`FuzzStore`]; anomalies can be re-tested
//! with [`test_reproducibility`] and sessions exported as JSON.

pub mod detect;
pub mod engine;
pub mod error;
pub mod export;
pub mod model;
pub mod mutate;
pub mod repro;
pub mod store;

pub use detect::{classify, Observation};
pub use engine::{FuzzEngine, FuzzRun, SessionControl};
pub use error::FuzzError;
pub use export::{export_filename, write_session_export, ExportDocument, EXPORT_VERSION};
pub use model::{
    Anomaly, AnomalyKind, FuzzPreset, FuzzSession, SessionMetrics, SessionStatus, Severity,
    Terminal,
};
pub use mutate::{FuzzStrategy, Mutator};
pub use repro::{test_reproducibility, ReproductionReport, DEFAULT_ATTEMPTS};
pub use store::FuzzStore;
