//! EMV Card - contact and contactless EMV reading engine
//!
//! Drives a card through the EMV read sequence as an explicit state machine
//! ([`workflow`]), records every exchange in an [`ApduLog`], and pulls card
//! fields and security findings out of that log afterwards ([`extract`],
//! [`security`]). Transports are pluggable: PC/SC readers, a PN532 serial
//! frontend, or a scripted mock.

pub mod apdu;
pub mod card_data;
pub mod config;
pub mod crypto;
pub mod dol;
pub mod error;
pub mod extract;
pub mod log;
pub mod protocol;
pub mod reader;
pub mod security;
pub mod transport;
pub mod workflow;

pub use apdu::{ApduCommand, ApduResponse, CryptogramType};
pub use card_data::{EmvCardData, GenerateAcResult};
pub use config::ReaderConfig;
pub use dol::{DolBuilder, FillRule};
pub use error::{AnalysisError, ConfigError, TransportError, WorkflowError};
pub use extract::Extractor;
pub use log::{ApduLog, ApduLogEntry};
pub use reader::{CardReader, PcscTransport};
pub use security::{AuthenticationMethod, RocaResult, SecurityInfo};
pub use transport::{MockTransport, Transport};
pub use workflow::{CancelToken, CardDataSink, EmvWorkflow, WorkflowState};

/// Re-export commonly used types
pub use pcsc::Error as PcscError;
