//! Session, anomaly, terminal and preset records

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emv_common::{decode_hex, StatusWord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FuzzError;
use crate::mutate::FuzzStrategy;

/// Byte strings travel as uppercase hex in every exported document
pub(crate) mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&hex::encode_upper(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Anomaly severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// How a response deviated from the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The card went away (reset, removed, crashed)
    Disconnect,
    /// No answer within the exchange timeout
    NoResponse,
    /// A response too short to carry a status word
    MalformedResponse,
    /// Status word outside the ISO 7816 / EMV vocabulary, or 6Fxx
    UnexpectedStatus,
    /// A mutated command accepted where the original was refused
    AcceptedMalformed,
    /// Same status as the baseline but a different response length
    ResponseShape,
    /// The unmutated command answered differently on repetition
    InconsistentBaseline,
}

/// One deviation recorded during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub session_id: Uuid,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub strategy: FuzzStrategy,
    #[serde(with = "hex_serde")]
    pub command: Vec<u8>,
    /// Raw response, status word included; absent on transport failure
    #[serde(with = "hex_serde::option", default)]
    pub response: Option<Vec<u8>>,
    /// Response to the unmutated command
    #[serde(with = "hex_serde::option", default)]
    pub baseline: Option<Vec<u8>>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    /// Reproductions matching the original anomaly, out of `reproduction_attempts`
    #[serde(default)]
    pub reproduced: u32,
    #[serde(default)]
    pub reproduction_attempts: u32,
}

impl Anomaly {
    pub fn status(&self) -> Option<StatusWord> {
        self.response.as_deref().and_then(StatusWord::from_response)
    }
}

/// Session lifecycle
///
/// ```text
/// created -> running <-> paused
///              |           |
///              v           v
///      completed | aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Created, Aborted)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Aborted)
                | (Paused, Running)
                | (Paused, Aborted)
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Aggregate counters for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetrics {
    pub commands_sent: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub anomalies: u64,
    /// Status word hex to occurrence count
    pub status_words: BTreeMap<String, u64>,
    pub mean_response_ms: f64,
}

impl SessionMetrics {
    pub fn record_response(&mut self, status: Option<StatusWord>, elapsed: Duration) {
        self.responses += 1;
        if let Some(status) = status {
            *self.status_words.entry(status.to_string()).or_default() += 1;
        }
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.mean_response_ms += (ms - self.mean_response_ms) / self.responses as f64;
    }

    pub fn distinct_status_words(&self) -> usize {
        self.status_words.len()
    }
}

/// A target terminal or reader under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: Uuid,
    pub name: String,
    /// Transport label (`pcsc`, `pn532:/dev/rfcomm0`, `mock`)
    pub transport: String,
    #[serde(default)]
    pub notes: String,
}

impl Terminal {
    pub fn new(name: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            transport: transport.into(),
            notes: String::new(),
        }
    }
}

/// Named recipe for a session: which commands to mutate, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzPreset {
    pub name: String,
    pub strategy: FuzzStrategy,
    /// Base commands, hex
    pub commands: Vec<String>,
    /// Mutations generated per base command
    pub iterations: usize,
    /// Seed for the mutator; the same seed replays the same commands
    pub seed: u64,
    /// Abort after this many transport failures in a row
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl FuzzPreset {
    pub fn new(name: impl Into<String>, strategy: FuzzStrategy, commands: &[&str]) -> Self {
        Self {
            name: name.into(),
            strategy,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            iterations: 32,
            seed: 0,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }

    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Decoded base commands; each must at least carry CLA INS P1 P2
    pub fn base_commands(&self) -> Result<Vec<Vec<u8>>, FuzzError> {
        self.commands
            .iter()
            .map(|hex| {
                let invalid = |reason: String| FuzzError::InvalidPreset {
                    name: self.name.clone(),
                    reason,
                };
                let bytes = decode_hex(hex).map_err(|e| invalid(e.to_string()))?;
                if bytes.len() < 4 {
                    return Err(invalid(format!("{hex} is shorter than a command header")));
                }
                Ok(bytes)
            })
            .collect()
    }

    /// Presets shipped with the tool
    pub fn builtin() -> Vec<FuzzPreset> {
        const SELECT_PPSE: &str = "00A404000E325041592E5359532E444446303100";
        const GPO_EMPTY: &str = "80A8000002830000";
        const READ_RECORD: &str = "00B2010C00";
        vec![
            FuzzPreset::new("select-bitflip", FuzzStrategy::BitFlip, &[SELECT_PPSE]),
            FuzzPreset::new("gpo-random", FuzzStrategy::RandomData, &[GPO_EMPTY]),
            FuzzPreset::new("record-boundaries", FuzzStrategy::BoundaryValues, &[READ_RECORD]),
            FuzzPreset::new("instruction-sweep", FuzzStrategy::InstructionSweep, &["00000000"])
                .iterations(256),
            FuzzPreset::new(
                "length-mismatch",
                FuzzStrategy::LengthMismatch,
                &[SELECT_PPSE, GPO_EMPTY],
            ),
        ]
    }
}

/// One fuzzing run against one terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzSession {
    pub id: Uuid,
    pub terminal_id: Uuid,
    pub preset: String,
    pub strategy: FuzzStrategy,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: SessionMetrics,
}

impl FuzzSession {
    pub fn new(terminal: &Terminal, preset: &FuzzPreset) -> Self {
        Self {
            id: Uuid::new_v4(),
            terminal_id: terminal.id,
            preset: preset.name.clone(),
            strategy: preset.strategy,
            status: SessionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            metrics: SessionMetrics::default(),
        }
    }

    /// Move to `to`, stamping start and end times
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), FuzzError> {
        if !self.status.can_transition_to(to) {
            return Err(FuzzError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if to == SessionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_finished() {
            self.ended_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let terminal = Terminal::new("bench", "mock");
        let preset = FuzzPreset::new("p", FuzzStrategy::BitFlip, &["00A40400"]);
        let mut session = FuzzSession::new(&terminal, &preset);

        session.transition(SessionStatus::Running).unwrap();
        let started = session.started_at;
        session.transition(SessionStatus::Paused).unwrap();
        session.transition(SessionStatus::Running).unwrap();
        assert_eq!(session.started_at, started);
        session.transition(SessionStatus::Completed).unwrap();
        assert!(session.ended_at.is_some());
        assert!(session.duration().is_some());

        assert!(matches!(
            session.transition(SessionStatus::Running),
            Err(FuzzError::InvalidTransition {
                from: SessionStatus::Completed,
                to: SessionStatus::Running
            })
        ));
    }

    #[test]
    fn test_created_cannot_pause() {
        assert!(!SessionStatus::Created.can_transition_to(SessionStatus::Paused));
        assert!(!SessionStatus::Paused.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Created.can_transition_to(SessionStatus::Aborted));
    }

    #[test]
    fn test_metrics_mean() {
        let mut metrics = SessionMetrics::default();
        metrics.record_response(Some(StatusWord(0x9000)), Duration::from_millis(10));
        metrics.record_response(Some(StatusWord(0x6A82)), Duration::from_millis(30));
        metrics.record_response(Some(StatusWord(0x9000)), Duration::from_millis(20));
        assert_eq!(metrics.responses, 3);
        assert!((metrics.mean_response_ms - 20.0).abs() < 1e-9);
        assert_eq!(metrics.distinct_status_words(), 2);
        assert_eq!(metrics.status_words["9000"], 2);
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_preset_rejects_short_command() {
        let preset = FuzzPreset::new("bad", FuzzStrategy::BitFlip, &["00A4"]);
        assert!(matches!(preset.base_commands(), Err(FuzzError::InvalidPreset { .. })));
        for preset in FuzzPreset::builtin() {
            assert!(preset.base_commands().is_ok(), "{}", preset.name);
        }
    }
}
