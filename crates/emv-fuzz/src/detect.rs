//! Anomaly detection against a baseline response

use emv_card::TransportError;
use emv_common::StatusWord;

use crate::model::{AnomalyKind, Severity};

/// What one exchange produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Raw response, status word included
    Response(Vec<u8>),
    Failed(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Disconnected,
    Timeout,
    Other,
}

impl Observation {
    pub fn from_result(result: Result<Vec<u8>, TransportError>) -> Self {
        match result {
            Ok(response) => Observation::Response(response),
            Err(e) if e.is_disconnect() => Observation::Failed(FailureKind::Disconnected),
            Err(TransportError::Timeout(_) | TransportError::NoResponse) => {
                Observation::Failed(FailureKind::Timeout)
            }
            Err(_) => Observation::Failed(FailureKind::Other),
        }
    }

    pub fn response(&self) -> Option<&[u8]> {
        match self {
            Observation::Response(bytes) => Some(bytes),
            Observation::Failed(_) => None,
        }
    }

    pub fn status(&self) -> Option<StatusWord> {
        self.response().and_then(StatusWord::from_response)
    }
}

/// A classified deviation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
}

impl Finding {
    fn new(kind: AnomalyKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
        }
    }
}

/// Compare a mutated command's outcome with the unmutated baseline
///
/// `None` means the card behaved within expectations. A refusal with a
/// standard status word is the expected answer to most mutations.
pub fn classify(baseline: Option<&[u8]>, observed: &Observation) -> Option<Finding> {
    let response = match observed {
        Observation::Failed(FailureKind::Disconnected) => {
            return Some(Finding::new(
                AnomalyKind::Disconnect,
                Severity::Critical,
                "card disconnected after command",
            ))
        }
        Observation::Failed(FailureKind::Timeout) => {
            return Some(Finding::new(AnomalyKind::NoResponse, Severity::High, "no response"))
        }
        Observation::Failed(FailureKind::Other) => {
            return Some(Finding::new(
                AnomalyKind::NoResponse,
                Severity::Medium,
                "transport failure",
            ))
        }
        Observation::Response(response) => response,
    };

    let Some(status) = StatusWord::from_response(response) else {
        return Some(Finding::new(
            AnomalyKind::MalformedResponse,
            Severity::High,
            format!("{}-byte response without status word", response.len()),
        ));
    };

    if status.sw1() == 0x6F {
        return Some(Finding::new(
            AnomalyKind::UnexpectedStatus,
            Severity::High,
            format!("{status}: {}", status.describe()),
        ));
    }
    if !status.is_known() {
        return Some(Finding::new(
            AnomalyKind::UnexpectedStatus,
            Severity::Low,
            format!("{status}: not a standard status word"),
        ));
    }

    let baseline_status = baseline.and_then(StatusWord::from_response);
    let baseline_accepted = baseline_status.is_some_and(|sw| sw.is_success());

    if status.is_success() && !baseline_accepted {
        return Some(Finding::new(
            AnomalyKind::AcceptedMalformed,
            Severity::High,
            format!(
                "mutated command accepted ({status}) where the original got {}",
                baseline_status.map(|sw| sw.to_string()).unwrap_or_else(|| "nothing".into())
            ),
        ));
    }

    if let Some(baseline) = baseline {
        if baseline_status == Some(status)
            && status.is_success()
            && baseline.len() != response.len()
        {
            return Some(Finding::new(
                AnomalyKind::ResponseShape,
                Severity::Low,
                format!(
                    "{status} with {} bytes, baseline had {}",
                    response.len() - 2,
                    baseline.len() - 2
                ),
            ));
        }
    }

    None
}

/// Two answers to the same unmutated command that disagree in status or length
pub fn compare_baselines(first: &Observation, second: &Observation) -> Option<Finding> {
    match (first, second) {
        (Observation::Response(a), Observation::Response(b)) => {
            let (sa, sb) = (StatusWord::from_response(a), StatusWord::from_response(b));
            (sa != sb || a.len() != b.len()).then(|| {
                Finding::new(
                    AnomalyKind::InconsistentBaseline,
                    Severity::Medium,
                    format!(
                        "repeated command answered {} then {}",
                        hex::encode_upper(a),
                        hex::encode_upper(b)
                    ),
                )
            })
        }
        (a, b) if a == b => None,
        _ => Some(Finding::new(
            AnomalyKind::InconsistentBaseline,
            Severity::Medium,
            "repeated command answered only once",
        )),
    }
}
