//! Reproducibility testing of recorded anomalies

use emv_card::Transport;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::detect::{classify, FailureKind, Observation};
use crate::model::{hex_serde, Anomaly, AnomalyKind};

pub const DEFAULT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproductionReport {
    pub anomaly_id: Option<Uuid>,
    #[serde(with = "hex_serde")]
    pub command: Vec<u8>,
    pub attempts: u32,
    /// Executions classified as the same kind of anomaly
    pub reproduced: u32,
    pub reproduction_rate: f64,
    /// Every execution answered with exactly the same bytes
    pub consistent_behavior: bool,
    /// Response hex per attempt, or the failure kind
    pub responses: Vec<String>,
}

/// Re-send an anomaly's command `attempts` times (at least once)
pub fn test_reproducibility(
    transport: &mut dyn Transport,
    anomaly: &Anomaly,
    attempts: u32,
) -> ReproductionReport {
    let mut report = reproduce(
        transport,
        &anomaly.command,
        anomaly.baseline.as_deref(),
        anomaly.kind,
        attempts,
    );
    report.anomaly_id = Some(anomaly.id);
    report
}

/// Re-send `command` and count outcomes classified as `kind` against `baseline`
pub fn reproduce(
    transport: &mut dyn Transport,
    command: &[u8],
    baseline: Option<&[u8]>,
    kind: AnomalyKind,
    attempts: u32,
) -> ReproductionReport {
    let attempts = attempts.max(1);
    let observations: Vec<Observation> = (0..attempts)
        .map(|_| Observation::from_result(transport.transmit(command)))
        .collect();

    let reproduced = observations
        .iter()
        .filter(|observed| classify(baseline, observed).is_some_and(|f| f.kind == kind))
        .count() as u32;
    let consistent_behavior = observations.windows(2).all(|pair| pair[0] == pair[1]);

    let report = ReproductionReport {
        anomaly_id: None,
        command: command.to_vec(),
        attempts,
        reproduced,
        reproduction_rate: f64::from(reproduced) / f64::from(attempts),
        consistent_behavior,
        responses: observations.iter().map(describe).collect(),
    };
    info!(
        command = %hex::encode_upper(command),
        reproduced,
        attempts,
        consistent = consistent_behavior,
        "Reproduction finished"
    );
    report
}

fn describe(observed: &Observation) -> String {
    match observed {
        Observation::Response(bytes) => hex::encode_upper(bytes),
        Observation::Failed(FailureKind::Disconnected) => "disconnected".into(),
        Observation::Failed(FailureKind::Timeout) => "timeout".into(),
        Observation::Failed(FailureKind::Other) => "transport error".into(),
    }
}
