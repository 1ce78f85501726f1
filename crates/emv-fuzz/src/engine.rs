//! Runs a preset against one terminal and records what deviates

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use emv_card::Transport;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detect::{classify, compare_baselines, FailureKind, Finding, Observation};
use crate::error::FuzzError;
use crate::model::{Anomaly, FuzzPreset, FuzzSession, SessionMetrics, SessionStatus};
use crate::mutate::Mutator;
use crate::store::FuzzStore;

/// Live run status shared between the engine and whoever steers it
///
/// The engine checks it before every command: `Paused` blocks until resumed,
/// `Aborted` ends the run.
#[derive(Debug, Clone)]
pub struct SessionControl {
    inner: Arc<(Mutex<SessionStatus>, Condvar)>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self {
            inner: Arc::new((Mutex::new(SessionStatus::Running), Condvar::new())),
        }
    }
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, status: SessionStatus) {
        let (lock, signal) = &*self.inner;
        let mut current = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != SessionStatus::Aborted {
            *current = status;
        }
        signal.notify_all();
    }

    pub fn pause(&self) {
        self.set(SessionStatus::Paused);
    }

    pub fn resume(&self) {
        self.set(SessionStatus::Running);
    }

    /// Final; a later `resume` does not undo it
    pub fn abort(&self) {
        self.set(SessionStatus::Aborted);
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while_paused(&self) -> SessionStatus {
        let (lock, signal) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = signal
            .wait_while(guard, |status| *status == SessionStatus::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Result of one engine run, applied to a store with [`FuzzStore::apply_run`]
#[derive(Debug, Clone)]
pub struct FuzzRun {
    pub metrics: SessionMetrics,
    pub anomalies: Vec<Anomaly>,
    /// `Completed` or `Aborted`
    pub outcome: SessionStatus,
}

pub struct FuzzEngine<'t> {
    transport: &'t mut dyn Transport,
    control: SessionControl,
    exchange_timeout: Duration,
}

impl<'t> FuzzEngine<'t> {
    pub fn new(transport: &'t mut dyn Transport) -> Self {
        Self {
            transport,
            control: SessionControl::new(),
            exchange_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_control(mut self, control: SessionControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self.transport.set_timeout(timeout);
        self
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Send each base command twice as a baseline, then every mutation of it
    pub fn run(
        &mut self,
        session: &FuzzSession,
        preset: &FuzzPreset,
    ) -> Result<FuzzRun, FuzzError> {
        let bases = preset.base_commands()?;
        let mut mutator = Mutator::new(preset.seed);
        let mut metrics = SessionMetrics::default();
        let mut anomalies = Vec::new();
        let mut consecutive_failures = 0u32;
        let mut outcome = SessionStatus::Completed;

        info!(
            session = %session.id,
            preset = %preset.name,
            strategy = %preset.strategy,
            commands = bases.len(),
            "Fuzzing session started"
        );

        'bases: for base in &bases {
            if self.control.wait_while_paused() == SessionStatus::Aborted {
                outcome = SessionStatus::Aborted;
                break;
            }
            let first = self.exchange(base, &mut metrics);
            let second = self.exchange(base, &mut metrics);
            if let Some(finding) = compare_baselines(&first, &second) {
                anomalies.push(self.record(session, finding, base, &second, first.response()));
            }
            let baseline = first.response().map(<[u8]>::to_vec);

            for mutated in mutator.mutations(preset.strategy, base, preset.iterations) {
                if self.control.wait_while_paused() == SessionStatus::Aborted {
                    outcome = SessionStatus::Aborted;
                    break 'bases;
                }

                let observed = self.exchange(&mutated, &mut metrics);
                if matches!(observed, Observation::Failed(_)) {
                    consecutive_failures += 1;
                } else {
                    consecutive_failures = 0;
                }

                if let Some(finding) = classify(baseline.as_deref(), &observed) {
                    anomalies.push(self.record(
                        session,
                        finding,
                        &mutated,
                        &observed,
                        baseline.as_deref(),
                    ));
                }

                if consecutive_failures > 0
                    && consecutive_failures >= preset.max_consecutive_failures
                {
                    warn!(
                        session = %session.id,
                        failures = consecutive_failures,
                        "Terminal stopped answering, aborting session"
                    );
                    outcome = SessionStatus::Aborted;
                    break 'bases;
                }
            }
        }

        metrics.anomalies = anomalies.len() as u64;
        info!(
            session = %session.id,
            outcome = %outcome,
            sent = metrics.commands_sent,
            anomalies = metrics.anomalies,
            mean_ms = metrics.mean_response_ms,
            "Fuzzing session finished"
        );
        Ok(FuzzRun {
            metrics,
            anomalies,
            outcome,
        })
    }

    /// Run a stored session, moving it through `running` to its outcome
    pub fn run_stored(
        &mut self,
        store: &mut FuzzStore,
        session_id: Uuid,
    ) -> Result<SessionStatus, FuzzError> {
        let session = store.session(session_id)?.clone();
        let preset = store
            .preset(&session.preset)
            .cloned()
            .ok_or_else(|| FuzzError::UnknownPreset(session.preset.clone()))?;

        store.transition(session_id, SessionStatus::Running)?;
        let run = self.run(&session, &preset)?;
        let outcome = run.outcome;
        store.apply_run(session_id, run)?;
        Ok(outcome)
    }

    fn exchange(&mut self, command: &[u8], metrics: &mut SessionMetrics) -> Observation {
        metrics.commands_sent += 1;
        let started = Instant::now();
        let result = self.transport.transmit(command);
        let elapsed = started.elapsed();

        let observed = if result.is_ok() && elapsed > self.exchange_timeout {
            Observation::Failed(FailureKind::Timeout)
        } else {
            Observation::from_result(result)
        };

        match &observed {
            Observation::Response(_) => metrics.record_response(observed.status(), elapsed),
            Observation::Failed(FailureKind::Timeout) => metrics.timeouts += 1,
            Observation::Failed(_) => metrics.transport_errors += 1,
        }
        debug!(
            command = %hex::encode_upper(command),
            status = %observed.status().map(|sw| sw.to_string()).unwrap_or_else(|| "-".into()),
            elapsed_ms = elapsed.as_millis() as u64,
            "Fuzz exchange"
        );
        observed
    }

    fn record(
        &self,
        session: &FuzzSession,
        finding: Finding,
        command: &[u8],
        observed: &Observation,
        baseline: Option<&[u8]>,
    ) -> Anomaly {
        warn!(
            severity = %finding.severity,
            kind = ?finding.kind,
            command = %hex::encode_upper(command),
            "{}",
            finding.description
        );
        Anomaly {
            id: Uuid::new_v4(),
            session_id: session.id,
            kind: finding.kind,
            severity: finding.severity,
            strategy: session.strategy,
            command: command.to_vec(),
            response: observed.response().map(<[u8]>::to_vec),
            baseline: baseline.map(<[u8]>::to_vec),
            description: finding.description,
            detected_at: Utc::now(),
            reproduced: 0,
            reproduction_attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnomalyKind, Terminal};
    use crate::mutate::FuzzStrategy;
    use emv_card::transport::{MockFailure, MockTransport};

    fn session_for(preset: &FuzzPreset) -> FuzzSession {
        FuzzSession::new(&Terminal::new("bench", "mock"), preset)
    }

    #[test]
    fn test_well_behaved_card_has_no_anomalies() {
        let mut mock = MockTransport::new()
            .respond(vec![0x00, 0xB2, 0x01, 0x0C], vec![0x70, 0x00, 0x90, 0x00])
            .fallback(vec![0x6A, 0x86]);
        let preset = FuzzPreset::new("records", FuzzStrategy::BoundaryValues, &["00B2010C00"]);
        let run = FuzzEngine::new(&mut mock).run(&session_for(&preset), &preset).unwrap();

        assert_eq!(run.outcome, SessionStatus::Completed);
        assert!(run.anomalies.is_empty(), "{:?}", run.anomalies);
        assert_eq!(run.metrics.commands_sent, run.metrics.responses);
        assert!(run.metrics.distinct_status_words() >= 2);
    }

    #[test]
    fn test_accepted_instruction_is_flagged() {
        let mut mock = MockTransport::new()
            .respond(vec![0x00, 0x84], vec![0x01, 0x02, 0x90, 0x00])
            .fallback(vec![0x6D, 0x00]);
        let preset = FuzzPreset::new("sweep", FuzzStrategy::InstructionSweep, &["00000000"])
            .iterations(300);
        let run = FuzzEngine::new(&mut mock).run(&session_for(&preset), &preset).unwrap();

        assert_eq!(run.anomalies.len(), 1);
        assert_eq!(run.anomalies[0].kind, AnomalyKind::AcceptedMalformed);
        assert_eq!(run.anomalies[0].command[1], 0x84);
        assert_eq!(run.metrics.anomalies, 1);
    }

    #[test]
    fn test_silent_terminal_aborts() {
        let mut mock = MockTransport::new().fail(Vec::<u8>::new(), MockFailure::NoResponse);
        let preset = FuzzPreset::new("dead", FuzzStrategy::BitFlip, &["00A4040000"]).iterations(50);
        let run = FuzzEngine::new(&mut mock).run(&session_for(&preset), &preset).unwrap();

        assert_eq!(run.outcome, SessionStatus::Aborted);
        assert_eq!(run.metrics.timeouts, 2 + preset.max_consecutive_failures as u64);
    }

    #[test]
    fn test_abort_before_start() {
        let mut mock = MockTransport::new().fallback(vec![0x90, 0x00]);
        let control = SessionControl::new();
        control.abort();
        control.resume();
        assert_eq!(control.status(), SessionStatus::Aborted);

        let preset = FuzzPreset::new("p", FuzzStrategy::BitFlip, &["00A4040000"]);
        let run = FuzzEngine::new(&mut mock)
            .with_control(control)
            .run(&session_for(&preset), &preset)
            .unwrap();
        assert_eq!(run.outcome, SessionStatus::Aborted);
        assert_eq!(run.metrics.commands_sent, 0);
    }
}
