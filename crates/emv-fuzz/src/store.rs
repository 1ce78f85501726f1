//! In-memory catalog of terminals, presets, sessions and anomalies
//!
//! Anomalies belong to their session: deleting a session deletes them.
//! Terminals and presets are referenced by sessions, not owned.

use std::collections::BTreeMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::FuzzRun;
use crate::error::FuzzError;
use crate::model::{Anomaly, FuzzPreset, FuzzSession, SessionStatus, Terminal};
use crate::repro::ReproductionReport;

#[derive(Debug, Clone, Default)]
pub struct FuzzStore {
    terminals: BTreeMap<Uuid, Terminal>,
    presets: BTreeMap<String, FuzzPreset>,
    sessions: BTreeMap<Uuid, FuzzSession>,
    anomalies: BTreeMap<Uuid, Anomaly>,
}

impl FuzzStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with [`FuzzPreset::builtin`]
    pub fn with_builtin_presets() -> Self {
        let mut store = Self::new();
        for preset in FuzzPreset::builtin() {
            store.add_preset(preset);
        }
        store
    }

    pub fn add_terminal(&mut self, terminal: Terminal) -> Uuid {
        let id = terminal.id;
        self.terminals.insert(id, terminal);
        id
    }

    pub fn terminal(&self, id: Uuid) -> Option<&Terminal> {
        self.terminals.get(&id)
    }

    pub fn terminal_by_name(&self, name: &str) -> Option<&Terminal> {
        self.terminals.values().find(|t| t.name == name)
    }

    pub fn terminals(&self) -> impl Iterator<Item = &Terminal> {
        self.terminals.values()
    }

    /// Refused while any session still points at the terminal
    pub fn remove_terminal(&mut self, id: Uuid) -> Result<Terminal, FuzzError> {
        let terminal = self
            .terminals
            .get(&id)
            .ok_or_else(|| FuzzError::UnknownTerminal(id.to_string()))?;
        if self.sessions.values().any(|s| s.terminal_id == id) {
            return Err(FuzzError::TerminalInUse(terminal.name.clone()));
        }
        self.terminals
            .remove(&id)
            .ok_or_else(|| FuzzError::UnknownTerminal(id.to_string()))
    }

    /// Replaces any preset with the same name
    pub fn add_preset(&mut self, preset: FuzzPreset) {
        self.presets.insert(preset.name.clone(), preset);
    }

    pub fn preset(&self, name: &str) -> Option<&FuzzPreset> {
        self.presets.get(name)
    }

    pub fn presets(&self) -> impl Iterator<Item = &FuzzPreset> {
        self.presets.values()
    }

    pub fn create_session(&mut self, terminal_id: Uuid, preset: &str) -> Result<Uuid, FuzzError> {
        let terminal = self
            .terminals
            .get(&terminal_id)
            .ok_or_else(|| FuzzError::UnknownTerminal(terminal_id.to_string()))?;
        let preset = self
            .presets
            .get(preset)
            .ok_or_else(|| FuzzError::UnknownPreset(preset.to_string()))?;

        let session = FuzzSession::new(terminal, preset);
        let id = session.id;
        debug!(session = %id, terminal = %terminal.name, preset = %preset.name, "Session created");
        self.sessions.insert(id, session);
        Ok(id)
    }

    pub fn session(&self, id: Uuid) -> Result<&FuzzSession, FuzzError> {
        self.sessions.get(&id).ok_or(FuzzError::UnknownSession(id))
    }

    fn session_mut(&mut self, id: Uuid) -> Result<&mut FuzzSession, FuzzError> {
        self.sessions.get_mut(&id).ok_or(FuzzError::UnknownSession(id))
    }

    /// Sessions oldest first
    pub fn sessions(&self) -> Vec<&FuzzSession> {
        let mut sessions: Vec<&FuzzSession> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn transition(&mut self, id: Uuid, to: SessionStatus) -> Result<(), FuzzError> {
        let session = self.session_mut(id)?;
        let from = session.status;
        session.transition(to)?;
        info!(session = %id, from = %from, to = %to, "Session status changed");
        Ok(())
    }

    pub fn record_anomaly(&mut self, anomaly: Anomaly) -> Result<Uuid, FuzzError> {
        if !self.sessions.contains_key(&anomaly.session_id) {
            return Err(FuzzError::UnknownSession(anomaly.session_id));
        }
        let id = anomaly.id;
        self.anomalies.insert(id, anomaly);
        Ok(id)
    }

    pub fn anomaly(&self, id: Uuid) -> Result<&Anomaly, FuzzError> {
        self.anomalies.get(&id).ok_or(FuzzError::UnknownAnomaly(id))
    }

    /// A session's anomalies in detection order
    pub fn anomalies_for(&self, session_id: Uuid) -> Vec<&Anomaly> {
        let mut anomalies: Vec<&Anomaly> = self
            .anomalies
            .values()
            .filter(|a| a.session_id == session_id)
            .collect();
        anomalies.sort_by_key(|a| a.detected_at);
        anomalies
    }

    pub fn record_reproduction(
        &mut self,
        anomaly_id: Uuid,
        report: &ReproductionReport,
    ) -> Result<(), FuzzError> {
        let anomaly = self
            .anomalies
            .get_mut(&anomaly_id)
            .ok_or(FuzzError::UnknownAnomaly(anomaly_id))?;
        anomaly.reproduced = report.reproduced;
        anomaly.reproduction_attempts = report.attempts;
        Ok(())
    }

    /// Store a finished run: metrics, anomalies and the final status
    pub fn apply_run(&mut self, session_id: Uuid, run: FuzzRun) -> Result<(), FuzzError> {
        let session = self.session_mut(session_id)?;
        if session.status == SessionStatus::Paused {
            session.transition(SessionStatus::Running)?;
        }
        session.metrics = run.metrics;
        self.transition(session_id, run.outcome)?;
        for anomaly in run.anomalies {
            self.record_anomaly(anomaly)?;
        }
        Ok(())
    }

    /// Delete a session and every anomaly it owns
    pub fn delete_session(&mut self, id: Uuid) -> Result<FuzzSession, FuzzError> {
        let session = self.sessions.remove(&id).ok_or(FuzzError::UnknownSession(id))?;
        let before = self.anomalies.len();
        self.anomalies.retain(|_, a| a.session_id != id);
        debug!(session = %id, anomalies = before - self.anomalies.len(), "Session deleted");
        Ok(session)
    }
}
