//! JSON export of sessions and their anomalies
//!
//! Readers must ignore fields they do not know; `export_version` changes
//! only when an existing field changes meaning or disappears.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::FuzzError;
use crate::model::{Anomaly, FuzzSession, Terminal};
use crate::store::FuzzStore;

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub export_version: u32,
    pub exported_at: DateTime<Utc>,
    pub generator: String,
    pub sessions: Vec<SessionExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: FuzzSession,
    pub terminal: Option<Terminal>,
    /// Most severe first, ties by anomaly id
    pub anomalies: Vec<Anomaly>,
}

/// Most severe first; equal severities ordered by id
pub fn sort_anomalies(anomalies: &mut [Anomaly]) {
    anomalies.sort_by_key(|a| (Reverse(a.severity), a.id));
}

impl ExportDocument {
    pub fn from_store(store: &FuzzStore, session_ids: &[Uuid]) -> Result<Self, FuzzError> {
        let sessions = session_ids
            .iter()
            .map(|&id| {
                let session = store.session(id)?.clone();
                let mut anomalies: Vec<Anomaly> =
                    store.anomalies_for(id).into_iter().cloned().collect();
                sort_anomalies(&mut anomalies);
                Ok(SessionExport {
                    terminal: store.terminal(session.terminal_id).cloned(),
                    session,
                    anomalies,
                })
            })
            .collect::<Result<Vec<_>, FuzzError>>()?;

        Ok(Self {
            export_version: EXPORT_VERSION,
            exported_at: Utc::now(),
            generator: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            sessions,
        })
    }

    pub fn to_json(&self) -> Result<String, FuzzError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, FuzzError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// `fuzz_<terminal>_<start>.json`, terminal name reduced to `[a-z0-9_-]`
pub fn export_filename(terminal_name: &str, started_at: DateTime<Utc>) -> String {
    let name: String = terminal_name
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    let name = if name.is_empty() { "terminal".to_string() } else { name };
    format!("fuzz_{name}_{}.json", started_at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Write one session's export into `dir` and return the file path
pub fn write_session_export(
    store: &FuzzStore,
    session_id: Uuid,
    dir: &Path,
) -> Result<PathBuf, FuzzError> {
    let session = store.session(session_id)?;
    let terminal_name = store
        .terminal(session.terminal_id)
        .map(|t| t.name.as_str())
        .unwrap_or("terminal");
    let started = session.started_at.unwrap_or(session.created_at);

    let document = ExportDocument::from_store(store, &[session_id])?;
    let path = dir.join(export_filename(terminal_name, started));
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, document.to_json()?)?;
    info!(
        path = %path.display(),
        anomalies = document.sessions[0].anomalies.len(),
        "Session exported"
    );
    Ok(path)
}
