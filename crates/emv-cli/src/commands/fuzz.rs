use std::path::PathBuf;

use anyhow::Context;
use emv_fuzz::{
    test_reproducibility, write_session_export, FuzzEngine, FuzzPreset, FuzzStore, SessionStatus,
    Terminal,
};
use tracing::info;

use crate::transport::open_transport;
use crate::GlobalArgs;

use super::load_config;

pub struct FuzzOptions {
    pub preset: String,
    pub out: PathBuf,
    pub seed: Option<u64>,
    pub terminal: String,
    pub reproduce: Option<u32>,
}

pub fn list_presets() {
    for preset in FuzzPreset::builtin() {
        println!(
            "{:<20} {:<18} {} base command(s), {} mutations each",
            preset.name,
            preset.strategy,
            preset.commands.len(),
            preset.iterations
        );
    }
}

pub fn cmd_fuzz(global: &GlobalArgs, options: &FuzzOptions) -> anyhow::Result<()> {
    let config = load_config(global)?;
    let mut store = FuzzStore::with_builtin_presets();

    let mut preset = store
        .preset(&options.preset)
        .cloned()
        .with_context(|| format!("unknown preset {}; try --list", options.preset))?;
    if let Some(seed) = options.seed {
        preset = preset.seed(seed);
        store.add_preset(preset);
    }

    let kind = format!("{:?}", global.reader).to_lowercase();
    let terminal = store.add_terminal(Terminal::new(&options.terminal, kind));
    let session_id = store.create_session(terminal, &options.preset)?;

    let mut transport = open_transport(global.reader, global.port.as_deref())?;
    let outcome = FuzzEngine::new(transport.as_mut())
        .with_timeout(config.exchange_timeout())
        .run_stored(&mut store, session_id)?;

    if let Some(attempts) = options.reproduce {
        let anomalies: Vec<_> = store.anomalies_for(session_id).into_iter().cloned().collect();
        for anomaly in &anomalies {
            let report = test_reproducibility(transport.as_mut(), anomaly, attempts);
            store.record_reproduction(anomaly.id, &report)?;
        }
    }

    let session = store.session(session_id)?;
    let metrics = &session.metrics;
    println!("Session {session_id} {outcome}");
    println!(
        "  {} commands, {} responses, {} timeouts, {} transport errors",
        metrics.commands_sent, metrics.responses, metrics.timeouts, metrics.transport_errors
    );
    println!(
        "  {} distinct status words, mean response {:.1} ms",
        metrics.distinct_status_words(),
        metrics.mean_response_ms
    );
    for anomaly in store.anomalies_for(session_id) {
        println!(
            "  [{}] {} -> {}  {}",
            anomaly.severity,
            hex::encode_upper(&anomaly.command),
            anomaly.response.as_deref().map(hex::encode_upper).unwrap_or_else(|| "-".into()),
            anomaly.description
        );
    }

    let path = write_session_export(&store, session_id, &options.out)?;
    info!(path = %path.display(), "Export written");
    println!("Export: {}", path.display());

    if outcome == SessionStatus::Aborted {
        anyhow::bail!("session aborted: terminal stopped answering");
    }
    Ok(())
}
