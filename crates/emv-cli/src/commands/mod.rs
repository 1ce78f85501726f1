pub mod dump;
pub mod fuzz;
pub mod read;
pub mod status;

use anyhow::Context;
use emv_ca_keys::CaKeyStore;
use emv_card::ReaderConfig;
use tracing::warn;

use crate::GlobalArgs;

/// Configuration file, if any, with command-line overrides applied
pub(crate) fn load_config(global: &GlobalArgs) -> anyhow::Result<ReaderConfig> {
    let mut config = match &global.config {
        Some(path) => ReaderConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ReaderConfig::default(),
    };
    if let Some(timeout_ms) = global.timeout_ms {
        config.exchange_timeout_ms = timeout_ms;
    }
    Ok(config)
}

/// CA keys named by the configuration; a missing file only disables issuer key recovery
pub(crate) fn load_ca_keys(config: &ReaderConfig) -> Option<CaKeyStore> {
    let path = config.ca_keys_path.as_ref()?;
    match CaKeyStore::load(path) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "CA keys unavailable, ROCA test on the issuer key is skipped");
            None
        }
    }
}
