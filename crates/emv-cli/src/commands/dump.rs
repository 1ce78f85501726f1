use emv_card::EmvWorkflow;
use tracing::warn;

use crate::formatters;
use crate::transport::open_transport;
use crate::GlobalArgs;

use super::load_config;

/// Dumps whatever was logged, also when the sequence stopped early
pub fn cmd_dump(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = load_config(global)?;
    let mut transport = open_transport(global.reader, global.port.as_deref())?;

    let mut workflow = EmvWorkflow::new(transport.as_mut(), config)?;
    if let Err(e) = workflow.run() {
        warn!(state = %workflow.state(), error = %e, "Read sequence stopped early");
    }

    let log = workflow.log();
    println!("=== {} exchanges, {} ms ===\n", log.len(), log.total_duration().as_millis());
    formatters::dump_log(log);
    Ok(())
}
