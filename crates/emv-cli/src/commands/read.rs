use emv_card::EmvWorkflow;

use crate::formatters::{self, FormatMode};
use crate::transport::open_transport;
use crate::GlobalArgs;

use super::{load_ca_keys, load_config};

pub fn cmd_read(global: &GlobalArgs, json: bool, format: FormatMode) -> anyhow::Result<()> {
    let config = load_config(global)?;
    let ca_keys = load_ca_keys(&config);
    let mut transport = open_transport(global.reader, global.port.as_deref())?;

    let mut workflow = EmvWorkflow::new(transport.as_mut(), config)?;
    if let Some(store) = ca_keys {
        workflow = workflow.with_ca_keys(store);
    }
    let card = workflow.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&card)?);
    } else {
        formatters::print_card_data(&card, format);
        formatters::print_security_report(&card);
    }
    Ok(())
}
