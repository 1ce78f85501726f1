//! Hardware-dependent integration tests
//!
//! These tests require a physical EMV card in a card reader.
//! They are ignored by default and must be explicitly run with:
//!
//!     cargo test --package emv-card --test hardware_integration -- --ignored

use emv_card::apdu::commands;
use emv_card::protocol::aids;
use emv_card::reader::CardReader;
use emv_card::transport::Transport;
use emv_card::{EmvWorkflow, ReaderConfig, WorkflowState};

/// **Requires**: Card reader connected (card not required)
#[test]
#[ignore = "requires hardware: card reader"]
fn test_list_readers() {
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let readers = reader.list_readers().expect("Failed to list readers");
    assert!(!readers.is_empty(), "No card reader connected");
}

/// **Requires**: EMV card (credit/debit card) inserted
#[test]
#[ignore = "requires hardware: EMV card"]
fn test_select_emv_application() {
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let mut transport = reader.connect_first().expect("Failed to connect to card");

    let selected = [aids::VISA, aids::MASTERCARD, aids::AMEX]
        .iter()
        .filter_map(|aid| commands::select(aid).send(&mut transport).ok())
        .any(|response| response.is_success());

    assert!(selected, "No EMV application could be selected from {}", transport.name());
}

/// Full read; the card must reach `Finalized` with an AID and a masked PAN
///
/// **Requires**: EMV card inserted
#[test]
#[ignore = "requires hardware: EMV card"]
fn test_full_workflow() {
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let mut transport = reader.connect_first().expect("Failed to connect to card");

    let mut workflow =
        EmvWorkflow::new(&mut transport, ReaderConfig::default()).expect("default config is valid");
    let card = workflow.run().expect("workflow failed");

    assert_eq!(workflow.state(), WorkflowState::Finalized);
    assert!(!card.application_id.is_empty(), "No application selected");
    assert!(card.masked_pan.contains('*'), "PAN not read: {}", card.masked_pan);
    assert!(!card.aip.is_empty(), "No AIP returned");
}
