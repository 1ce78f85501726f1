//! End-to-end workflow runs against a scripted card

use std::time::Duration;

use emv_card::apdu::ins;
use emv_card::transport::{MockFailure, MockTransport};
use emv_card::{
    CancelToken, CryptogramType, EmvCardData, EmvWorkflow, ReaderConfig,
    TransportError, WorkflowError, WorkflowState,
};
use emv_common::{decode_hex, StatusWord};

const SELECT_PPSE: &str = "00A404000E325041592E5359532E4444463031";
const SELECT_PSE: &str = "00A404000E315041592E5359532E4444463031";
const SELECT_VISA: &str = "00A4040007A0000000031010";
const SELECT_MASTERCARD: &str = "00A4040007A0000000041010";

/// Directory listing Mastercard (priority 2) before Visa (priority 1)
const PPSE_FCI: &str = "6F31840E325041592E5359532E4444463031A51FBF0C1C\
610C4F07A0000000041010870102\
610C4F07A0000000031010870101";

/// Mastercard FCI with PDOL 9F0206 5F2A02 9F3704
const MASTERCARD_FCI: &str = "6F238407A0000000041010A518500A4D415354455243415244\
9F38099F02065F2A029F3704";

/// AIP 1980 (CDA), AFL SFI 1 records 1-2
const GPO: &str = "770A82021980940408010200";

/// PAN, expiry, CDOL1 (23 bytes of data), CDOL2 (6 bytes)
const RECORD_1: &str = "70275A0854133300890100105F24032712318C0E9F02069F03069F1A0295059F3704\
8D058A029F3704";

/// Log entry SFI 0B five records, log format 9A03 9F0206
const RECORD_2: &str = "700E9F4D020B059F4F069A039F0206";

fn ok(hex: &str) -> Vec<u8> {
    let mut bytes = decode_hex(hex).unwrap();
    bytes.extend_from_slice(&[0x90, 0x00]);
    bytes
}

fn raw(hex: &str) -> Vec<u8> {
    decode_hex(hex).unwrap()
}

/// A card that declines GENERATE AC but answers everything else
fn scripted_card() -> MockTransport {
    MockTransport::new()
        .respond(raw(SELECT_PPSE), ok(PPSE_FCI))
        .respond(raw(SELECT_VISA), vec![0x6A, 0x82])
        .respond(raw(SELECT_MASTERCARD), ok(MASTERCARD_FCI))
        .respond(vec![0x80, 0xA8], ok(GPO))
        .respond_exact(raw("00B2010C00"), ok(RECORD_1))
        .respond_exact(raw("00B2020C00"), ok(RECORD_2))
        .respond(vec![0x80, 0xAE], vec![0x69, 0x85])
        .respond_exact(raw("80CA9F3600"), ok("9F36020017"))
        .respond_exact(raw("00B2015C00"), ok("251016000000002500"))
        .respond_exact(raw("00B2025C00"), vec![0x6A, 0x83])
        .fallback(vec![0x6A, 0x88])
}

/// Contact card: no PPSE, a PSE whose directory file (SFI 2) lists Visa
fn contact_card() -> MockTransport {
    MockTransport::new()
        .respond(raw(SELECT_PPSE), vec![0x6A, 0x82])
        .respond(
            raw(SELECT_PSE),
            ok("6F15840E315041592E5359532E4444463031A503880102"),
        )
        .respond_exact(raw("00B2011400"), ok("700E610C4F07A0000000031010870101"))
        .respond_exact(raw("00B2021400"), vec![0x6A, 0x83])
        .respond(raw(SELECT_VISA), ok("6F0B8407A0000000031010A500"))
        .fallback(vec![0x6A, 0x88])
}

fn config() -> ReaderConfig {
    ReaderConfig::from_toml(
        r#"
[transaction]
amount = 2500
currency_code = 978
"#,
    )
    .unwrap()
}

#[test]
fn test_declined_ac_does_not_stop_later_phases() {
    let mut mock = scripted_card();
    let card = {
        let mut workflow = EmvWorkflow::new(&mut mock, config()).unwrap();
        let card = workflow.run().unwrap();
        assert_eq!(workflow.state(), WorkflowState::Finalized);
        card
    };

    // Fields from phases 1-4 survive the declined GENERATE AC
    assert_eq!(card.application_id, "A0000000041010");
    assert_eq!(card.application_label, "MASTERCARD");
    assert_eq!(card.masked_pan, "541333******0010");
    assert_eq!(card.aip, "1980");
    assert!(card.security.cda);
    assert!(!card.security.is_weak);

    assert_eq!(card.cryptograms.len(), 1);
    assert_eq!(card.cryptograms[0].requested, Some(CryptogramType::Arqc));
    assert_eq!(card.cryptograms[0].cid, None);
    assert!(card
        .declined
        .iter()
        .any(|(_, sw)| *sw == StatusWord::CONDITIONS_NOT_SATISFIED));

    // Phases 6 and 7 still ran
    assert_eq!(card.diagnostics.get("9F36").map(String::as_str), Some("0017"));
    assert_eq!(card.transaction_log.len(), 1);
    let fields: Vec<(&str, &str)> = card.transaction_log[0]
        .fields
        .iter()
        .map(|f| (f.tag.as_str(), f.value.as_str()))
        .collect();
    assert_eq!(fields, vec![("9A", "251016"), ("9F02", "000000002500")]);

    // Log read stopped at 6A83
    let log_reads = mock
        .sent_with_ins(ins::READ_RECORD)
        .into_iter()
        .filter(|c| c[3] == 0x5C)
        .count();
    assert_eq!(log_reads, 2);
}

#[test]
fn test_priority_order_and_fallback_to_next_aid() {
    let mut mock = scripted_card();
    EmvWorkflow::new(&mut mock, config()).unwrap().run().unwrap();

    let selects: Vec<Vec<u8>> = mock
        .sent_with_ins(ins::SELECT)
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();
    assert_eq!(selects.len(), 3);
    assert!(selects[1].starts_with(&raw(SELECT_VISA)));
    assert!(selects[2].starts_with(&raw(SELECT_MASTERCARD)));
}

#[test]
fn test_dol_blobs_match_declared_lengths() {
    let mut mock = scripted_card();
    EmvWorkflow::new(&mut mock, config()).unwrap().run().unwrap();

    let gpo = mock.sent_with_ins(ins::GET_PROCESSING_OPTIONS)[0].to_vec();
    assert_eq!(gpo.len(), 5 + 14 + 1);
    assert_eq!(&gpo[4..7], &[0x0E, 0x83, 0x0C]);
    assert_eq!(hex::encode_upper(&gpo[7..13]), "000000002500");
    assert_eq!(hex::encode_upper(&gpo[13..15]), "0978");

    let generate_ac = mock.sent_with_ins(ins::GENERATE_AC)[0].to_vec();
    assert_eq!(generate_ac[2], CryptogramType::Arqc.p1());
    assert_eq!(generate_ac[4] as usize, 23);
    assert_eq!(generate_ac.len(), 5 + 23 + 1);
}

#[test]
fn test_arqc_followed_by_second_generate_ac() {
    let mut mock = scripted_card()
        .respond(
            vec![0x80, 0xAE, 0x80],
            ok("8012800001112233445566778806010A03A00000"),
        )
        .respond(
            vec![0x80, 0xAE, 0x00],
            ok("8012000001887766554433221106010A03A00000"),
        );
    let card = EmvWorkflow::new(&mut mock, config()).unwrap().run().unwrap();

    assert_eq!(card.cryptograms.len(), 2);
    assert_eq!(card.cryptograms[0].returned_type(), Some(CryptogramType::Arqc));
    assert_eq!(card.cryptograms[1].requested, Some(CryptogramType::Aac));
    assert_eq!(card.cryptograms[1].returned_type(), Some(CryptogramType::Aac));

    let second = mock.sent_with_ins(ins::GENERATE_AC)[1].to_vec();
    assert_eq!(second[2], 0x00);
    assert_eq!(second[4], 6);
}

#[test]
fn test_transport_failure_keeps_log() {
    let mut mock = scripted_card().fail(vec![0x80, 0xA8], MockFailure::Disconnected);
    let mut workflow = EmvWorkflow::new(&mut mock, config()).unwrap();

    let err = workflow.run().unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Transport {
            state: WorkflowState::AidSelected,
            source: TransportError::Disconnected,
        }
    ));
    assert_eq!(workflow.state(), WorkflowState::Failed);
    assert_eq!(workflow.log().len(), 3);
    assert!(workflow.card_data().is_none());
    assert!(matches!(
        workflow.step(),
        Err(WorkflowError::Finished(WorkflowState::Failed))
    ));
}

#[test]
fn test_cancel_between_phases() {
    let token = CancelToken::new();
    let mut mock = scripted_card();
    let mut workflow = EmvWorkflow::new(&mut mock, config())
        .unwrap()
        .with_cancel(token.clone());

    assert_eq!(workflow.step().unwrap(), WorkflowState::PpseSelected);
    assert_eq!(workflow.step().unwrap(), WorkflowState::AidSelected);
    token.cancel();

    assert!(matches!(
        workflow.step(),
        Err(WorkflowError::Cancelled {
            state: WorkflowState::AidSelected
        })
    ));
    assert_eq!(workflow.state(), WorkflowState::Failed);
    assert_eq!(workflow.into_log().len(), 3);
}

#[test]
fn test_overall_deadline() {
    let mut mock = scripted_card().delay(Duration::from_millis(15));
    let mut config = config();
    config.overall_deadline_ms = Some(20);

    let mut workflow = EmvWorkflow::new(&mut mock, config).unwrap();
    let err = workflow.run().unwrap_err();
    assert!(matches!(err, WorkflowError::DeadlineExceeded { .. }));
    assert_eq!(workflow.state(), WorkflowState::Failed);
    assert!(!workflow.log().is_empty());
}

#[test]
fn test_run_into_sink() {
    let mut mock = scripted_card();
    let mut sink: Vec<EmvCardData> = Vec::new();
    EmvWorkflow::new(&mut mock, config())
        .unwrap()
        .run_into(&mut sink)
        .unwrap();

    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0].masked_pan, "541333******0010");
    let json = serde_json::to_string(&sink[0]).unwrap();
    assert!(!json.contains("5413330089010010"));
}

#[test]
fn test_log_format_without_log_entry_reads_default_file() {
    // Log format 9A03 9F0206, no 9F4D: the log is read from SFI 0B
    let mut mock = scripted_card()
        .respond_exact(raw("00B2020C00"), ok("70099F4F069A039F0206"))
        .respond_exact(raw("00B2015C00"), ok("251016000000002500"))
        .respond_exact(raw("00B2025C00"), ok("251017000000009900"))
        .respond_exact(raw("00B2035C00"), vec![0x6A, 0x83]);
    let card = EmvWorkflow::new(&mut mock, config()).unwrap().run().unwrap();

    assert_eq!(card.transaction_log.len(), 2);
    assert!(card.transaction_log.iter().all(|entry| entry.sfi == 0x0B));
    assert_eq!(card.transaction_log[1].record, 2);
    assert_eq!(card.transaction_log[1].fields[1].value, "000000009900");
}

#[test]
fn test_contact_pse_directory_lists_candidates() {
    let mut mock = contact_card();
    let card = {
        let mut workflow = EmvWorkflow::new(&mut mock, config()).unwrap();
        let card = workflow.run().unwrap();
        assert_eq!(workflow.state(), WorkflowState::Finalized);
        card
    };

    assert_eq!(card.candidates.len(), 1);
    assert_eq!(card.candidates[0].aid_hex(), "A0000000031010");
    assert_eq!(card.application_id, "A0000000031010");

    // Directory read stopped at 6A83, default AIDs never tried
    assert_eq!(mock.sent()[2], raw("00B2011400"));
    assert_eq!(mock.sent()[3], raw("00B2021400"));
    assert!(mock.sent()[4].starts_with(&raw(SELECT_VISA)));
    let selects = mock.sent_with_ins(ins::SELECT);
    assert_eq!(selects.len(), 3);
    assert!(selects[2].starts_with(&raw(SELECT_VISA)));
}

#[test]
fn test_transport_failure_on_second_candidate() {
    let mut mock = scripted_card().fail(raw(SELECT_MASTERCARD), MockFailure::Disconnected);
    let mut workflow = EmvWorkflow::new(&mut mock, config()).unwrap();

    let err = workflow.run().unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Transport {
            state: WorkflowState::PpseSelected,
            source: TransportError::Disconnected,
        }
    ));
    assert_eq!(workflow.state(), WorkflowState::Failed);
    // PPSE and the declined Visa select are kept
    assert_eq!(workflow.log().len(), 2);
    assert_eq!(
        workflow.log().entries()[1].status(),
        StatusWord::FILE_NOT_FOUND
    );
    assert!(workflow.card_data().is_none());
}
