//! Opening the reader selected on the command line

use std::fs::OpenOptions;

use anyhow::{bail, Context};
use clap::ValueEnum;
use emv_card::transport::Pn532Transport;
use emv_card::{CardReader, MockTransport, Transport};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReaderKind {
    /// First PC/SC reader, or the one named by --port
    Pcsc,
    /// PN532 on a serial device (USB-serial, Bluetooth RFCOMM)
    Pn532,
    /// Built-in scripted card for dry runs
    Mock,
}

pub fn open_transport(kind: ReaderKind, port: Option<&str>) -> anyhow::Result<Box<dyn Transport>> {
    match kind {
        ReaderKind::Pcsc => {
            let reader = CardReader::new().context("failed to establish PC/SC context")?;
            let transport = match port {
                Some(name) => reader.connect(name),
                None => reader.connect_first(),
            }
            .context("failed to connect to card; is a card present on the reader?")?;
            info!(reader = %transport.reader_name(), "Card connected");
            Ok(Box::new(transport))
        }
        ReaderKind::Pn532 => {
            let Some(path) = port else {
                bail!("--port is required for the pn532 reader");
            };
            let device = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("failed to open {path}"))?;
            let mut transport = Pn532Transport::new(device);
            transport.wake()?;
            let (ic, version, revision, _) = transport.firmware_version()?;
            info!(ic, version, revision, "PN532 ready");
            let Some(target) = transport.detect_card()? else {
                bail!("no ISO 14443-A card in the field");
            };
            if !target.supports_iso14443_4() {
                bail!("card ({}) does not speak ISO 14443-4", target.card_type());
            }
            info!(card = %target.card_type(), "Card detected");
            Ok(Box::new(transport))
        }
        ReaderKind::Mock => Ok(Box::new(demo_card())),
    }
}

/// Mastercard-like card with two AFL records, a transaction log and no CA key
pub fn demo_card() -> MockTransport {
    let decode = |hex: &str| emv_common::decode_hex(hex).unwrap_or_default();
    MockTransport::new()
        .respond(
            decode("00A404000E325041592E5359532E444446303100"),
            decode(
                "6F2F840E325041592E5359532E4444463031A51DBF0C1A\
                 61184F07A0000000041010500A4D415354455243415244870101 9000",
            ),
        )
        .respond(
            decode("00A4040007A0000000041010"),
            decode("6F178407A0000000041010A50C500A4D415354455243415244 9000"),
        )
        .respond(decode("80A8"), decode("770E8202198094080801010008020200 9000"))
        .respond(
            decode("00B2010C"),
            decode(
                "70275A0854133300896000135F24032712315F200C444F452F4A4F484E20202020\
                 8C069F02069F3704 9000",
            ),
        )
        .respond(decode("00B2020C"), decode("700E9F4D020B039F4F069A039F02069000"))
        .respond(decode("80AE"), decode("80128000121122334455667788 06010A03A000009000"))
        .respond(decode("80CA9F36"), decode("9F360200129000"))
        .respond(decode("00B2015C"), decode("2510160000000025009000"))
        .respond(decode("00B2025C"), decode("2510170000000099009000"))
        .respond(decode("00B2035C"), decode("6A83"))
        .fallback(decode("6A88"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use emv_card::{EmvWorkflow, ReaderConfig, WorkflowState};

    #[test]
    fn test_demo_card_reads_to_the_end() {
        let mut card = demo_card();
        let mut workflow = EmvWorkflow::new(&mut card, ReaderConfig::default()).unwrap();
        let data = workflow.run().unwrap();

        assert_eq!(workflow.state(), WorkflowState::Finalized);
        assert_eq!(data.application_label, "MASTERCARD");
        assert_eq!(data.pan, "5413330089600013");
        assert!(!data.masked_pan.contains("33008960"));
        assert!(data.has_cryptogram());
        assert_eq!(data.transaction_log.len(), 2);
        assert!(data.security.cda);
    }
}
