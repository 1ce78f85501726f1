//! EMV application directory and file locator decoding

use emv_common::{find_tag, parse_tlv, tags};
use serde::Serialize;
use tracing::warn;

/// Known EMV Application Identifiers (AIDs)
pub mod aids {
    /// PSE (Payment System Environment, contact)
    pub const PSE: &[u8] = b"1PAY.SYS.DDF01";

    /// PPSE (Proximity Payment System Environment, contactless)
    pub const PPSE: &[u8] = b"2PAY.SYS.DDF01";

    /// Visa
    pub const VISA: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10];

    /// Visa Electron
    pub const VISA_ELECTRON: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x20, 0x10];

    /// Mastercard
    pub const MASTERCARD: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10];

    /// Maestro
    pub const MAESTRO: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x30, 0x60];

    /// American Express
    pub const AMEX: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x25, 0x01];

    /// Discover
    pub const DISCOVER: &[u8] = &[0xA0, 0x00, 0x00, 0x01, 0x52, 0x30, 0x10];

    /// JCB
    pub const JCB: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x65, 0x10, 0x10];

    /// UnionPay Debit
    pub const UNIONPAY: &[u8] = &[0xA0, 0x00, 0x00, 0x03, 0x33, 0x01, 0x01, 0x01];

    /// Directory names, never payment applications themselves
    pub fn is_directory(name: &[u8]) -> bool {
        name == PSE || name == PPSE
    }
}

/// Transaction log file read when the card gives a log format (9F4F) but no
/// Log Entry (9F4D)
pub const DEFAULT_LOG_SFI: u8 = 0x0B;
pub const DEFAULT_LOG_RECORDS: u8 = 10;

/// One payment application offered by the card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AidEntry {
    #[serde(serialize_with = "crate::card_data::hex_bytes")]
    pub aid: Vec<u8>,
    pub label: Option<String>,
    pub preferred_name: Option<String>,
    /// Application Priority Indicator (tag 87); low nibble is the priority
    pub priority: Option<u8>,
}

impl AidEntry {
    pub fn new(aid: &[u8], label: Option<&str>, priority: Option<u8>) -> Self {
        Self {
            aid: aid.to_vec(),
            label: label.map(str::to_string),
            preferred_name: None,
            priority,
        }
    }

    pub fn aid_hex(&self) -> String {
        hex::encode_upper(&self.aid)
    }

    /// Selection order key. Priority 0 or missing means "no preference" and
    /// sorts after every ranked application.
    pub fn selection_rank(&self) -> u8 {
        match self.priority.map(|p| p & 0x0F) {
            Some(rank) if rank > 0 => rank,
            _ => 0x10,
        }
    }

    /// Label for display, preferring the label over the preferred name
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.preferred_name.clone())
            .unwrap_or_else(|| self.aid_hex())
    }
}

/// Sort candidates so the lowest priority number is tried first; ties keep card order
pub fn order_by_priority(entries: &mut [AidEntry]) {
    entries.sort_by_key(AidEntry::selection_rank);
}

/// Parse the application templates (61) of a PSE/PPSE directory response
///
/// Templates may sit directly in the FCI, inside A5, or inside BF0C; every
/// 61 found at any depth is taken.
pub fn parse_directory(fci: &[u8]) -> Vec<AidEntry> {
    let mut templates = Vec::new();
    collect_templates(fci, tags::DIRECTORY_ENTRY.bytes(), &mut templates);

    templates
        .into_iter()
        .filter_map(|template| {
            let aid = find_tag(template, tags::APPLICATION_IDENTIFIER.bytes())?;
            if aid.is_empty() {
                return None;
            }
            Some(AidEntry {
                aid: aid.to_vec(),
                label: find_tag(template, tags::APPLICATION_LABEL.bytes()).map(ascii),
                preferred_name: find_tag(template, tags::APPLICATION_PREFERRED_NAME.bytes())
                    .map(ascii),
                priority: find_tag(template, tags::APPLICATION_PRIORITY_INDICATOR.bytes())
                    .and_then(|p| p.first().copied()),
            })
        })
        .collect()
}

fn collect_templates<'a>(data: &'a [u8], tag: &[u8], out: &mut Vec<&'a [u8]>) {
    for node in parse_tlv(data).map_while(Result::ok) {
        if node.tag == tag {
            out.push(node.value);
        } else if node.is_constructed() {
            collect_templates(node.value, tag, out);
        }
    }
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// One Application File Locator entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AflEntry {
    pub sfi: u8,
    pub first_record: u8,
    pub last_record: u8,
    /// Records involved in offline data authentication
    pub oda_records: u8,
}

impl AflEntry {
    pub fn records(&self) -> impl Iterator<Item = u8> {
        self.first_record..=self.last_record
    }
}

/// Decode an AFL into its 4-byte entries
///
/// Byte 1: SFI in the upper 5 bits
/// Byte 2: First record number
/// Byte 3: Last record number
/// Byte 4: Number of records involved in offline data auth
///
/// Entries that cannot be valid (SFI 0 or 31, record 0, last < first) are skipped.
pub fn parse_afl(afl: &[u8]) -> Vec<AflEntry> {
    if afl.len() % 4 != 0 {
        warn!(len = afl.len(), "AFL length is not a multiple of 4");
    }

    afl.chunks_exact(4)
        .filter_map(|chunk| {
            let entry = AflEntry {
                sfi: chunk[0] >> 3,
                first_record: chunk[1],
                last_record: chunk[2],
                oda_records: chunk[3],
            };
            let valid = (1..=30).contains(&entry.sfi)
                && entry.first_record > 0
                && entry.last_record >= entry.first_record;
            if !valid {
                warn!(entry = %hex::encode_upper(chunk), "Skipping invalid AFL entry");
            }
            valid.then_some(entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use emv_common::decode_hex;

    #[test]
    fn test_aids() {
        assert_eq!(aids::VISA.len(), 7);
        assert_eq!(aids::MASTERCARD.len(), 7);
        assert_eq!(aids::PSE, b"1PAY.SYS.DDF01");
        assert!(aids::is_directory(b"2PAY.SYS.DDF01"));
        assert!(!aids::is_directory(aids::VISA));
    }

    #[test]
    fn test_parse_ppse_directory() {
        // 6F { 84 2PAY.SYS.DDF01, A5 { BF0C { 61 {4F 50 87=2}, 61 {4F 87=1} } } }
        let fci = decode_hex(
            "6F3D840E325041592E5359532E4444463031A52BBF0C28\
             61184F07A0000000041010500A4D415354455243415244870102\
             610C4F07A0000000043060870101",
        )
        .unwrap();
        let mut entries = parse_directory(&fci);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label.as_deref(), Some("MASTERCARD"));
        assert_eq!(entries[0].priority, Some(2));

        order_by_priority(&mut entries);
        assert_eq!(entries[0].aid, aids::MAESTRO.to_vec());
        assert_eq!(entries[1].aid, aids::MASTERCARD.to_vec());
    }

    #[test]
    fn test_unranked_sorts_last() {
        let mut entries = vec![
            AidEntry::new(aids::VISA, None, None),
            AidEntry::new(aids::MASTERCARD, None, Some(0x83)),
        ];
        order_by_priority(&mut entries);
        assert_eq!(entries[0].aid, aids::MASTERCARD.to_vec());
    }

    #[test]
    fn test_parse_afl() {
        let afl = decode_hex("08010100 10010301 18010200").unwrap();
        let entries = parse_afl(&afl);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].sfi, 2);
        assert_eq!(entries[1].records().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(entries[1].oda_records, 1);
    }

    #[test]
    fn test_parse_afl_skips_invalid() {
        let afl = decode_hex("00010100 08000100 08030100 0801").unwrap();
        assert!(parse_afl(&afl).is_empty());
    }
}
