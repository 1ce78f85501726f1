//! Finalized per-card record and the parsed results it aggregates

use std::collections::BTreeMap;

use emv_common::{find_tag, get_tag_name, parse_tlv, tags, StatusWord};
use serde::{Serialize, Serializer};

use crate::apdu::CryptogramType;
use crate::crypto::CertificateVerificationResult;
use crate::protocol::AidEntry;
use crate::security::{RocaResult, SecurityInfo};

/// Serialize bytes as an uppercase hex string
pub fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode_upper(bytes))
}

fn hex_opt<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_some(&hex::encode_upper(bytes)),
        None => serializer.serialize_none(),
    }
}

/// Outcome of one GENERATE AC exchange
///
/// Every field is optional: a declined command or a card that leaves a tag
/// out still produces a result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerateAcResult {
    /// Cryptogram type the terminal asked for
    pub requested: Option<CryptogramType>,
    pub cid: Option<u8>,
    #[serde(serialize_with = "hex_opt")]
    pub atc: Option<Vec<u8>>,
    #[serde(serialize_with = "hex_opt")]
    pub cryptogram: Option<Vec<u8>>,
    #[serde(serialize_with = "hex_opt")]
    pub issuer_application_data: Option<Vec<u8>>,
    /// Signed dynamic application data (CDA)
    #[serde(serialize_with = "hex_opt")]
    pub signed_dynamic_data: Option<Vec<u8>>,
}

impl GenerateAcResult {
    /// Parse a GENERATE AC response body (format 1 tag 80 or format 2 tag 77)
    pub fn parse(data: &[u8]) -> Self {
        if let Some(primitive) = find_tag(data, tags::RESPONSE_MESSAGE_TEMPLATE_FORMAT_1.bytes()) {
            // CID (1) | ATC (2) | AC (8) | IAD (rest)
            return Self {
                requested: None,
                cid: primitive.first().copied(),
                atc: primitive.get(1..3).map(<[u8]>::to_vec),
                cryptogram: primitive.get(3..11).map(<[u8]>::to_vec),
                issuer_application_data: primitive
                    .get(11..)
                    .filter(|rest| !rest.is_empty())
                    .map(<[u8]>::to_vec),
                signed_dynamic_data: None,
            };
        }

        let body = find_tag(data, tags::RESPONSE_MESSAGE_TEMPLATE_FORMAT_2.bytes()).unwrap_or(data);
        let get = |tag: emv_common::EmvTag| find_tag(body, tag.bytes()).map(<[u8]>::to_vec);
        Self {
            requested: None,
            cid: get(tags::CRYPTOGRAM_INFORMATION_DATA).and_then(|v| v.first().copied()),
            atc: get(tags::APPLICATION_TRANSACTION_COUNTER),
            cryptogram: get(tags::APPLICATION_CRYPTOGRAM),
            issuer_application_data: get(tags::ISSUER_APPLICATION_DATA),
            signed_dynamic_data: get(tags::SIGNED_DYNAMIC_APPLICATION_DATA),
        }
    }

    /// Cryptogram type the card actually returned
    pub fn returned_type(&self) -> Option<CryptogramType> {
        self.cid.and_then(CryptogramType::from_cid)
    }

    pub fn is_empty(&self) -> bool {
        self.cid.is_none() && self.cryptogram.is_none() && self.signed_dynamic_data.is_none()
    }
}

/// Outcome of an INTERNAL AUTHENTICATE exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InternalAuthResult {
    #[serde(serialize_with = "hex_opt")]
    pub signed_dynamic_data: Option<Vec<u8>>,
}

impl InternalAuthResult {
    pub fn parse(data: &[u8]) -> Self {
        let signed_dynamic_data = find_tag(data, tags::RESPONSE_MESSAGE_TEMPLATE_FORMAT_1.bytes())
            .or_else(|| {
                find_tag(data, tags::RESPONSE_MESSAGE_TEMPLATE_FORMAT_2.bytes())
                    .and_then(|t| find_tag(t, tags::SIGNED_DYNAMIC_APPLICATION_DATA.bytes()))
            })
            .map(<[u8]>::to_vec);
        Self { signed_dynamic_data }
    }
}

/// One field of a decoded transaction log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogField {
    pub tag: String,
    pub name: &'static str,
    pub value: String,
}

/// One record of the card's transaction log, split by the log format
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionLogEntry {
    pub sfi: u8,
    pub record: u8,
    pub fields: Vec<LogField>,
}

/// Every data object found in one logged response, flattened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagDumpEntry {
    pub depth: usize,
    pub tag: String,
    pub name: &'static str,
    pub value: String,
    pub constructed: bool,
}

/// Flatten a response body into a depth-annotated tag list
pub fn dump_tags(data: &[u8]) -> Vec<TagDumpEntry> {
    let mut out = Vec::new();
    dump_into(data, 0, &mut out);
    out
}

fn dump_into(data: &[u8], depth: usize, out: &mut Vec<TagDumpEntry>) {
    for node in parse_tlv(data).map_while(Result::ok) {
        let constructed = node.is_constructed();
        out.push(TagDumpEntry {
            depth,
            tag: node.tag_hex(),
            name: get_tag_name(node.tag),
            value: if constructed {
                String::new()
            } else {
                hex::encode_upper(node.value)
            },
            constructed,
        });
        if constructed {
            dump_into(node.value, depth + 1, out);
        }
    }
}

/// The finalized per-card aggregate
///
/// The full PAN and track data stay in memory only; serialization carries the
/// masked PAN.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmvCardData {
    pub application_id: String,
    pub application_label: String,
    #[serde(skip)]
    pub pan: String,
    pub masked_pan: String,
    pub expiry: String,
    pub cardholder_name: String,
    #[serde(skip)]
    pub track2: String,
    pub aip: String,
    pub afl: String,
    pub cvm_list: String,
    pub pan_sequence_number: String,
    pub issuer_country_code: String,
    pub application_currency_code: String,
    pub candidates: Vec<AidEntry>,
    pub cryptograms: Vec<GenerateAcResult>,
    pub internal_auth: Option<InternalAuthResult>,
    /// GET DATA results by tag
    pub diagnostics: BTreeMap<String, String>,
    pub transaction_log: Vec<TransactionLogEntry>,
    pub security: SecurityInfo,
    pub roca: RocaResult,
    /// CA to issuer to ICC chain walk; only with a CA key store
    pub certificates: Option<CertificateVerificationResult>,
    pub exchanges: usize,
    #[serde(serialize_with = "status_list")]
    pub declined: Vec<(String, StatusWord)>,
}

fn status_list<S: Serializer>(
    declined: &[(String, StatusWord)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Declined<'a> {
        command: &'a str,
        status: String,
        meaning: String,
    }

    serializer.collect_seq(declined.iter().map(|(command, status)| Declined {
        command,
        status: status.to_string(),
        meaning: status.describe(),
    }))
}

impl EmvCardData {
    /// Card reached the point of producing an application cryptogram
    pub fn has_cryptogram(&self) -> bool {
        self.cryptograms.iter().any(|ac| ac.cryptogram.is_some())
    }
}
