//! EMV Common - Shared data structures and utilities for EMV processing
//!
//! Everything in this crate is pure: it decodes and encodes bytes and never
//! talks to a card.

pub mod dol;
pub mod status;
pub mod tlv;

pub use dol::{parse_dol, parse_dol_hex, DolEntry};
pub use status::StatusWord;
pub use tlv::{encode_length, encode_tlv, is_constructed, parse_tlv, Tlv, TlvIter};

use thiserror::Error;

/// Errors raised while decoding EMV data structures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlvError {
    /// A tag or length field, or the value it announces, runs past the buffer
    #[error("truncated TLV at offset {offset}: {declared} bytes declared, {available} available")]
    TruncatedTlv {
        offset: usize,
        declared: usize,
        available: usize,
    },

    /// A length prefix that EMV does not allow (indefinite form, more than 4 bytes)
    #[error("unsupported length encoding 0x{prefix:02X} at offset {offset}")]
    BadLength { offset: usize, prefix: u8 },

    /// A DOL entry that cannot be turned into a data object
    #[error("malformed DOL entry {tag}: length {length}")]
    MalformedDol { tag: String, length: usize },

    /// Input that should have been hex was not
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// TLV (Tag-Length-Value) lookup for EMV data
///
/// Searches the top level of `data` for `tag` and returns its value. Nested
/// templates are not entered; call again on the template value to look inside.
/// Stops quietly at the first malformed node.
///
/// # Arguments
/// * `data` - The EMV-encoded data to search
/// * `tag` - The tag bytes to search for
///
/// # Returns
/// * `Some(&[u8])` - The value bytes if tag is found
/// * `None` - If tag is not found or data is malformed before it
pub fn find_tag<'a>(data: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    parse_tlv(data)
        .map_while(Result::ok)
        .find(|node| node.tag == tag)
        .map(|node| node.value)
}

/// Depth-first search for `tag`, descending into constructed templates
pub fn find_tag_recursive<'a>(data: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    for node in parse_tlv(data).map_while(Result::ok) {
        if node.tag == tag {
            return Some(node.value);
        }
        if node.is_constructed() {
            if let Some(found) = find_tag_recursive(node.value, tag) {
                return Some(found);
            }
        }
    }
    None
}

/// Decode a hex string, ignoring whitespace and case
pub fn decode_hex(input: &str) -> Result<Vec<u8>, TlvError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| TlvError::InvalidHex(format!("{compact}: {e}")))
}

/// EMV Tag identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmvTag(pub &'static [u8]);

impl EmvTag {
    pub fn bytes(&self) -> &'static [u8] {
        self.0
    }
}

/// Common EMV tags used in payment card processing
pub mod tags {
    use super::EmvTag;

    // Application metadata
    pub const APPLICATION_IDENTIFIER: EmvTag = EmvTag(&[0x4F]);
    pub const APPLICATION_LABEL: EmvTag = EmvTag(&[0x50]);
    pub const APPLICATION_PAN: EmvTag = EmvTag(&[0x5A]);
    pub const APPLICATION_EXPIRATION_DATE: EmvTag = EmvTag(&[0x5F, 0x24]);
    pub const APPLICATION_EFFECTIVE_DATE: EmvTag = EmvTag(&[0x5F, 0x25]);
    pub const APPLICATION_PAN_SEQUENCE_NUMBER: EmvTag = EmvTag(&[0x5F, 0x34]);
    pub const APPLICATION_PRIORITY_INDICATOR: EmvTag = EmvTag(&[0x87]);
    pub const APPLICATION_PREFERRED_NAME: EmvTag = EmvTag(&[0x9F, 0x12]);
    pub const APPLICATION_USAGE_CONTROL: EmvTag = EmvTag(&[0x9F, 0x07]);
    pub const APPLICATION_VERSION_NUMBER: EmvTag = EmvTag(&[0x9F, 0x08]);
    pub const APPLICATION_CURRENCY_CODE: EmvTag = EmvTag(&[0x9F, 0x42]);
    pub const APPLICATION_CURRENCY_EXPONENT: EmvTag = EmvTag(&[0x9F, 0x44]);
    pub const DEDICATED_FILE_NAME: EmvTag = EmvTag(&[0x84]);
    pub const SHORT_FILE_IDENTIFIER: EmvTag = EmvTag(&[0x88]);

    // Cardholder data
    pub const CARDHOLDER_NAME: EmvTag = EmvTag(&[0x5F, 0x20]);
    pub const TRACK_1_DATA: EmvTag = EmvTag(&[0x56]);
    pub const TRACK_2_EQUIVALENT_DATA: EmvTag = EmvTag(&[0x57]);
    pub const TRACK_2_DATA: EmvTag = EmvTag(&[0x9F, 0x6B]);

    // Issuer data
    pub const ISSUER_COUNTRY_CODE: EmvTag = EmvTag(&[0x5F, 0x28]);
    pub const LANGUAGE_PREFERENCE: EmvTag = EmvTag(&[0x5F, 0x2D]);

    // Cryptography and certificates
    pub const CA_PUBLIC_KEY_INDEX: EmvTag = EmvTag(&[0x8F]);
    pub const ISSUER_PUBLIC_KEY_CERTIFICATE: EmvTag = EmvTag(&[0x90]);
    pub const ISSUER_PUBLIC_KEY_EXPONENT: EmvTag = EmvTag(&[0x9F, 0x32]);
    pub const ISSUER_PUBLIC_KEY_REMAINDER: EmvTag = EmvTag(&[0x92]);
    pub const SIGNED_STATIC_APPLICATION_DATA: EmvTag = EmvTag(&[0x93]);
    pub const ICC_PUBLIC_KEY_CERTIFICATE: EmvTag = EmvTag(&[0x9F, 0x46]);
    pub const ICC_PUBLIC_KEY_EXPONENT: EmvTag = EmvTag(&[0x9F, 0x47]);
    pub const ICC_PUBLIC_KEY_REMAINDER: EmvTag = EmvTag(&[0x9F, 0x48]);
    pub const ICC_PIN_ENCIPHERMENT_PUBLIC_KEY_CERTIFICATE: EmvTag = EmvTag(&[0x9F, 0x2D]);
    pub const STATIC_DATA_AUTHENTICATION_TAG_LIST: EmvTag = EmvTag(&[0x9F, 0x4A]);
    pub const SIGNED_DYNAMIC_APPLICATION_DATA: EmvTag = EmvTag(&[0x9F, 0x4B]);

    // Data object lists
    pub const PDOL: EmvTag = EmvTag(&[0x9F, 0x38]);
    pub const CDOL1: EmvTag = EmvTag(&[0x8C]);
    pub const CDOL2: EmvTag = EmvTag(&[0x8D]);
    pub const DDOL: EmvTag = EmvTag(&[0x9F, 0x49]);

    // Processing
    pub const AFL: EmvTag = EmvTag(&[0x94]);
    pub const AIP: EmvTag = EmvTag(&[0x82]);
    pub const CVM_LIST: EmvTag = EmvTag(&[0x8E]);
    pub const APPLICATION_CRYPTOGRAM: EmvTag = EmvTag(&[0x9F, 0x26]);
    pub const CRYPTOGRAM_INFORMATION_DATA: EmvTag = EmvTag(&[0x9F, 0x27]);
    pub const APPLICATION_TRANSACTION_COUNTER: EmvTag = EmvTag(&[0x9F, 0x36]);
    pub const ISSUER_APPLICATION_DATA: EmvTag = EmvTag(&[0x9F, 0x10]);
    pub const LAST_ONLINE_ATC_REGISTER: EmvTag = EmvTag(&[0x9F, 0x13]);
    pub const PIN_TRY_COUNTER: EmvTag = EmvTag(&[0x9F, 0x17]);
    pub const LOWER_CONSECUTIVE_OFFLINE_LIMIT: EmvTag = EmvTag(&[0x9F, 0x14]);
    pub const UPPER_CONSECUTIVE_OFFLINE_LIMIT: EmvTag = EmvTag(&[0x9F, 0x23]);
    pub const LOG_ENTRY: EmvTag = EmvTag(&[0x9F, 0x4D]);
    pub const LOG_FORMAT: EmvTag = EmvTag(&[0x9F, 0x4F]);

    // Terminal-supplied data
    pub const AMOUNT_AUTHORISED: EmvTag = EmvTag(&[0x9F, 0x02]);
    pub const AMOUNT_OTHER: EmvTag = EmvTag(&[0x9F, 0x03]);
    pub const TERMINAL_COUNTRY_CODE: EmvTag = EmvTag(&[0x9F, 0x1A]);
    pub const TERMINAL_VERIFICATION_RESULTS: EmvTag = EmvTag(&[0x95]);
    pub const TRANSACTION_CURRENCY_CODE: EmvTag = EmvTag(&[0x5F, 0x2A]);
    pub const TRANSACTION_DATE: EmvTag = EmvTag(&[0x9A]);
    pub const TRANSACTION_TIME: EmvTag = EmvTag(&[0x9F, 0x21]);
    pub const TRANSACTION_TYPE: EmvTag = EmvTag(&[0x9C]);
    pub const UNPREDICTABLE_NUMBER: EmvTag = EmvTag(&[0x9F, 0x37]);
    pub const TERMINAL_TYPE: EmvTag = EmvTag(&[0x9F, 0x35]);
    pub const TERMINAL_CAPABILITIES: EmvTag = EmvTag(&[0x9F, 0x33]);
    pub const ADDITIONAL_TERMINAL_CAPABILITIES: EmvTag = EmvTag(&[0x9F, 0x40]);
    pub const TERMINAL_TRANSACTION_QUALIFIERS: EmvTag = EmvTag(&[0x9F, 0x66]);
    pub const CVM_RESULTS: EmvTag = EmvTag(&[0x9F, 0x34]);
    pub const AUTHORISATION_RESPONSE_CODE: EmvTag = EmvTag(&[0x8A]);
    pub const MERCHANT_NAME_AND_LOCATION: EmvTag = EmvTag(&[0x9F, 0x4E]);

    // Response templates
    pub const FCI_TEMPLATE: EmvTag = EmvTag(&[0x6F]);
    pub const FCI_PROPRIETARY_TEMPLATE: EmvTag = EmvTag(&[0xA5]);
    pub const FCI_ISSUER_DISCRETIONARY_DATA: EmvTag = EmvTag(&[0xBF, 0x0C]);
    pub const DIRECTORY_ENTRY: EmvTag = EmvTag(&[0x61]);
    pub const RESPONSE_MESSAGE_TEMPLATE_FORMAT_1: EmvTag = EmvTag(&[0x80]);
    pub const RESPONSE_MESSAGE_TEMPLATE_FORMAT_2: EmvTag = EmvTag(&[0x77]);
    pub const RECORD_TEMPLATE: EmvTag = EmvTag(&[0x70]);
    pub const COMMAND_TEMPLATE: EmvTag = EmvTag(&[0x83]);
}

/// Get a human-readable name for an EMV tag
pub fn get_tag_name(tag: &[u8]) -> &'static str {
    match tag {
        [0x4F] => "Application Identifier (AID)",
        [0x50] => "Application Label",
        [0x56] => "Track 1 Data",
        [0x57] => "Track 2 Equivalent Data",
        [0x5A] => "Application PAN",
        [0x5F, 0x20] => "Cardholder Name",
        [0x5F, 0x24] => "Application Expiration Date",
        [0x5F, 0x25] => "Application Effective Date",
        [0x5F, 0x28] => "Issuer Country Code",
        [0x5F, 0x2A] => "Transaction Currency Code",
        [0x5F, 0x2D] => "Language Preference",
        [0x5F, 0x34] => "Application PAN Sequence Number",
        [0x61] => "Application Template",
        [0x6F] => "File Control Information Template",
        [0x70] => "Record Template",
        [0x77] => "Response Message Template Format 2",
        [0x80] => "Response Message Template Format 1",
        [0x82] => "Application Interchange Profile",
        [0x83] => "Command Template",
        [0x84] => "Dedicated File Name",
        [0x87] => "Application Priority Indicator",
        [0x88] => "Short File Identifier",
        [0x8A] => "Authorisation Response Code",
        [0x8C] => "CDOL1",
        [0x8D] => "CDOL2",
        [0x8E] => "CVM List",
        [0x8F] => "CA Public Key Index",
        [0x90] => "Issuer Public Key Certificate",
        [0x92] => "Issuer Public Key Remainder",
        [0x93] => "Signed Static Application Data",
        [0x94] => "Application File Locator",
        [0x95] => "Terminal Verification Results",
        [0x9A] => "Transaction Date",
        [0x9C] => "Transaction Type",
        [0xA5] => "FCI Proprietary Template",
        [0xBF, 0x0C] => "FCI Issuer Discretionary Data",
        [0x9F, 0x02] => "Amount, Authorised",
        [0x9F, 0x03] => "Amount, Other",
        [0x9F, 0x07] => "Application Usage Control",
        [0x9F, 0x08] => "Application Version Number (Card)",
        [0x9F, 0x10] => "Issuer Application Data",
        [0x9F, 0x12] => "Application Preferred Name",
        [0x9F, 0x13] => "Last Online ATC Register",
        [0x9F, 0x14] => "Lower Consecutive Offline Limit",
        [0x9F, 0x17] => "PIN Try Counter",
        [0x9F, 0x1A] => "Terminal Country Code",
        [0x9F, 0x21] => "Transaction Time",
        [0x9F, 0x23] => "Upper Consecutive Offline Limit",
        [0x9F, 0x26] => "Application Cryptogram",
        [0x9F, 0x27] => "Cryptogram Information Data",
        [0x9F, 0x2D] => "ICC PIN Encipherment Public Key Certificate",
        [0x9F, 0x32] => "Issuer Public Key Exponent",
        [0x9F, 0x33] => "Terminal Capabilities",
        [0x9F, 0x34] => "CVM Results",
        [0x9F, 0x35] => "Terminal Type",
        [0x9F, 0x36] => "Application Transaction Counter",
        [0x9F, 0x37] => "Unpredictable Number",
        [0x9F, 0x38] => "PDOL",
        [0x9F, 0x40] => "Additional Terminal Capabilities",
        [0x9F, 0x42] => "Application Currency Code",
        [0x9F, 0x44] => "Application Currency Exponent",
        [0x9F, 0x46] => "ICC Public Key Certificate",
        [0x9F, 0x47] => "ICC Public Key Exponent",
        [0x9F, 0x48] => "ICC Public Key Remainder",
        [0x9F, 0x49] => "DDOL",
        [0x9F, 0x4A] => "Static Data Authentication Tag List",
        [0x9F, 0x4B] => "Signed Dynamic Application Data",
        [0x9F, 0x4D] => "Log Entry",
        [0x9F, 0x4E] => "Merchant Name and Location",
        [0x9F, 0x4F] => "Log Format",
        [0x9F, 0x66] => "Terminal Transaction Qualifiers",
        [0x9F, 0x6B] => "Track 2 Data",
        _ => "Unknown Tag",
    }
}
