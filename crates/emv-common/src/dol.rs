//! Data Object Lists (PDOL, CDOL1/2, DDOL, Log Format)
//!
//! A DOL is a TLV stream with the values cut off: each entry is a tag followed
//! by the length the card wants for that object, and nothing else.

use std::fmt;

use crate::tlv::parse_tlv;
use crate::{decode_hex, TlvError};

/// One requested data object: the tag and how many bytes the card expects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DolEntry {
    pub tag: Vec<u8>,
    pub length: usize,
}

impl DolEntry {
    pub fn new(tag: &[u8], length: usize) -> Self {
        Self {
            tag: tag.to_vec(),
            length,
        }
    }

    pub fn tag_hex(&self) -> String {
        hex::encode_upper(&self.tag)
    }
}

impl fmt::Display for DolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tag_hex(), self.length)
    }
}

/// Parse a DOL. Lengths are requested sizes, no value bytes follow them.
pub fn parse_dol(data: &[u8]) -> Result<Vec<DolEntry>, TlvError> {
    let mut iter = parse_tlv(data);
    let mut entries = Vec::new();

    while !iter.at_end() {
        let tag = iter.read_tag()?;
        let length = iter.read_length()?;
        entries.push(DolEntry::new(tag, length));
    }

    Ok(entries)
}

/// Parse a DOL given as hex
pub fn parse_dol_hex(hex: &str) -> Result<Vec<DolEntry>, TlvError> {
    parse_dol(&decode_hex(hex)?)
}

/// Total number of bytes a DOL asks for
pub fn dol_data_length(entries: &[DolEntry]) -> usize {
    entries.iter().map(|e| e.length).sum()
}

/// Split a data blob back into its DOL fields, in DOL order
///
/// Used for transaction log records, which are the concatenation of the
/// Log Format objects. A short blob yields only the fields that fit.
pub fn split_by_dol<'a>(entries: &'a [DolEntry], data: &'a [u8]) -> Vec<(&'a DolEntry, &'a [u8])> {
    let mut fields = Vec::with_capacity(entries.len());
    let mut pos = 0;
    for entry in entries {
        if pos + entry.length > data.len() {
            break;
        }
        fields.push((entry, &data[pos..pos + entry.length]));
        pos += entry.length;
    }
    fields
}
