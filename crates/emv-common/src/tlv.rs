//! BER-TLV walking and encoding as used by EMV
//!
//! Tags follow the ISO 8825 rules EMV adopts: a first byte with the low five
//! bits set announces a multi-byte tag whose continuation bytes carry bit 8
//! while more bytes follow. Lengths are short form (`< 0x80`) or long form
//! (`0x81 LL`, `0x82 LL LL`, ... up to four length bytes).
//!
//! The walk is flat. Constructed templates (`70`, `77`, `A5`, ...) come back
//! as a single node whose value the caller may hand to [`parse_tlv`] again.

use std::fmt;

use crate::TlvError;

/// One decoded `(tag, length, value)` node borrowing from the source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: &'a [u8],
    pub value: &'a [u8],
    /// Offset of the first tag byte in the buffer that was walked
    pub offset: usize,
}

impl<'a> Tlv<'a> {
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_constructed(&self) -> bool {
        is_constructed(self.tag)
    }

    /// Tag as an uppercase hex string, e.g. `"9F38"`
    pub fn tag_hex(&self) -> String {
        hex::encode_upper(self.tag)
    }

    /// Re-encode this node
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_tlv(self.tag, self.value)
    }
}

impl fmt::Display for Tlv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.tag_hex(),
            self.value.len(),
            hex::encode_upper(self.value)
        )
    }
}

/// Bit 6 of the first tag byte marks a constructed data object
pub fn is_constructed(tag: &[u8]) -> bool {
    tag.first().map(|b| b & 0x20 != 0).unwrap_or(false)
}

/// Lazy walk over a TLV buffer
///
/// Yields `Err` once for the first malformed node and then stops. Cloning the
/// iterator restarts from the clone point.
#[derive(Debug, Clone)]
pub struct TlvIter<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Start a walk over `data`
pub fn parse_tlv(data: &[u8]) -> TlvIter<'_> {
    TlvIter {
        data,
        pos: 0,
        failed: false,
    }
}

impl<'a> TlvIter<'a> {
    /// Current read position in the underlying buffer
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn truncated(&mut self, offset: usize, declared: usize) -> TlvError {
        self.failed = true;
        TlvError::TruncatedTlv {
            offset,
            declared,
            available: self.data.len().saturating_sub(offset),
        }
    }

    /// Read a tag starting at `self.pos`
    pub(crate) fn read_tag(&mut self) -> Result<&'a [u8], TlvError> {
        let start = self.pos;
        let mut end = start + 1;
        if self.data[start] & 0x1F == 0x1F {
            loop {
                if end >= self.data.len() {
                    return Err(self.truncated(start, end + 1 - start));
                }
                let byte = self.data[end];
                end += 1;
                if byte & 0x80 == 0 {
                    break;
                }
            }
        }
        self.pos = end;
        Ok(&self.data[start..end])
    }

    /// Read a length field starting at `self.pos`
    pub(crate) fn read_length(&mut self) -> Result<usize, TlvError> {
        let start = self.pos;
        if start >= self.data.len() {
            return Err(self.truncated(start, 1));
        }
        let first = self.data[start];
        self.pos += 1;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }

        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 {
            self.failed = true;
            return Err(TlvError::BadLength {
                offset: start,
                prefix: first,
            });
        }
        if self.pos + count > self.data.len() {
            return Err(self.truncated(self.pos, count));
        }
        let length = self.data[self.pos..self.pos + count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        self.pos += count;
        Ok(length)
    }

    /// Skip `00` / `FF` filler that cards place between objects
    pub(crate) fn skip_padding(&mut self) {
        while self.pos < self.data.len() && matches!(self.data[self.pos], 0x00 | 0xFF) {
            self.pos += 1;
        }
    }

    pub(crate) fn at_end(&self) -> bool {
        self.failed || self.pos >= self.data.len()
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<Tlv<'a>, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_padding();
        if self.at_end() {
            return None;
        }

        let offset = self.pos;
        let tag = match self.read_tag() {
            Ok(tag) => tag,
            Err(e) => return Some(Err(e)),
        };
        let length = match self.read_length() {
            Ok(length) => length,
            Err(e) => return Some(Err(e)),
        };

        let value_start = self.pos;
        if value_start + length > self.data.len() {
            return Some(Err(self.truncated(value_start, length)));
        }
        self.pos += length;

        Some(Ok(Tlv {
            tag,
            value: &self.data[value_start..value_start + length],
            offset,
        }))
    }
}

/// Encode a length field in the shortest form
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        return vec![length as u8];
    }
    let bytes: Vec<u8> = length
        .to_be_bytes()
        .iter()
        .copied()
        .skip_while(|b| *b == 0)
        .collect();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// Encode a single TLV node
pub fn encode_tlv(tag: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + value.len() + 3);
    out.extend_from_slice(tag);
    out.extend_from_slice(&encode_length(value.len()));
    out.extend_from_slice(value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(data: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        parse_tlv(data)
            .map(|n| n.map(|n| (n.tag.to_vec(), n.value.to_vec())))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_walks_flat_sequence() {
        let data = [0x82, 0x02, 0x19, 0x80, 0x94, 0x04, 0x08, 0x01, 0x01, 0x00];
        let parsed = nodes(&data);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], (vec![0x82], vec![0x19, 0x80]));
        assert_eq!(parsed[1], (vec![0x94], vec![0x08, 0x01, 0x01, 0x00]));
    }

    #[test]
    fn test_multi_byte_tags() {
        // 3-byte tag DF8101
        let data = [0xDF, 0x81, 0x01, 0x01, 0xAA, 0x9F, 0x36, 0x02, 0x00, 0x2A];
        let parsed = nodes(&data);
        assert_eq!(parsed[0].0, vec![0xDF, 0x81, 0x01]);
        assert_eq!(parsed[1], (vec![0x9F, 0x36], vec![0x00, 0x2A]));
    }

    #[test]
    fn test_long_form_lengths() {
        let value = vec![0x11; 0x90];
        let mut data = vec![0x90, 0x81, 0x90];
        data.extend_from_slice(&value);
        assert_eq!(nodes(&data)[0].1.len(), 0x90);

        let value = vec![0x22; 0x0102];
        let mut data = vec![0x70, 0x82, 0x01, 0x02];
        data.extend_from_slice(&value);
        assert_eq!(nodes(&data)[0].1.len(), 0x0102);
    }

    #[test]
    fn test_truncated_value_is_reported() {
        let data = [0x5A, 0x08, 0x41, 0x11];
        let mut iter = parse_tlv(&data);
        assert_eq!(
            iter.next(),
            Some(Err(TlvError::TruncatedTlv {
                offset: 2,
                declared: 8,
                available: 2
            }))
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_truncated_tag_and_length() {
        assert!(matches!(
            parse_tlv(&[0x9F]).next(),
            Some(Err(TlvError::TruncatedTlv { .. }))
        ));
        assert!(matches!(
            parse_tlv(&[0x90, 0x82, 0x01]).next(),
            Some(Err(TlvError::TruncatedTlv { .. }))
        ));
        assert!(matches!(
            parse_tlv(&[0x90, 0x80]).next(),
            Some(Err(TlvError::BadLength { prefix: 0x80, .. }))
        ));
    }

    #[test]
    fn test_does_not_recurse() {
        let data = [0x70, 0x04, 0x5F, 0x20, 0x01, 0x41];
        let parsed = nodes(&data);
        assert_eq!(parsed.len(), 1);
        assert!(is_constructed(&parsed[0].0));
        let inner = nodes(&parsed[0].1);
        assert_eq!(inner[0], (vec![0x5F, 0x20], vec![0x41]));
    }

    #[test]
    fn test_restart_by_clone() {
        let data = [0x82, 0x02, 0x19, 0x80, 0x94, 0x00];
        let mut iter = parse_tlv(&data);
        iter.next();
        let resumed = iter.clone();
        assert_eq!(iter.offset(), 4);
        assert_eq!(resumed.count(), 1);
    }

    #[test]
    fn test_padding_is_skipped() {
        let data = [0x00, 0x00, 0x9A, 0x01, 0x25, 0xFF];
        assert_eq!(nodes(&data), vec![(vec![0x9A], vec![0x25])]);
    }

    #[test]
    fn test_round_trip() {
        let sequence: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (vec![0x4F], vec![0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10]),
            (vec![0x9F, 0x38], vec![0x9F, 0x66, 0x04]),
            (vec![0x90], vec![0x5C; 176]),
            (vec![0x70], vec![0x01; 300]),
            (vec![0xDF, 0x81, 0x02], vec![]),
        ];
        let encoded: Vec<u8> = sequence
            .iter()
            .flat_map(|(t, v)| encode_tlv(t, v))
            .collect();
        assert_eq!(nodes(&encoded), sequence);
    }

    #[test]
    fn test_encode_length_forms() {
        assert_eq!(encode_length(0x7F), vec![0x7F]);
        assert_eq!(encode_length(0x80), vec![0x81, 0x80]);
        assert_eq!(encode_length(0x1234), vec![0x82, 0x12, 0x34]);
    }
}
