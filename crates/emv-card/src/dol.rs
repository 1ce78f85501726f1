//! Terminal-side DOL data: fills PDOL, CDOL and DDOL requests
//!
//! Every tag resolves to a [`FillRule`]. Tags without a rule are zero filled.
//! Values are fitted to the requested length: numeric (BCD) values keep their
//! rightmost digits and are left padded, everything else is right padded or
//! truncated on the right.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate, NaiveTime, Timelike};
use emv_common::{decode_hex, parse_dol, tags, DolEntry, TlvError};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::trace;

/// How the terminal produces the value for one tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillRule {
    Zero,
    /// Fixed bytes
    Bytes(Vec<u8>),
    /// Number written as packed BCD
    Numeric(u64),
    /// ASCII text
    Text(String),
    /// Bytes derived from the builder's seed and the tag
    Random,
    /// Transaction date, YYMMDD
    Date,
    /// Transaction time, HHMMSS
    Time,
}

/// A fill rule string that names no known rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid DOL fill rule {0:?}")]
pub struct FillRuleError(pub String);

impl FromStr for FillRule {
    type Err = FillRuleError;

    /// `zero`, `random`, `date`, `time`, `hex:<bytes>`, `bcd:<number>`, `text:<ascii>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            None => match s.to_ascii_lowercase().as_str() {
                "zero" => Ok(FillRule::Zero),
                "random" => Ok(FillRule::Random),
                "date" => Ok(FillRule::Date),
                "time" => Ok(FillRule::Time),
                _ => Err(FillRuleError(s.to_string())),
            },
            Some((kind, arg)) => match kind.to_ascii_lowercase().as_str() {
                "hex" => decode_hex(arg)
                    .map(FillRule::Bytes)
                    .map_err(|_| FillRuleError(s.to_string())),
                "bcd" => arg
                    .trim()
                    .parse()
                    .map(FillRule::Numeric)
                    .map_err(|_| FillRuleError(s.to_string())),
                "text" => Ok(FillRule::Text(arg.to_string())),
                _ => Err(FillRuleError(s.to_string())),
            },
        }
    }
}

impl fmt::Display for FillRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillRule::Zero => f.write_str("zero"),
            FillRule::Bytes(b) => write!(f, "hex:{}", hex::encode_upper(b)),
            FillRule::Numeric(n) => write!(f, "bcd:{n}"),
            FillRule::Text(t) => write!(f, "text:{t}"),
            FillRule::Random => f.write_str("random"),
            FillRule::Date => f.write_str("date"),
            FillRule::Time => f.write_str("time"),
        }
    }
}

/// Pack a number as BCD into exactly `len` bytes, keeping the rightmost digits
pub fn encode_bcd(value: u64, len: usize) -> Vec<u8> {
    let digits = format!("{value:0width$}", width = len * 2);
    let digits = &digits.as_bytes()[digits.len() - len * 2..];
    digits
        .chunks(2)
        .map(|pair| ((pair[0] - b'0') << 4) | (pair[1] - b'0'))
        .collect()
}

fn right_fit(mut bytes: Vec<u8>, len: usize) -> Vec<u8> {
    bytes.resize(len, 0x00);
    bytes
}

/// Builds DOL data blobs from a rule table
///
/// The date, time, unpredictable number and random seed are fixed when the
/// builder is created, so one builder always produces the same blob for the
/// same DOL.
#[derive(Debug, Clone)]
pub struct DolBuilder {
    rules: HashMap<Vec<u8>, FillRule>,
    date: NaiveDate,
    time: NaiveTime,
    seed: u64,
}

impl Default for DolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DolBuilder {
    /// Empty rule table: every tag zero filled until rules are added
    pub fn new() -> Self {
        let now = Local::now();
        let mut builder = Self {
            rules: HashMap::new(),
            date: now.date_naive(),
            time: now.time(),
            seed: rand::thread_rng().next_u64(),
        };
        let un: [u8; 4] = rand::thread_rng().gen();
        builder.set(tags::UNPREDICTABLE_NUMBER.bytes(), FillRule::Bytes(un.to_vec()));
        builder
    }

    /// Builder whose random values come from `seed`
    pub fn seeded(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut builder = Self::new();
        builder.seed = rng.next_u64();
        let un: [u8; 4] = rng.gen();
        builder.set(tags::UNPREDICTABLE_NUMBER.bytes(), FillRule::Bytes(un.to_vec()));
        builder
    }

    fn set(&mut self, tag: &[u8], rule: FillRule) {
        self.rules.insert(tag.to_vec(), rule);
    }

    /// Rules for the terminal data objects a card commonly asks for
    pub fn with_defaults(mut self) -> Self {
        let defaults = [
            (tags::AMOUNT_AUTHORISED, FillRule::Numeric(100)),
            (tags::AMOUNT_OTHER, FillRule::Numeric(0)),
            (tags::TERMINAL_COUNTRY_CODE, FillRule::Numeric(840)),
            (tags::TRANSACTION_CURRENCY_CODE, FillRule::Numeric(840)),
            (tags::TERMINAL_VERIFICATION_RESULTS, FillRule::Zero),
            (tags::TRANSACTION_DATE, FillRule::Date),
            (tags::TRANSACTION_TIME, FillRule::Time),
            (tags::TRANSACTION_TYPE, FillRule::Numeric(0)),
            (tags::TERMINAL_TYPE, FillRule::Numeric(22)),
            (tags::TERMINAL_CAPABILITIES, FillRule::Bytes(vec![0xE0, 0xF8, 0xC8])),
            (
                tags::ADDITIONAL_TERMINAL_CAPABILITIES,
                FillRule::Bytes(vec![0x60, 0x00, 0xF0, 0xA0, 0x01]),
            ),
            (
                tags::TERMINAL_TRANSACTION_QUALIFIERS,
                FillRule::Bytes(vec![0x36, 0x00, 0x40, 0x00]),
            ),
            (tags::CVM_RESULTS, FillRule::Bytes(vec![0x1F, 0x03, 0x02])),
            (tags::AUTHORISATION_RESPONSE_CODE, FillRule::Text("Z3".into())),
            (tags::MERCHANT_NAME_AND_LOCATION, FillRule::Text("EMV SCAN".into())),
        ];
        for (tag, rule) in defaults {
            self.set(tag.bytes(), rule);
        }
        self
    }

    /// Amount in the currency's smallest unit
    pub fn set_amount(mut self, amount: u64) -> Self {
        self.set(tags::AMOUNT_AUTHORISED.bytes(), FillRule::Numeric(amount));
        self
    }

    pub fn set_amount_other(mut self, amount: u64) -> Self {
        self.set(tags::AMOUNT_OTHER.bytes(), FillRule::Numeric(amount));
        self
    }

    /// ISO 4217 numeric currency code
    pub fn set_currency(mut self, code: u16) -> Self {
        self.set(tags::TRANSACTION_CURRENCY_CODE.bytes(), FillRule::Numeric(code.into()));
        self
    }

    /// ISO 3166 numeric country code
    pub fn set_terminal_country(mut self, code: u16) -> Self {
        self.set(tags::TERMINAL_COUNTRY_CODE.bytes(), FillRule::Numeric(code.into()));
        self
    }

    pub fn set_transaction_type(mut self, kind: u8) -> Self {
        self.set(tags::TRANSACTION_TYPE.bytes(), FillRule::Bytes(vec![kind]));
        self
    }

    pub fn set_terminal_type(mut self, kind: u8) -> Self {
        self.set(tags::TERMINAL_TYPE.bytes(), FillRule::Bytes(vec![kind]));
        self
    }

    pub fn set_unpredictable_number(mut self, un: Vec<u8>) -> Self {
        self.set(tags::UNPREDICTABLE_NUMBER.bytes(), FillRule::Bytes(un));
        self
    }

    pub fn set_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }

    pub fn set_time(mut self, time: NaiveTime) -> Self {
        self.time = time;
        self
    }

    /// Set the rule for any tag, replacing the existing one
    pub fn set_rule(mut self, tag: &[u8], rule: FillRule) -> Self {
        self.set(tag, rule);
        self
    }

    pub fn rule(&self, tag: &[u8]) -> Option<&FillRule> {
        self.rules.get(tag)
    }

    /// Value for one requested data object, exactly `entry.length` bytes
    pub fn fill(&self, entry: &DolEntry) -> Vec<u8> {
        let len = entry.length;
        let value = match self.rules.get(&entry.tag).unwrap_or(&FillRule::Zero) {
            FillRule::Zero => vec![0x00; len],
            FillRule::Bytes(bytes) => right_fit(bytes.clone(), len),
            FillRule::Numeric(n) => encode_bcd(*n, len),
            FillRule::Text(text) => {
                let mut bytes = text.as_bytes().to_vec();
                bytes.resize(len, b' ');
                bytes
            }
            FillRule::Random => {
                let tag_key = entry.tag.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
                let mut rng = StdRng::seed_from_u64(self.seed ^ tag_key);
                let mut bytes = vec![0u8; len];
                rng.fill_bytes(&mut bytes);
                bytes
            }
            FillRule::Date => {
                let yymmdd = format!("{}", self.date.format("%y%m%d"));
                right_fit(encode_bcd(yymmdd.parse().unwrap_or(0), 3), len)
            }
            FillRule::Time => {
                let hhmmss =
                    self.time.hour() * 10_000 + self.time.minute() * 100 + self.time.second();
                right_fit(encode_bcd(hhmmss.into(), 3), len)
            }
        };
        trace!(tag = %entry.tag_hex(), value = %hex::encode_upper(&value), "DOL field");
        value
    }

    /// Concatenate the filler for each entry, in the order given
    ///
    /// Fails with `MalformedDol` on an entry that requests zero bytes.
    pub fn build_entries(&self, entries: &[DolEntry]) -> Result<Vec<u8>, TlvError> {
        let mut blob = Vec::with_capacity(emv_common::dol::dol_data_length(entries));
        for entry in entries {
            if entry.length == 0 {
                return Err(TlvError::MalformedDol {
                    tag: entry.tag_hex(),
                    length: entry.length,
                });
            }
            blob.extend(self.fill(entry));
        }
        Ok(blob)
    }

    /// Parse a raw DOL and build its data
    pub fn build(&self, dol: &[u8]) -> Result<Vec<u8>, TlvError> {
        self.build_entries(&parse_dol(dol)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emv_common::parse_dol_hex;

    fn fixed() -> DolBuilder {
        DolBuilder::seeded(1)
            .with_defaults()
            .set_date(NaiveDate::from_ymd_opt(2025, 10, 16).unwrap())
            .set_time(NaiveTime::from_hms_opt(9, 5, 30).unwrap())
    }

    #[test]
    fn test_blob_length_is_sum_of_entries() {
        let builder = fixed();
        for dol in [
            "9F02069F03069F1A0295055F2A029A039C019F3704",
            "9F66049F02069F03069F1A0295055F2A029A039C019F3704",
            "9F370499089F1E08",
            "",
        ] {
            let entries = parse_dol_hex(dol).unwrap();
            let blob = builder.build_entries(&entries).unwrap();
            assert_eq!(blob.len(), entries.iter().map(|e| e.length).sum::<usize>(), "{dol}");
        }
    }

    #[test]
    fn test_zero_length_entry_rejected() {
        let entries = vec![DolEntry::new(&[0x9F, 0x37], 4), DolEntry::new(&[0x95], 0)];
        assert_eq!(
            fixed().build_entries(&entries),
            Err(TlvError::MalformedDol {
                tag: "95".into(),
                length: 0
            })
        );
    }

    #[test]
    fn test_order_is_preserved() {
        let builder = fixed().set_amount(1234);
        let blob = builder.build(&decode_hex("9C019F0206").unwrap()).unwrap();
        assert_eq!(hex::encode_upper(blob), "00000000001234".to_string());

        let blob = builder.build(&decode_hex("9F02069C01").unwrap()).unwrap();
        assert_eq!(hex::encode_upper(blob), "00000000123400");
    }

    #[test]
    fn test_derived_fields() {
        let builder = fixed();
        let blob = builder
            .build(&decode_hex("9A039F21035F2A029F33039F35018A02").unwrap())
            .unwrap();
        assert_eq!(hex::encode_upper(blob), "251016090530 0840 E0F8C8 22 5A33".replace(' ', ""));
    }

    #[test]
    fn test_unknown_tag_zero_filled() {
        let blob = fixed().build(&decode_hex("DF6003").unwrap()).unwrap();
        assert_eq!(blob, vec![0, 0, 0]);
    }

    #[test]
    fn test_same_builder_same_blob() {
        let builder = fixed().set_rule(&[0x9F, 0x4C], FillRule::Random);
        let dol = decode_hex("9F37049F4C08").unwrap();
        assert_eq!(builder.build(&dol).unwrap(), builder.build(&dol).unwrap());
        assert_eq!(
            DolBuilder::seeded(9).build(&dol).unwrap(),
            DolBuilder::seeded(9).build(&dol).unwrap()
        );
    }

    #[test]
    fn test_fit_to_length() {
        assert_eq!(encode_bcd(123456789, 2), vec![0x67, 0x89]);
        assert_eq!(encode_bcd(5, 3), vec![0x00, 0x00, 0x05]);
        let builder = fixed().set_rule(&[0xDF, 0x01], FillRule::Bytes(vec![1, 2, 3]));
        assert_eq!(builder.fill(&DolEntry::new(&[0xDF, 0x01], 2)), vec![1, 2]);
        assert_eq!(builder.fill(&DolEntry::new(&[0xDF, 0x01], 4)), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_parse_rules() {
        assert_eq!("zero".parse::<FillRule>().unwrap(), FillRule::Zero);
        assert_eq!(
            "hex:E0F8C8".parse::<FillRule>().unwrap(),
            FillRule::Bytes(vec![0xE0, 0xF8, 0xC8])
        );
        assert_eq!("bcd:978".parse::<FillRule>().unwrap(), FillRule::Numeric(978));
        assert_eq!("text:Z3".parse::<FillRule>().unwrap(), FillRule::Text("Z3".into()));
        assert!("bogus".parse::<FillRule>().is_err());
        assert_eq!(FillRule::Numeric(978).to_string(), "bcd:978");
    }
}
