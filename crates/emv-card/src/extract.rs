//! Log-wide field extraction
//!
//! Cards put the same logical field in different responses depending on
//! personalization, so every lookup walks the whole exchange log newest to
//! oldest and takes the first response that carries the field. Only entries
//! with a success or warning status word are considered.

use std::collections::BTreeMap;

use emv_ca_keys::CaKeyStore;
use emv_common::{
    find_tag, find_tag_recursive, get_tag_name, parse_dol, tags, EmvTag, StatusWord,
};
use emv_common::dol::split_by_dol;
use tracing::debug;

use crate::apdu::{ins, CryptogramType};
use crate::card_data::{
    EmvCardData, GenerateAcResult, InternalAuthResult, LogField, TransactionLogEntry,
};
use crate::crypto::{verify_certificate_chain, CertificateChainData};
use crate::log::{ApduLog, ApduLogEntry};
use crate::protocol::{
    aids, order_by_priority, parse_afl, parse_directory, AflEntry, AidEntry, DEFAULT_LOG_RECORDS,
    DEFAULT_LOG_SFI,
};
use crate::security::{analyze_aip_bytes, roca_or_not_applicable, RocaResult};

/// Fields sliced out of track 2 equivalent data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Track2 {
    pub pan: String,
    /// YYMM
    pub expiry: String,
    pub service_code: String,
}

/// Slice track 2 digits: PAN up to the `D` separator (or an `F` pad, or 19
/// digits), then YYMM and the service code
pub fn parse_track2(digits: &str) -> Track2 {
    let digits = digits.to_ascii_uppercase();
    let pan_end = digits
        .find(|c: char| c == 'D' || c == '=' || c == 'F')
        .unwrap_or(digits.len())
        .min(19);
    let pan = digits[..pan_end].to_string();

    let rest = digits[pan_end..].trim_start_matches(&['D', '='][..]);
    let field = |range: std::ops::Range<usize>| {
        rest.get(range)
            .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or_default()
            .to_string()
    };

    Track2 {
        pan,
        expiry: field(0..4),
        service_code: field(4..7),
    }
}

/// Keep the first six and last four digits
pub fn mask_pan(pan: &str) -> String {
    let len = pan.chars().count();
    if len <= 10 {
        let keep = len.saturating_sub(4);
        return pan
            .chars()
            .enumerate()
            .map(|(i, c)| if i < keep { '*' } else { c })
            .collect();
    }
    pan.chars()
        .enumerate()
        .map(|(i, c)| if i < 6 || i >= len - 4 { c } else { '*' })
        .collect()
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Read-only view over an exchange log
#[derive(Debug, Clone, Copy)]
pub struct Extractor<'a> {
    log: &'a ApduLog,
}

impl<'a> Extractor<'a> {
    pub fn new(log: &'a ApduLog) -> Self {
        Self { log }
    }

    /// Entries with usable response data, newest first
    pub fn responses(&self) -> impl Iterator<Item = &'a ApduLogEntry> {
        self.log.newest_first().filter(|entry| {
            let status = entry.status();
            (status.is_success() || status.is_warning()) && !entry.data().is_empty()
        })
    }

    fn responses_to(&self, instruction: u8) -> impl Iterator<Item = &'a ApduLogEntry> {
        self.responses()
            .filter(move |entry| entry.ins() == Some(instruction))
    }

    fn scan<T>(&self, mut pick: impl FnMut(&'a ApduLogEntry) -> Option<T>) -> Option<T> {
        self.responses().find_map(&mut pick)
    }

    /// Value of `tag` from the most recent response carrying it
    pub fn find(&self, tag: &[u8]) -> Option<&'a [u8]> {
        self.scan(|entry| find_tag_recursive(entry.data(), tag))
    }

    /// Same as [`find`](Self::find), hex encoded; empty when absent
    pub fn find_hex(&self, tag: &[u8]) -> String {
        self.find(tag).map(hex::encode_upper).unwrap_or_default()
    }

    fn find_text(&self, tag: EmvTag) -> String {
        self.find(tag.bytes()).map(ascii).unwrap_or_default()
    }

    /// Format 1 GPO body (tag 80): AIP then AFL
    fn gpo_format1(entry: &'a ApduLogEntry) -> Option<&'a [u8]> {
        find_tag(entry.data(), tags::RESPONSE_MESSAGE_TEMPLATE_FORMAT_1.bytes())
            .filter(|body| body.len() >= 2)
    }

    /// `tag` inside a format 2 GPO body (tag 77)
    fn gpo_format2(entry: &'a ApduLogEntry, tag: EmvTag) -> Option<&'a [u8]> {
        find_tag(entry.data(), tags::RESPONSE_MESSAGE_TEMPLATE_FORMAT_2.bytes())
            .and_then(|body| find_tag(body, tag.bytes()))
    }

    /// AIP from the newest GET PROCESSING OPTIONS answer
    pub fn aip(&self) -> Option<&'a [u8]> {
        self.responses_to(ins::GET_PROCESSING_OPTIONS).find_map(|entry| {
            Self::gpo_format2(entry, tags::AIP)
                .or_else(|| Self::gpo_format1(entry).map(|body| &body[..2]))
        })
    }

    pub fn afl(&self) -> Option<&'a [u8]> {
        self.responses_to(ins::GET_PROCESSING_OPTIONS).find_map(|entry| {
            Self::gpo_format2(entry, tags::AFL)
                .or_else(|| Self::gpo_format1(entry).map(|body| &body[2..]))
                .filter(|afl| !afl.is_empty())
        })
    }

    pub fn afl_entries(&self) -> Vec<AflEntry> {
        self.afl().map(parse_afl).unwrap_or_default()
    }

    pub fn track2(&self) -> String {
        self.find_hex(tags::TRACK_2_EQUIVALENT_DATA.bytes())
    }

    /// Full PAN: tag 5A, else track 2 equivalent data, else track 2 (9F6B)
    pub fn pan(&self) -> String {
        if let Some(pan) = self.find(tags::APPLICATION_PAN.bytes()) {
            return hex::encode_upper(pan).trim_end_matches('F').to_string();
        }
        [tags::TRACK_2_EQUIVALENT_DATA, tags::TRACK_2_DATA]
            .iter()
            .find_map(|tag| self.find(tag.bytes()))
            .map(|t2| parse_track2(&hex::encode_upper(t2)).pan)
            .unwrap_or_default()
    }

    pub fn masked_pan(&self) -> String {
        mask_pan(&self.pan())
    }

    /// Expiry as YYMM
    pub fn expiry(&self) -> String {
        if let Some(date) = self.find(tags::APPLICATION_EXPIRATION_DATE.bytes()) {
            let digits = hex::encode_upper(date);
            if digits.len() >= 4 {
                return digits[..4].to_string();
            }
        }
        [tags::TRACK_2_EQUIVALENT_DATA, tags::TRACK_2_DATA]
            .iter()
            .find_map(|tag| self.find(tag.bytes()))
            .map(|t2| parse_track2(&hex::encode_upper(t2)).expiry)
            .unwrap_or_default()
    }

    /// Cardholder name from 5F20, else the name field of track 1
    pub fn cardholder_name(&self) -> String {
        let name = self.find_text(tags::CARDHOLDER_NAME);
        if !name.is_empty() {
            return name;
        }
        self.find(tags::TRACK_1_DATA.bytes())
            .and_then(|t1| ascii(t1).split('^').nth(1).map(|n| n.trim().to_string()))
            .unwrap_or_default()
    }

    /// Applications listed by the most recent directory (PSE/PPSE) selection,
    /// in selection order
    ///
    /// A PPSE lists its entries in the FCI. A contact PSE names a directory
    /// file (tag 88) instead, whose records follow the selection in the log.
    pub fn directory_entries(&self) -> Vec<AidEntry> {
        let entries = self.log.entries();
        let Some(index) = entries.iter().rposition(|entry| {
            entry.ins() == Some(ins::SELECT)
                && entry.status().is_success()
                && aids::is_directory(entry.command_data())
        }) else {
            return Vec::new();
        };

        let fci = entries[index].data();
        let mut found = parse_directory(fci);
        if let Some(&sfi) = find_tag_recursive(fci, tags::SHORT_FILE_IDENTIFIER.bytes())
            .and_then(<[u8]>::first)
        {
            let records = entries[index + 1..]
                .iter()
                .take_while(|entry| entry.ins() == Some(ins::READ_RECORD))
                .filter(|entry| {
                    entry.status().is_success()
                        && entry.p1_p2().is_some_and(|(_, p2)| p2 >> 3 == sfi)
                });
            for record in records {
                found.extend(parse_directory(record.data()));
            }
        }
        order_by_priority(&mut found);
        found
    }

    /// AID of the most recently selected payment application
    pub fn selected_aid(&self) -> Option<Vec<u8>> {
        self.log
            .newest_first()
            .filter(|entry| entry.ins() == Some(ins::SELECT) && entry.status().is_success())
            .map(ApduLogEntry::command_data)
            .find(|name| !name.is_empty() && !aids::is_directory(name))
            .map(<[u8]>::to_vec)
            .or_else(|| {
                self.find(tags::DEDICATED_FILE_NAME.bytes())
                    .filter(|name| !aids::is_directory(name))
                    .map(<[u8]>::to_vec)
            })
    }

    /// SFI and record count of the transaction log: Log Entry (9F4D), else
    /// the default log file when the card gave a log format
    pub fn log_location(&self) -> Option<(u8, u8)> {
        match self.find(tags::LOG_ENTRY.bytes()) {
            Some([sfi, count, ..]) => Some((*sfi, *count)),
            _ => self
                .log_format()
                .map(|_| (DEFAULT_LOG_SFI, DEFAULT_LOG_RECORDS)),
        }
    }

    pub fn log_format(&self) -> Option<&'a [u8]> {
        self.find(tags::LOG_FORMAT.bytes())
    }

    /// Every GENERATE AC exchange in log order, including declined ones
    pub fn cryptograms(&self) -> Vec<GenerateAcResult> {
        self.log
            .entries()
            .iter()
            .filter(|entry| entry.ins() == Some(ins::GENERATE_AC))
            .map(|entry| {
                let mut result = GenerateAcResult::parse(entry.data());
                result.requested = entry
                    .p1_p2()
                    .and_then(|(p1, _)| CryptogramType::from_cid(p1));
                result
            })
            .collect()
    }

    pub fn internal_auth(&self) -> Option<InternalAuthResult> {
        self.responses_to(ins::INTERNAL_AUTHENTICATE)
            .next()
            .map(|entry| InternalAuthResult::parse(entry.data()))
    }

    /// GET DATA answers keyed by tag hex
    pub fn diagnostics(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        for entry in self.log.entries() {
            if entry.ins() != Some(ins::GET_DATA) || !entry.status().is_success() {
                continue;
            }
            let Some((p1, p2)) = entry.p1_p2() else {
                continue;
            };
            let tag: Vec<u8> = if p1 == 0 { vec![p2] } else { vec![p1, p2] };
            let value = find_tag(entry.data(), &tag).unwrap_or(entry.data());
            values.insert(hex::encode_upper(&tag), hex::encode_upper(value));
        }
        values
    }

    /// Transaction log records split by the card's log format
    pub fn transaction_log(&self) -> Vec<TransactionLogEntry> {
        let (Some((sfi, _)), Some(format)) = (self.log_location(), self.log_format()) else {
            return Vec::new();
        };
        let Ok(fields) = parse_dol(format) else {
            debug!(format = %hex::encode_upper(format), "Unparseable log format");
            return Vec::new();
        };

        self.log
            .entries()
            .iter()
            .filter(|entry| entry.ins() == Some(ins::READ_RECORD) && entry.status().is_success())
            .filter_map(|entry| {
                let (record, p2) = entry.p1_p2()?;
                (p2 >> 3 == sfi).then(|| TransactionLogEntry {
                    sfi,
                    record,
                    fields: split_by_dol(&fields, entry.data())
                        .into_iter()
                        .map(|(dol, value)| LogField {
                            tag: dol.tag_hex(),
                            name: get_tag_name(&dol.tag),
                            value: hex::encode_upper(value),
                        })
                        .collect(),
                })
            })
            .collect()
    }

    /// Commands the card answered with an error status word
    pub fn declined(&self) -> Vec<(String, StatusWord)> {
        self.log
            .entries()
            .iter()
            .filter(|entry| !entry.status().is_success() && !entry.status().is_warning())
            .map(|entry| (entry.description().to_string(), entry.status()))
            .collect()
    }

    /// Assemble the per-card record from everything in the log
    pub fn card_data(&self, ca_keys: Option<&CaKeyStore>) -> EmvCardData {
        let aip = self.aip().unwrap_or_default();
        let application_id = self.selected_aid().unwrap_or_default();

        let chain = CertificateChainData::from_extractor(self, &application_id);
        let issuer_modulus = ca_keys.and_then(|store| chain.issuer_modulus(store).ok());

        EmvCardData {
            application_id: hex::encode_upper(&application_id),
            application_label: self.find_text(tags::APPLICATION_LABEL),
            pan: self.pan(),
            masked_pan: self.masked_pan(),
            expiry: self.expiry(),
            cardholder_name: self.cardholder_name(),
            track2: self.track2(),
            aip: hex::encode_upper(aip),
            afl: self.afl().map(hex::encode_upper).unwrap_or_default(),
            cvm_list: self.find_hex(tags::CVM_LIST.bytes()),
            pan_sequence_number: self.find_hex(tags::APPLICATION_PAN_SEQUENCE_NUMBER.bytes()),
            issuer_country_code: self.find_hex(tags::ISSUER_COUNTRY_CODE.bytes()),
            application_currency_code: self.find_hex(tags::APPLICATION_CURRENCY_CODE.bytes()),
            candidates: self.directory_entries(),
            cryptograms: self.cryptograms(),
            internal_auth: self.internal_auth(),
            diagnostics: self.diagnostics(),
            transaction_log: self.transaction_log(),
            security: analyze_aip_bytes(aip),
            roca: match ca_keys {
                None => RocaResult::not_applicable("no CA key store"),
                Some(_) => roca_or_not_applicable(issuer_modulus.as_ref()),
            },
            certificates: ca_keys.map(|store| verify_certificate_chain(&chain, store)),
            exchanges: self.log.len(),
            declined: self.declined(),
        }
    }
}
