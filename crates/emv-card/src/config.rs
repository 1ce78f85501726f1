//! Reader and transaction configuration, loaded from TOML

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use emv_common::{decode_hex, StatusWord};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::apdu::CryptogramType;
use crate::dol::{DolBuilder, FillRule};
use crate::error::ConfigError;
use crate::protocol::{aids, AidEntry};

/// Reader configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Per-exchange timeout
    pub exchange_timeout_ms: u64,
    /// Whole-workflow deadline
    pub overall_deadline_ms: Option<u64>,
    /// Extra status words accepted as a successful SELECT
    pub success_status_words: Vec<String>,
    /// Applications tried when the card lists none
    pub default_aids: Vec<DefaultAid>,
    pub transaction: TransactionConfig,
    /// Per-tag fill rules, tag hex to rule (see [`FillRule`])
    pub dol_rules: BTreeMap<String, String>,
    pub first_ac_type: CryptogramType,
    /// Scan SFI 1..=3, records 1..=4 when the card gives no AFL
    pub scan_records_without_afl: bool,
    pub ca_keys_path: Option<PathBuf>,
    /// GET DATA battery, tag hex
    pub get_data_tags: Vec<String>,
}

/// One fallback application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultAid {
    pub aid: String,
    pub label: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

/// Transaction context used to fill PDOL and CDOL requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Smallest currency unit
    pub amount: u64,
    pub amount_other: u64,
    pub currency_code: u16,
    pub terminal_country: u16,
    pub transaction_type: u8,
    pub terminal_type: u8,
    pub terminal_capabilities: String,
    pub terminal_verification_results: String,
    /// Fixed transaction date (YYYY-MM-DD); today when unset
    pub date: Option<NaiveDate>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            amount: 100,
            amount_other: 0,
            currency_code: 840,
            terminal_country: 840,
            transaction_type: 0x00,
            terminal_type: 0x22,
            terminal_capabilities: "E0F8C8".to_string(),
            terminal_verification_results: "0000000000".to_string(),
            date: None,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        let default_aids = [
            (aids::VISA, "Visa"),
            (aids::MASTERCARD, "Mastercard"),
            (aids::MAESTRO, "Maestro"),
            (aids::AMEX, "American Express"),
            (aids::DISCOVER, "Discover"),
            (aids::JCB, "JCB"),
            (aids::VISA_ELECTRON, "Visa Electron"),
            (aids::UNIONPAY, "UnionPay"),
        ]
        .into_iter()
        .map(|(aid, label)| DefaultAid {
            aid: hex::encode_upper(aid),
            label: label.to_string(),
            priority: None,
        })
        .collect();

        Self {
            exchange_timeout_ms: 5000,
            overall_deadline_ms: None,
            success_status_words: Vec::new(),
            default_aids,
            transaction: TransactionConfig::default(),
            dol_rules: BTreeMap::new(),
            first_ac_type: CryptogramType::Arqc,
            scan_records_without_afl: true,
            ca_keys_path: None,
            get_data_tags: ["9F36", "9F13", "9F17", "9F4F", "9F14", "9F23"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

fn invalid(field: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl ReaderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&contents)?;
        debug!(path = %path.display(), "Loaded reader config");
        Ok(config)
    }

    /// Parse and validate
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ReaderConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange_timeout_ms == 0 {
            return Err(invalid("exchange_timeout_ms", "must be positive"));
        }
        self.extra_success_words()?;
        self.default_aid_entries()?;
        self.get_data_tag_bytes()?;
        self.dol_builder()?;
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Option<Duration> {
        self.overall_deadline_ms.map(Duration::from_millis)
    }

    fn extra_success_words(&self) -> Result<Vec<StatusWord>, ConfigError> {
        self.success_status_words
            .iter()
            .map(|sw| sw.parse().map_err(|e| invalid("success_status_words", e)))
            .collect()
    }

    /// `9000` and `61xx` always count; configured words are added
    pub fn is_selection_success(&self, status: StatusWord) -> bool {
        status.is_success()
            || self
                .extra_success_words()
                .map(|extra| extra.contains(&status))
                .unwrap_or(false)
    }

    pub fn default_aid_entries(&self) -> Result<Vec<AidEntry>, ConfigError> {
        self.default_aids
            .iter()
            .map(|d| {
                let aid = decode_hex(&d.aid).map_err(|e| invalid("default_aids", e))?;
                Ok(AidEntry::new(&aid, Some(&d.label), d.priority))
            })
            .collect()
    }

    pub fn get_data_tag_bytes(&self) -> Result<Vec<Vec<u8>>, ConfigError> {
        self.get_data_tags
            .iter()
            .map(|tag| match decode_hex(tag) {
                Ok(bytes) if (1..=2).contains(&bytes.len()) => Ok(bytes),
                Ok(_) => Err(invalid("get_data_tags", format!("{tag} is not a 1 or 2 byte tag"))),
                Err(e) => Err(invalid("get_data_tags", e)),
            })
            .collect()
    }

    /// DOL builder carrying the transaction context and rule overrides
    pub fn dol_builder(&self) -> Result<DolBuilder, ConfigError> {
        let tx = &self.transaction;
        let mut builder = DolBuilder::new()
            .with_defaults()
            .set_amount(tx.amount)
            .set_amount_other(tx.amount_other)
            .set_currency(tx.currency_code)
            .set_terminal_country(tx.terminal_country)
            .set_transaction_type(tx.transaction_type)
            .set_terminal_type(tx.terminal_type)
            .set_rule(
                emv_common::tags::TERMINAL_CAPABILITIES.bytes(),
                FillRule::Bytes(
                    decode_hex(&tx.terminal_capabilities)
                        .map_err(|e| invalid("transaction.terminal_capabilities", e))?,
                ),
            )
            .set_rule(
                emv_common::tags::TERMINAL_VERIFICATION_RESULTS.bytes(),
                FillRule::Bytes(
                    decode_hex(&tx.terminal_verification_results)
                        .map_err(|e| invalid("transaction.terminal_verification_results", e))?,
                ),
            );
        if let Some(date) = tx.date {
            builder = builder.set_date(date);
        }
        for (tag, rule) in &self.dol_rules {
            let tag_bytes = decode_hex(tag).map_err(|e| invalid("dol_rules", e))?;
            let rule: FillRule = rule.parse().map_err(|e| invalid("dol_rules", e))?;
            builder = builder.set_rule(&tag_bytes, rule);
        }
        Ok(builder)
    }
}
