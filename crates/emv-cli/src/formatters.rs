//! Field formatters for human-readable output

use clap::ValueEnum;
use emv_card::card_data::{dump_tags, TagDumpEntry};
use emv_card::{ApduLog, EmvCardData};
use emv_common::decode_hex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatMode {
    /// Raw hex output
    Raw,
    /// Human-readable formatted output
    Human,
}

/// Format a field value based on its tag type
pub fn format_value(tag: &[u8], value: &[u8], mode: FormatMode) -> String {
    if mode == FormatMode::Raw {
        return hex::encode_upper(value);
    }

    match tag {
        // Application Label, Application Preferred Name
        [0x50] | [0x9F, 0x12] => {
            String::from_utf8(value.to_vec()).unwrap_or_else(|_| hex::encode_upper(value))
        }

        // Cardholder Name
        [0x5F, 0x20] => String::from_utf8(value.to_vec())
            .unwrap_or_else(|_| hex::encode_upper(value))
            .trim()
            .to_string(),

        // Transaction Date (YYMMDD)
        [0x9A] if value.len() == 3 => {
            format!("20{:02X}-{:02X}-{:02X}", value[0], value[1], value[2])
        }

        // Issuer Country Code (ISO 3166-1 numeric)
        [0x5F, 0x28] | [0x9F, 0x1A] if value.len() == 2 => {
            let code = bcd_number(value);
            match get_country_name(code) {
                Some(country) => format!("{code} ({country})"),
                None => code.to_string(),
            }
        }

        // Currency Codes
        [0x5F, 0x2A] | [0x9F, 0x42] if value.len() == 2 => {
            let code = bcd_number(value);
            match get_currency_name(code) {
                Some(currency) => currency.to_string(),
                None => format!("Currency Code {code}"),
            }
        }

        // Amounts, n12 in minor units
        [0x9F, 0x02] | [0x9F, 0x03] if value.len() == 6 => {
            let minor = bcd_number(value);
            format!("{}.{:02}", minor / 100, minor % 100)
        }

        // Counters
        [0x5F, 0x34] | [0x9F, 0x17] if value.len() == 1 => value[0].to_string(),
        [0x9F, 0x36] | [0x9F, 0x13] if value.len() == 2 => {
            u16::from_be_bytes([value[0], value[1]]).to_string()
        }

        // Large binary fields (certificates, etc.)
        [0x90] | [0x92] | [0x9F, 0x46] | [0x9F, 0x48] if value.len() > 32 => {
            format!("{} ... ({} bytes total)", hex::encode_upper(&value[..32]), value.len())
        }

        _ => hex::encode_upper(value),
    }
}

/// Packed BCD digits as a number; non-decimal nibbles are skipped
fn bcd_number(value: &[u8]) -> u64 {
    value
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0F])
        .filter(|digit| *digit < 10)
        .fold(0u64, |acc, digit| acc * 10 + u64::from(digit))
}

/// ISO 3166-1 numeric country codes (subset)
fn get_country_name(code: u64) -> Option<&'static str> {
    match code {
        124 => Some("Canada"),
        840 => Some("United States"),
        826 => Some("United Kingdom"),
        276 => Some("Germany"),
        250 => Some("France"),
        380 => Some("Italy"),
        724 => Some("Spain"),
        528 => Some("Netherlands"),
        156 => Some("China"),
        392 => Some("Japan"),
        _ => None,
    }
}

/// ISO 4217 numeric currency codes (subset)
fn get_currency_name(code: u64) -> Option<&'static str> {
    match code {
        124 => Some("CAD (Canadian Dollar)"),
        840 => Some("USD (US Dollar)"),
        978 => Some("EUR (Euro)"),
        826 => Some("GBP (Pound Sterling)"),
        392 => Some("JPY (Japanese Yen)"),
        156 => Some("CNY (Chinese Yuan)"),
        _ => None,
    }
}

fn field(label: &str, tag: &[u8], hex_value: &str, mode: FormatMode) {
    if hex_value.is_empty() {
        return;
    }
    let shown = match decode_hex(hex_value) {
        Ok(bytes) => format_value(tag, &bytes, mode),
        Err(_) => hex_value.to_string(),
    };
    println!("  {label:<24} {shown}");
}

fn check(flag: bool) -> &'static str {
    if flag {
        "✓"
    } else {
        "✗"
    }
}

pub fn print_card_data(card: &EmvCardData, mode: FormatMode) {
    println!("=== Application ===\n");
    for candidate in &card.candidates {
        println!(
            "  Candidate {} {} (priority {})",
            hex::encode_upper(&candidate.aid),
            candidate.label.as_deref().unwrap_or("-"),
            candidate.priority.map(|p| (p & 0x0F).to_string()).unwrap_or_else(|| "-".into())
        );
    }
    println!("  {:<24} {}", "AID", card.application_id);
    if !card.application_label.is_empty() {
        println!("  {:<24} {}", "Label", card.application_label);
    }

    println!("\n=== Card ===\n");
    println!("  {:<24} {}", "PAN", card.masked_pan);
    if !card.expiry.is_empty() {
        println!("  {:<24} {}", "Expiry", card.expiry);
    }
    if !card.cardholder_name.is_empty() {
        println!("  {:<24} {}", "Cardholder", card.cardholder_name.trim());
    }
    field("PAN sequence", &[0x5F, 0x34], &card.pan_sequence_number, mode);
    field("Issuer country", &[0x5F, 0x28], &card.issuer_country_code, mode);
    field("Currency", &[0x9F, 0x42], &card.application_currency_code, mode);
    field("AIP", &[0x82], &card.aip, mode);
    field("AFL", &[0x94], &card.afl, mode);
    field("CVM list", &[0x8E], &card.cvm_list, mode);

    if !card.cryptograms.is_empty() {
        println!("\n=== Application Cryptograms ===\n");
        for ac in &card.cryptograms {
            let name = |t: Option<emv_card::CryptogramType>| t.map(|t| t.name()).unwrap_or("-");
            println!("  requested {}, returned {}", name(ac.requested), name(ac.returned_type()));
            if let Some(atc) = &ac.atc {
                field("ATC", &[0x9F, 0x36], &hex::encode_upper(atc), mode);
            }
            if let Some(cryptogram) = &ac.cryptogram {
                println!("  {:<24} {}", "Cryptogram", hex::encode_upper(cryptogram));
            }
        }
    }
    let dynamic = card
        .internal_auth
        .as_ref()
        .and_then(|ia| ia.signed_dynamic_data.as_ref());
    if let Some(dynamic) = dynamic {
        println!("\n  {:<24} {} bytes", "Signed dynamic data", dynamic.len());
    }

    if !card.diagnostics.is_empty() {
        println!("\n=== GET DATA ===\n");
        for (tag, value) in &card.diagnostics {
            let tag_bytes = decode_hex(tag).unwrap_or_default();
            let name = emv_common::get_tag_name(&tag_bytes);
            field(&format!("{name} ({tag})"), &tag_bytes, value, mode);
        }
    }

    if !card.transaction_log.is_empty() {
        println!("\n=== Transaction Log ===\n");
        for entry in &card.transaction_log {
            let fields: Vec<String> = entry
                .fields
                .iter()
                .map(|f| {
                    let tag = decode_hex(&f.tag).unwrap_or_default();
                    let value = decode_hex(&f.value).unwrap_or_default();
                    format!("{}={}", f.name, format_value(&tag, &value, mode))
                })
                .collect();
            println!("  #{:<3} {}", entry.record, fields.join("  "));
        }
    }

    if !card.declined.is_empty() {
        println!("\n=== Declined Commands ===\n");
        for (command, status) in &card.declined {
            println!("  {command:<24} {status} {}", status.describe());
        }
    }
    println!("\n  {} exchanges", card.exchanges);
}

pub fn print_security_report(card: &EmvCardData) {
    let security = &card.security;
    println!("\n=== Security ===\n");
    println!(
        "  SDA {}  DDA {}  CDA {}",
        check(security.sda),
        check(security.dda),
        check(security.cda)
    );
    println!("  Authentication Method: {}", security.auth_method());
    println!("  {}", security.summary);

    match &card.certificates {
        Some(chain) => {
            println!(
                "  CA key {}  Issuer certificate {}  ICC certificate {}  Chain {}",
                check(chain.ca_key_found),
                check(chain.issuer_cert_valid),
                check(chain.icc_cert_valid),
                check(chain.chain_valid)
            );
            for error in &chain.errors {
                println!("    - {error}");
            }
        }
        None => println!("  Certificates: not checked, no CA keys configured"),
    }

    let roca = &card.roca;
    if !roca.applicable {
        println!("  ROCA: {}", roca.details);
    } else if roca.vulnerable {
        println!("  ROCA: VULNERABLE ({})", roca.details);
    } else {
        println!("  ROCA: not vulnerable ({})", roca.details);
    }
}

fn print_entries(entries: &[TagDumpEntry], indent: usize) {
    for entry in entries {
        let pad = " ".repeat((indent + entry.depth) * 2);
        if entry.constructed {
            println!("{pad}[{}] {}", entry.tag, entry.name);
        } else if entry.value.len() > 64 {
            println!(
                "{pad}[{}] {}: {}... ({} bytes)",
                entry.tag,
                entry.name,
                &entry.value[..64],
                entry.value.len() / 2
            );
        } else {
            println!("{pad}[{}] {}: {}", entry.tag, entry.name, entry.value);
        }
    }
}

/// Every TLV of every response in the log, oldest exchange first
pub fn dump_log(log: &ApduLog) {
    for (i, entry) in log.entries().iter().enumerate() {
        println!(
            "#{:<3} {}  {}  {}",
            i + 1,
            hex::encode_upper(entry.command()),
            entry.status(),
            entry.description()
        );
        let entries = dump_tags(entry.data());
        if entries.is_empty() && !entry.data().is_empty() {
            println!("      {}", hex::encode_upper(entry.data()));
        }
        print_entries(&entries, 3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_values() {
        let human = |tag: &[u8], value: &[u8]| format_value(tag, value, FormatMode::Human);
        assert_eq!(human(&[0x5F, 0x28], &[0x08, 0x40]), "840 (United States)");
        assert_eq!(human(&[0x9F, 0x02], &[0, 0, 0, 0, 0x25, 0x00]), "25.00");
        assert_eq!(format_value(&[0x9A], &[0x25, 0x10, 0x16], FormatMode::Human), "2025-10-16");
        assert_eq!(format_value(&[0x9F, 0x36], &[0x00, 0x12], FormatMode::Human), "18");
    }

    #[test]
    fn test_raw_is_hex() {
        assert_eq!(format_value(&[0x50], b"VISA", FormatMode::Raw), "56495341");
    }
}
