//! Card security posture: AIP capabilities and the ROCA key fingerprint

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use rsa::BigUint;
use serde::Serialize;

use crate::error::AnalysisError;

/// AIP byte 1 capability bits (EMV Book 3, Annex C1)
pub mod aip_bits {
    pub const SDA: u8 = 0x40;
    pub const DDA: u8 = 0x20;
    pub const CARDHOLDER_VERIFICATION: u8 = 0x10;
    pub const TERMINAL_RISK_MANAGEMENT: u8 = 0x08;
    pub const ISSUER_AUTHENTICATION: u8 = 0x04;
    pub const CDA: u8 = 0x01;
}

/// Strongest offline authentication method a card offers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum AuthenticationMethod {
    Sda,
    Dda,
    Cda,
    #[default]
    None,
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthenticationMethod::Sda => "SDA",
            AuthenticationMethod::Dda => "DDA",
            AuthenticationMethod::Cda => "CDA",
            AuthenticationMethod::None => "none",
        };
        f.write_str(name)
    }
}

/// Capabilities decoded from the Application Interchange Profile
///
/// Derived fresh for every card; never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityInfo {
    pub aip: String,
    pub sda: bool,
    pub dda: bool,
    pub cda: bool,
    pub cardholder_verification: bool,
    pub terminal_risk_management: bool,
    pub issuer_authentication: bool,
    /// No offline data authentication at all
    pub is_weak: bool,
    pub summary: String,
}

impl SecurityInfo {
    /// Strongest method advertised, CDA first
    pub fn auth_method(&self) -> AuthenticationMethod {
        if self.cda {
            AuthenticationMethod::Cda
        } else if self.dda {
            AuthenticationMethod::Dda
        } else if self.sda {
            AuthenticationMethod::Sda
        } else {
            AuthenticationMethod::None
        }
    }
}

/// Analyze an AIP given as hex; unparseable input is treated as absent
pub fn analyze_aip(aip_hex: &str) -> SecurityInfo {
    let bytes = emv_common::decode_hex(aip_hex).unwrap_or_default();
    analyze_aip_bytes(&bytes)
}

pub fn analyze_aip_bytes(aip: &[u8]) -> SecurityInfo {
    let byte1 = aip.first().copied().unwrap_or(0);
    let has = |bit: u8| byte1 & bit != 0;

    let mut info = SecurityInfo {
        aip: hex::encode_upper(aip),
        sda: has(aip_bits::SDA),
        dda: has(aip_bits::DDA),
        cda: has(aip_bits::CDA),
        cardholder_verification: has(aip_bits::CARDHOLDER_VERIFICATION),
        terminal_risk_management: has(aip_bits::TERMINAL_RISK_MANAGEMENT),
        issuer_authentication: has(aip_bits::ISSUER_AUTHENTICATION),
        ..Default::default()
    };
    info.is_weak = !(info.sda || info.dda || info.cda);
    info.summary = summarize(&info, aip.is_empty());
    info
}

fn summarize(info: &SecurityInfo, missing: bool) -> String {
    if missing {
        return "AIP not available; no offline data authentication can be assumed".to_string();
    }

    let offered: Vec<&str> = [
        (info.sda, "SDA"),
        (info.dda, "DDA"),
        (info.cda, "CDA"),
        (info.cardholder_verification, "cardholder verification"),
        (info.terminal_risk_management, "terminal risk management"),
        (info.issuer_authentication, "issuer authentication"),
    ]
    .into_iter()
    .filter_map(|(set, name)| set.then_some(name))
    .collect();

    let mut summary = if offered.is_empty() {
        "No capabilities advertised".to_string()
    } else {
        format!("Supports {}", offered.join(", "))
    };
    if info.is_weak {
        summary.push_str("; WEAK: no offline data authentication");
    } else if !info.dda && !info.cda {
        summary.push_str("; static authentication only, cloneable data");
    }
    summary
}

/// Primes used by the ROCA fingerprint
pub const ROCA_PRIMES: [u32; 38] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167,
];

const ROCA_GENERATOR: u64 = 65537;

/// For each prime, the residues reachable as powers of 65537
fn fingerprint_table() -> &'static [(u32, HashSet<u64>)] {
    static TABLE: OnceLock<Vec<(u32, HashSet<u64>)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        ROCA_PRIMES
            .iter()
            .map(|&prime| {
                let p = u64::from(prime);
                let g = ROCA_GENERATOR % p;
                let mut subgroup = HashSet::new();
                let mut x = 1u64;
                while subgroup.insert(x) {
                    x = x * g % p;
                }
                (prime, subgroup)
            })
            .collect()
    })
}

/// Outcome of the ROCA test on one modulus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RocaResult {
    pub applicable: bool,
    pub vulnerable: bool,
    pub modulus_bits: Option<usize>,
    pub details: String,
}

impl RocaResult {
    pub fn not_applicable(reason: impl fmt::Display) -> Self {
        Self {
            applicable: false,
            vulnerable: false,
            modulus_bits: None,
            details: format!("not applicable: {reason}"),
        }
    }
}

impl Default for RocaResult {
    fn default() -> Self {
        Self::not_applicable("no public key examined")
    }
}

fn small_value(n: &BigUint) -> u64 {
    n.to_bytes_be()
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Test whether an RSA modulus carries the fingerprint of the flawed
/// Infineon key generator (CVE-2017-15361)
///
/// Such primes have the form `k * M + (65537^a mod M)` where `M` is the
/// product of the small primes, so every residue of the modulus lies in the
/// subgroup generated by 65537.
pub fn test_roca_fingerprint(modulus: &BigUint) -> Result<RocaResult, AnalysisError> {
    let bits = modulus.bits();
    if bits == 0 {
        return Err(AnalysisError::NonPositiveModulus);
    }

    for (prime, subgroup) in fingerprint_table() {
        let residue = small_value(&(modulus % BigUint::from(*prime)));
        if !subgroup.contains(&residue) {
            return Ok(RocaResult {
                applicable: true,
                vulnerable: false,
                modulus_bits: Some(bits),
                details: format!("residue {residue} mod {prime} is outside the fingerprint"),
            });
        }
    }

    Ok(RocaResult {
        applicable: true,
        vulnerable: true,
        modulus_bits: Some(bits),
        details: format!(
            "{bits}-bit modulus matches the ROCA fingerprint for all {} primes",
            ROCA_PRIMES.len()
        ),
    })
}

/// Run the ROCA test, folding analysis errors into a not-applicable result
pub fn roca_or_not_applicable(modulus: Option<&BigUint>) -> RocaResult {
    match modulus.map(test_roca_fingerprint) {
        Some(Ok(result)) => result,
        Some(Err(e)) => RocaResult::not_applicable(e),
        None => RocaResult::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    /// 2048-bit modulus whose factors follow the RSALib layout
    /// `k * M + (65537^a mod M)`, with M the product of the first 126 primes
    /// (the layout for 1984 to 3936 bit keys)
    const RSALIB_MODULUS: &str = "C7453DE23F158299665093AD7B5CA64C18687507BE7C93587E33707D03447928\
C888B4CD7F9A51A19C5A9AD662F8518FFCEFC50F4C546F4BD25183F47FD6380F\
09E9F52AB9AC6B9AF970305869D947F7EBA36DFCBAAB0B066D1E0F68495443BA\
62493DE9B6FC4B6EE4E42FAA99D7CC3027592190725BE7F5928C82BA18EE61DF\
DEAC6D99F626C3E66A491AED89FF80966AD2B3DB3645CF2E69DDE74ADA0E1EDC\
508E44A386E5013663BEBFEC7E99DCDEDBBF333BD0FBFE002105CD02236CBCAD\
8F6E9C256C81020A9BF8002636EA2BDE86EAD0F1240CE1A40A67B3D6E6CF4C9D\
E3046FB4A68DA4568BDB6B283E1638DB416FE1E997B303BB5887C94D84B8EDA1";
    const RSALIB_P: &str = "E69848703A3F5E611C09123A156598BC0FE1F8E2399B34A4229806002EA2D13F\
5297885CA5795941A3B513A9F83F30AF39A95D227FA07F06D873D3F88CD6200F\
2A02D7E4D9B8885FB6E982414CFA56BECA1A7A1EE14BFBBA8F19025E3EC9CFCF\
635C6DCA78957328B1D7511015B945822013C0366820823A8E5C4644F65A60E5";
    const RSALIB_Q: &str = "DD397BB85CC26A7F9FF33FB427D8BF0102505A79D125F8DBF6EF2AF51899ECB9\
11FA2D7FD7BA614B24EF04FBB20177E32D6795DE2A06F4A902A4E3D89C7D229D\
22F7F5A91AAAE5FBA38B9AA3DAEB1B0D25A0E8D2397FFDC5945A5CFB63F6E562\
FB6D4E93304BF78533856A5265BBD9C80EA1EB37737351ADFE57ECD1E633DA0D";

    /// Modulus of an `openssl genrsa 2048` key
    const OPENSSL_MODULUS: &str = "ADAFAC2CB7AF2FE310064CE9ECCD1F5F3FE7F2E8DD1A1457CF6F831699BA7531\
0ED30A6659EE4010DD9793F166796DC293E3DC764F57E94AFD76B3A327D10C27\
B9091D00F1C2AB85BF7192D04B736184B5550EC6A7600EA102637C623FFA5EA8\
D358D823AD948AF5FC877B524E49CA78C74799EDDB548AE9E7FB830B3AB5C93E\
3C345C994DE32F0E0681E2B3A4377C4E2AF793DC55EEAF110EA9BA4769885362\
1AB21119BB3CDD2575BF9F4C40CB156C60FC9AA0378A38493DF337E55E3CEAA3\
45115C61C5B7D7979BB0DF1BACE0811A92356C6DDE961DB646DD49C847F0DB9D\
401D37D8FF86F791649D7631FC10E1BFD3981B0481A8FFB832370C857F676A3D";

    fn hex_uint(hex: &str) -> BigUint {
        BigUint::from_bytes_be(&hex::decode(hex).unwrap())
    }

    fn primorial() -> BigUint {
        ROCA_PRIMES
            .iter()
            .fold(BigUint::from(1u32), |acc, &p| acc * BigUint::from(p))
    }

    /// Prime-shaped factor built the way the flawed generator builds it
    fn roca_factor(rng: &mut StdRng) -> BigUint {
        let m = primorial();
        let mut k = [0u8; 96];
        rng.fill_bytes(&mut k);
        let a = BigUint::from(rng.gen_range(1u64..1_000_000));
        BigUint::from_bytes_be(&k) * &m + BigUint::from(65537u32).modpow(&a, &m)
    }

    #[test]
    fn test_aip_zero_is_weak() {
        let info = analyze_aip("0000");
        assert!(info.is_weak);
        assert_eq!(info.auth_method(), AuthenticationMethod::None);
        assert!(info.summary.contains("WEAK"));
    }

    #[test]
    fn test_any_auth_bit_is_not_weak() {
        for aip in ["4000", "2000", "0100", "3900", "1980"] {
            let info = analyze_aip(aip);
            assert!(!info.is_weak, "{aip}");
        }
        assert_eq!(analyze_aip("3900").auth_method(), AuthenticationMethod::Cda);
        assert_eq!(analyze_aip("5800").auth_method(), AuthenticationMethod::Sda);
    }

    #[test]
    fn test_non_auth_bits_alone_are_weak() {
        let info = analyze_aip("1C00");
        assert!(info.cardholder_verification);
        assert!(info.terminal_risk_management);
        assert!(info.issuer_authentication);
        assert!(info.is_weak);
    }

    #[test]
    fn test_summary_is_deterministic() {
        assert_eq!(analyze_aip("3900").summary, analyze_aip("3900").summary);
        assert!(analyze_aip("").summary.contains("not available"));
    }

    #[test]
    fn test_fingerprint_subgroups() {
        let table = fingerprint_table();
        assert_eq!(table.len(), ROCA_PRIMES.len());
        // 65537 = 2 mod 3, which generates {1, 2}
        assert_eq!(table[0].1, HashSet::from([1, 2]));
        assert!(table.iter().all(|(_, set)| !set.contains(&0)));
    }

    #[test]
    fn test_roca_vulnerable_modulus() {
        let mut rng = StdRng::seed_from_u64(0x0C4);
        for _ in 0..5 {
            let n = roca_factor(&mut rng) * roca_factor(&mut rng);
            let result = test_roca_fingerprint(&n).unwrap();
            assert!(result.vulnerable, "{}", result.details);
            assert!(result.modulus_bits.unwrap() > 1024);
        }
    }

    #[test]
    fn test_roca_random_2048_bit_not_vulnerable() {
        let mut rng = StdRng::seed_from_u64(2048);
        let mut bytes = [0u8; 256];
        for _ in 0..200 {
            rng.fill_bytes(&mut bytes);
            bytes[0] |= 0x80;
            bytes[255] |= 0x01;
            let n = BigUint::from_bytes_be(&bytes);
            assert!(!test_roca_fingerprint(&n).unwrap().vulnerable);
        }
    }

    #[test]
    fn test_rsalib_2048_modulus_flagged() {
        let n = hex_uint(RSALIB_MODULUS);
        assert_eq!(hex_uint(RSALIB_P) * hex_uint(RSALIB_Q), n);

        let result = test_roca_fingerprint(&n).unwrap();
        assert!(result.applicable);
        assert!(result.vulnerable, "{}", result.details);
        assert_eq!(result.modulus_bits, Some(2048));
    }

    #[test]
    fn test_openssl_2048_modulus_not_flagged() {
        let result = test_roca_fingerprint(&hex_uint(OPENSSL_MODULUS)).unwrap();
        assert!(result.applicable);
        assert!(!result.vulnerable);
        assert_eq!(result.modulus_bits, Some(2048));
        assert!(result.details.contains("mod 11 "), "{}", result.details);
    }

    #[test]
    fn test_roca_generated_rsa_key_not_vulnerable() {
        use rsa::traits::PublicKeyParts;

        let mut rng = StdRng::seed_from_u64(7);
        let key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        assert!(!test_roca_fingerprint(key.n()).unwrap().vulnerable);
    }

    #[test]
    fn test_zero_modulus_not_applicable() {
        let zero = BigUint::from(0u32);
        assert_eq!(
            test_roca_fingerprint(&zero),
            Err(AnalysisError::NonPositiveModulus)
        );
        let result = roca_or_not_applicable(Some(&zero));
        assert!(!result.applicable);
        assert!(result.details.starts_with("not applicable"));
    }
}
