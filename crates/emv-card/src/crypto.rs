//! Cryptographic operations for EMV certificate recovery
//!
//! Certificates are opened with the parent public key (RSA recovery) and the
//! embedded key material rebuilt. Hash results are not checked.

use emv_ca_keys::CaKeyStore;
use emv_common::tags;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::extract::Extractor;
use crate::security::AuthenticationMethod;

const HEADER: u8 = 0x6A;
const ISSUER_TRAILER: u8 = 0xBC;
const ICC_TRAILER: u8 = 0xCC;
/// Hash result (20 bytes) plus trailer
const HASH_AND_TRAILER: usize = 21;
const PAD: u8 = 0xBB;

/// Certificate material extracted from the exchange log
#[derive(Debug, Clone, Default)]
pub struct CertificateChainData {
    pub aip: Option<Vec<u8>>,
    pub ca_index: Option<u8>,
    pub rid: Vec<u8>,
    pub issuer_cert: Option<Vec<u8>>,
    pub issuer_exp: Option<Vec<u8>>,
    pub issuer_rem: Option<Vec<u8>>,
    pub icc_cert: Option<Vec<u8>>,
    pub icc_exp: Option<Vec<u8>>,
    pub icc_rem: Option<Vec<u8>>,
    pub sda_tag_list: Option<Vec<u8>>,
    pub signed_static_app_data: Option<Vec<u8>>,
}

impl CertificateChainData {
    /// Collect certificate tags from wherever the card put them
    pub fn from_extractor(extractor: &Extractor<'_>, aid: &[u8]) -> Self {
        let get = |tag: emv_common::EmvTag| extractor.find(tag.bytes()).map(<[u8]>::to_vec);
        Self {
            aip: extractor.aip().map(<[u8]>::to_vec),
            ca_index: extractor
                .find(tags::CA_PUBLIC_KEY_INDEX.bytes())
                .and_then(|v| v.first().copied()),
            rid: aid.iter().take(5).copied().collect(),
            issuer_cert: get(tags::ISSUER_PUBLIC_KEY_CERTIFICATE),
            issuer_exp: get(tags::ISSUER_PUBLIC_KEY_EXPONENT),
            issuer_rem: get(tags::ISSUER_PUBLIC_KEY_REMAINDER),
            icc_cert: get(tags::ICC_PUBLIC_KEY_CERTIFICATE),
            icc_exp: get(tags::ICC_PUBLIC_KEY_EXPONENT),
            icc_rem: get(tags::ICC_PUBLIC_KEY_REMAINDER),
            sda_tag_list: get(tags::STATIC_DATA_AUTHENTICATION_TAG_LIST),
            signed_static_app_data: get(tags::SIGNED_STATIC_APPLICATION_DATA),
        }
    }

    fn ca_key<'s>(&self, store: &'s CaKeyStore) -> Result<&'s RsaPublicKey, AnalysisError> {
        let index = self
            .ca_index
            .ok_or_else(|| {
                AnalysisError::NoPublicKey("CA public key index (8F) not found".into())
            })?;
        store.get(&self.rid, index).ok_or_else(|| {
            AnalysisError::NoPublicKey(format!(
                "CA public key not found for RID {} index {:02X}",
                hex::encode_upper(&self.rid),
                index
            ))
        })
    }

    /// Recover the issuer public key through the CA key
    pub fn issuer_key(&self, store: &CaKeyStore) -> Result<RsaPublicKey, AnalysisError> {
        let ca_key = self.ca_key(store)?;
        let cert = self
            .issuer_cert
            .as_deref()
            .ok_or_else(|| AnalysisError::NoPublicKey("issuer certificate (90) not found".into()))?;
        let recovered = verify_certificate(cert, ca_key, ISSUER_TRAILER)
            .ok_or_else(|| {
                AnalysisError::Certificate("issuer certificate did not recover".into())
            })?;
        let exponent = self.issuer_exp.as_deref().ok_or_else(|| {
            AnalysisError::NoPublicKey("issuer public key exponent (9F32) not found".into())
        })?;
        let (part, pk_len) = extract_public_key(&recovered, CertLayout::ISSUER)
            .ok_or_else(|| AnalysisError::Certificate("issuer certificate too short".into()))?;
        build_public_key(part, self.issuer_rem.as_deref(), exponent, pk_len)
    }

    /// Issuer public key modulus, the input of the ROCA test
    pub fn issuer_modulus(&self, store: &CaKeyStore) -> Result<BigUint, AnalysisError> {
        let key = self.issuer_key(store)?;
        debug!(bits = key.n().bits(), "Recovered issuer public key");
        Ok(key.n().clone())
    }
}

/// Where the key fields sit in a recovered certificate
#[derive(Debug, Clone, Copy)]
struct CertLayout {
    pk_length_at: usize,
    pk_start: usize,
}

impl CertLayout {
    /// EMV Book 2 table 6: 6A 02, issuer id (4), expiry (2), serial (3),
    /// hash alg, pk alg, pk len, exp len, key
    const ISSUER: CertLayout = CertLayout {
        pk_length_at: 13,
        pk_start: 15,
    };

    /// EMV Book 2 table 14: 6A 04, PAN (10), expiry (2), serial (3),
    /// hash alg, pk alg, pk len, exp len, key
    const ICC: CertLayout = CertLayout {
        pk_length_at: 19,
        pk_start: 21,
    };
}

/// Open an EMV certificate with the parent public key
///
/// # Arguments
/// * `certificate` - The certificate bytes
/// * `parent_key` - The parent's public key
/// * `expected_trailer` - Expected trailer byte (0xBC for issuer, 0xCC for ICC)
///
/// # Returns
/// * `Some(Vec<u8>)` - Recovered certificate data if header and trailer match
/// * `None` - If recovery fails
pub fn verify_certificate(
    certificate: &[u8],
    parent_key: &RsaPublicKey,
    expected_trailer: u8,
) -> Option<Vec<u8>> {
    let modulus = parent_key.n();
    let expected_len = (modulus.bits() + 7) / 8;
    if certificate.len() != expected_len {
        warn!(
            cert_len = certificate.len(),
            key_len = expected_len,
            "Certificate length does not match key length"
        );
        return None;
    }

    let recovered = BigUint::from_bytes_be(certificate).modpow(parent_key.e(), modulus);
    let raw = recovered.to_bytes_be();
    if raw.len() > expected_len {
        return None;
    }
    let mut recovered_bytes = vec![0u8; expected_len - raw.len()];
    recovered_bytes.extend_from_slice(&raw);

    match (recovered_bytes.first(), recovered_bytes.last()) {
        (Some(&HEADER), Some(&trailer)) if trailer == expected_trailer => Some(recovered_bytes),
        (first, last) => {
            debug!(
                header = ?first,
                trailer = ?last,
                expected_trailer,
                "Certificate recovery produced wrong framing"
            );
            None
        }
    }
}

/// Key bytes held in the certificate and the declared full key length
fn extract_public_key(recovered: &[u8], layout: CertLayout) -> Option<(Vec<u8>, usize)> {
    if recovered.len() < layout.pk_start + HASH_AND_TRAILER {
        return None;
    }
    let pk_len = recovered[layout.pk_length_at] as usize;
    let mut part = recovered[layout.pk_start..recovered.len() - HASH_AND_TRAILER].to_vec();
    if part.len() > pk_len {
        // Key shorter than the space for it; the rest is BB padding
        part.truncate(pk_len);
    }
    Some((part, pk_len))
}

/// Build complete public key from certificate part and optional remainder
fn build_public_key(
    mut modulus_bytes: Vec<u8>,
    remainder: Option<&[u8]>,
    exponent_bytes: &[u8],
    total_length: usize,
) -> Result<RsaPublicKey, AnalysisError> {
    if modulus_bytes.len() < total_length {
        if let Some(remainder) = remainder {
            modulus_bytes.extend_from_slice(remainder);
        }
    }
    if modulus_bytes.len() < total_length {
        return Err(AnalysisError::Certificate(format!(
            "public key needs {total_length} bytes, have {}",
            modulus_bytes.len()
        )));
    }
    modulus_bytes.truncate(total_length);

    let modulus = BigUint::from_bytes_be(&modulus_bytes);
    if modulus.bits() == 0 {
        return Err(AnalysisError::NonPositiveModulus);
    }
    RsaPublicKey::new(modulus, BigUint::from_bytes_be(exponent_bytes))
        .map_err(|e| AnalysisError::Certificate(e.to_string()))
}

/// Certificate chain check outcome
#[derive(Debug, Clone, Serialize)]
pub struct CertificateVerificationResult {
    pub auth_method: AuthenticationMethod,
    pub ca_key_found: bool,
    pub issuer_cert_valid: bool,
    pub icc_cert_valid: bool,
    pub chain_valid: bool,
    pub errors: Vec<String>,
}

impl CertificateVerificationResult {
    fn new(auth_method: AuthenticationMethod) -> Self {
        Self {
            auth_method,
            ca_key_found: false,
            issuer_cert_valid: false,
            icc_cert_valid: false,
            chain_valid: false,
            errors: Vec::new(),
        }
    }
}

/// Walk the CA → issuer → ICC chain as far as the card data allows
pub fn verify_certificate_chain(
    cert_data: &CertificateChainData,
    store: &CaKeyStore,
) -> CertificateVerificationResult {
    let aip = cert_data.aip.as_deref().unwrap_or_default();
    let advertised = crate::security::analyze_aip_bytes(aip).auth_method();

    // Cards may advertise CDA but carry only SDA data
    let auth_method = if cert_data.sda_tag_list.is_some() && cert_data.issuer_cert.is_none() {
        AuthenticationMethod::Sda
    } else {
        advertised
    };

    let mut result = CertificateVerificationResult::new(auth_method);
    if auth_method == AuthenticationMethod::None {
        result.errors.push("No authentication method detected in AIP".to_string());
        return result;
    }

    result.ca_key_found = cert_data.ca_key(store).is_ok();
    let issuer_key = match cert_data.issuer_key(store) {
        Ok(key) => {
            result.issuer_cert_valid = true;
            key
        }
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };

    if auth_method == AuthenticationMethod::Sda {
        if cert_data.signed_static_app_data.is_none() {
            result
                .errors
                .push("Signed Static Application Data (93) not found".to_string());
        }
        result.chain_valid = result.errors.is_empty();
        return result;
    }

    match cert_data.icc_cert.as_deref() {
        Some(icc_cert) => match verify_certificate(icc_cert, &issuer_key, ICC_TRAILER) {
            Some(recovered) => {
                result.icc_cert_valid = true;
                if let Some((part, pk_len)) = extract_public_key(&recovered, CertLayout::ICC) {
                    debug!(pk_len, cert_part = part.len(), "ICC public key recovered");
                }
            }
            None => result
                .errors
                .push("ICC certificate recovery failed".to_string()),
        },
        None => result
            .errors
            .push("ICC certificate not found in card data".to_string()),
    }

    result.chain_valid = result.ca_key_found && result.issuer_cert_valid && result.icc_cert_valid;
    result
}

#[cfg(test)]
pub(crate) mod test_support {
    use emv_ca_keys::CaPublicKey;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};
    use rsa::{BigUint, RsaPrivateKey};

    pub const RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x00, 0x03];
    pub const CA_INDEX: u8 = 0x92;

    /// A CA key, a certificate it signed, and the issuer modulus inside
    pub struct SignedIssuer {
        pub store: emv_ca_keys::CaKeyStore,
        pub certificate: Vec<u8>,
        pub remainder: Vec<u8>,
        pub issuer_modulus: Vec<u8>,
    }

    pub fn sign_issuer_certificate(seed: u64, issuer_modulus: Option<Vec<u8>>) -> SignedIssuer {
        let mut rng = StdRng::seed_from_u64(seed);
        let ca = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let n_len = (ca.n().bits() + 7) / 8;

        let issuer_modulus = issuer_modulus.unwrap_or_else(|| {
            let mut m = vec![0u8; n_len];
            rng.fill_bytes(&mut m);
            m[0] |= 0x80;
            m
        });
        let room = n_len - 36;
        let split = room.min(issuer_modulus.len());

        let mut plain = vec![
            0x6A, 0x02, 0x47, 0x61, 0x73, 0xFF, 0x12, 0x30, 0x00, 0x00, 0x01, 0x01, 0x01,
        ];
        plain.push(issuer_modulus.len() as u8);
        plain.push(0x01);
        plain.extend_from_slice(&issuer_modulus[..split]);
        plain.resize(n_len - 21, 0xBB);
        plain.extend_from_slice(&[0x5A; 20]);
        plain.push(0xBC);

        let signed = BigUint::from_bytes_be(&plain).modpow(ca.d(), ca.n());
        let raw = signed.to_bytes_be();
        let mut certificate = vec![0u8; n_len - raw.len()];
        certificate.extend_from_slice(&raw);

        let mut store = emv_ca_keys::CaKeyStore::new();
        store.insert(CaPublicKey {
            scheme: "Test".into(),
            rid: RID.to_vec(),
            index: CA_INDEX,
            key: ca.to_public_key(),
        });

        SignedIssuer {
            store,
            certificate,
            remainder: issuer_modulus[split..].to_vec(),
            issuer_modulus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn chain_for(signed: &SignedIssuer) -> CertificateChainData {
        CertificateChainData {
            aip: Some(vec![0x39, 0x00]),
            ca_index: Some(CA_INDEX),
            rid: RID.to_vec(),
            issuer_cert: Some(signed.certificate.clone()),
            issuer_exp: Some(vec![0x03]),
            issuer_rem: (!signed.remainder.is_empty()).then(|| signed.remainder.clone()),
            ..Default::default()
        }
    }

    #[test]
    fn test_issuer_key_with_remainder() {
        let signed = sign_issuer_certificate(1, None);
        assert!(!signed.remainder.is_empty());
        let modulus = chain_for(&signed).issuer_modulus(&signed.store).unwrap();
        assert_eq!(modulus.to_bytes_be(), signed.issuer_modulus);
    }

    #[test]
    fn test_short_issuer_key_strips_padding() {
        let short = vec![0xC1; 64];
        let signed = sign_issuer_certificate(2, Some(short.clone()));
        assert!(signed.remainder.is_empty());
        let modulus = chain_for(&signed).issuer_modulus(&signed.store).unwrap();
        assert_eq!(modulus.to_bytes_be(), short);
    }

    #[test]
    fn test_missing_remainder_is_an_error() {
        let signed = sign_issuer_certificate(3, None);
        let mut chain = chain_for(&signed);
        chain.issuer_rem = None;
        assert!(matches!(
            chain.issuer_key(&signed.store),
            Err(AnalysisError::Certificate(_))
        ));
    }

    #[test]
    fn test_unknown_ca_index() {
        let signed = sign_issuer_certificate(4, None);
        let mut chain = chain_for(&signed);
        chain.ca_index = Some(0x01);
        assert!(matches!(
            chain.issuer_key(&signed.store),
            Err(AnalysisError::NoPublicKey(_))
        ));
    }

    #[test]
    fn test_chain_stops_without_icc_certificate() {
        let signed = sign_issuer_certificate(5, None);
        let result = verify_certificate_chain(&chain_for(&signed), &signed.store);
        assert_eq!(result.auth_method, AuthenticationMethod::Cda);
        assert!(result.ca_key_found);
        assert!(result.issuer_cert_valid);
        assert!(!result.chain_valid);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_no_auth_method() {
        let chain = CertificateChainData {
            aip: Some(vec![0x00, 0x00]),
            ..Default::default()
        };
        let result = verify_certificate_chain(&chain, &CaKeyStore::new());
        assert_eq!(result.auth_method, AuthenticationMethod::None);
        assert!(!result.chain_valid);
    }
}
