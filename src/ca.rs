//! The internal Certificate Authority: CSR signing, CRL generation, and
//! the Fernet-compatible at-rest encryption of the CA private key.
//!
//! Certificate construction follows the same `rcgen` builder shape the
//! teacher uses in its own (client-side) CSR generation
//! (`build_csr_params`), just pointed the other way: instead of
//! producing a CSR, we consume one and sign it with a loaded `Issuer`.

use std::path::Path;

use anyhow::{Context, Result};
use rcgen::{
    CertificateParams, CertificateRevocationListParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose,
    RevocationReason, RevokedCertParams, SanType, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use time::{Duration, OffsetDateTime};

use crate::store::Store;
use crate::store::model::Ca;

/// Result of a successful issuance: the leaf certificate PEM and the
/// chain (`leaf || ca`) handed back to the client.
pub struct Issued {
    pub serial_hex: String,
    pub not_valid_before: OffsetDateTime,
    pub not_valid_after: OffsetDateTime,
    pub leaf_pem: String,
    pub chain_pem: String,
}

/// Decrypts the active CA's key and wraps both cert and key into an
/// `rcgen::Issuer` ready to sign.
pub fn load_issuer(ca: &Ca, encryption_key: &[u8; 32]) -> Result<Issuer<'static, KeyPair>> {
    let key_pem = fernet::decrypt(encryption_key, &ca.key_pem_enc).context("failed to decrypt CA key")?;
    let key_pem = String::from_utf8(key_pem).context("decrypted CA key is not valid utf-8")?;
    let key_pair = KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;
    let params = CertificateParams::from_ca_cert_pem(&ca.cert_pem).context("failed to parse CA certificate")?;
    Ok(Issuer::new(params, key_pair))
}

/// Signs a parsed CSR into a leaf certificate. `subject_domain` becomes
/// the certificate's Common Name; `san_domains` becomes its
/// `SubjectAlternativeName` extension. Both are assumed already
/// validated against the order's authorizations by the caller.
pub fn sign_csr(
    csr_der: &[u8],
    subject_domain: &str,
    san_domains: &[String],
    issuer: &Issuer<'static, KeyPair>,
    ca_cert_pem: &str,
    ca_serial_hex: &str,
    cert_lifetime: Duration,
    external_url: &str,
) -> Result<Issued> {
    let csr_params =
        CertificateSigningRequestParams::from_der(csr_der).context("failed to parse CSR")?;

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + cert_lifetime;
    let serial = random_serial_bytes();

    let mut params = csr_params.params;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth, ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = san_domains
        .iter()
        .filter_map(|domain| rcgen::Ia5String::try_from(domain.clone()).ok())
        .map(SanType::DnsName)
        .collect();
    params.crl_distribution_points = vec![format!("{external_url}ca/{ca_serial_hex}/crl")];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject_domain);
    params.distinguished_name = dn;

    let cert = params
        .signed_by(&csr_params.public_key, issuer)
        .context("failed to sign certificate")?;

    let leaf_pem = cert.pem();
    let chain_pem = format!("{leaf_pem}{ca_cert_pem}");

    Ok(Issued {
        serial_hex: hex_upper(&serial),
        not_valid_before: not_before,
        not_valid_after: not_after,
        leaf_pem,
        chain_pem,
    })
}

/// Rebuilds the CRL over every currently-revoked serial for one CA.
pub fn build_crl(
    issuer: &Issuer<'static, KeyPair>,
    revoked: &[(String, OffsetDateTime)],
    crl_lifetime: Duration,
) -> Result<String> {
    let this_update = OffsetDateTime::now_utc();
    let next_update = this_update + crl_lifetime;

    let revoked_certs = revoked
        .iter()
        .map(|(serial_hex, revoked_at)| RevokedCertParams {
            serial_number: SerialNumber::from_slice(&hex_decode(serial_hex)),
            revocation_time: *revoked_at,
            reason_code: Some(RevocationReason::Unspecified),
            invalidity_date: None,
        })
        .collect();

    let crl_params = CertificateRevocationListParams {
        this_update,
        next_update,
        crl_number: SerialNumber::from_slice(&this_update.unix_timestamp().to_be_bytes()),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: KeyIdMethod::Sha256,
    };

    let crl = crl_params.signed_by(issuer).context("failed to sign CRL")?;
    Ok(crl.pem())
}

fn random_serial_bytes() -> [u8; 16] {
    let mut buf = [0u8; 16];
    SystemRandom::new().fill(&mut buf).expect("system RNG unavailable");
    buf[0] &= 0x7f; // keep it a positive integer per X.509 DER INTEGER rules
    buf
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn hex_decode(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .filter_map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

/// Startup hook: imports a CA from `import_dir` (expects `ca.pem` and
/// `ca.key`) and marks it active, or falls back to requiring an already
/// active CA row. Per the spec, absent both, startup must fail fast
/// rather than silently run with no signing capability.
pub async fn ensure_active_ca(
    store: &dyn Store,
    import_dir: Option<&Path>,
    encryption_key: &[u8; 32],
    crl_lifetime: Duration,
) -> Result<()> {
    if let Some(dir) = import_dir {
        let cert_path = dir.join("ca.pem");
        let key_path = dir.join("ca.key");
        if tokio::fs::try_exists(&cert_path).await.unwrap_or(false)
            && tokio::fs::try_exists(&key_path).await.unwrap_or(false)
        {
            let cert_pem = tokio::fs::read_to_string(&cert_path)
                .await
                .with_context(|| format!("failed to read {}", cert_path.display()))?;
            let key_pem = tokio::fs::read_to_string(&key_path)
                .await
                .with_context(|| format!("failed to read {}", key_path.display()))?;
            let serial_hex = serial_from_cert_pem(&cert_pem)?;
            let key_pem_enc = fernet::encrypt(encryption_key, key_pem.as_bytes());

            store.deactivate_all_cas().await?;
            let ca = Ca {
                serial_number: serial_hex.clone(),
                cert_pem: cert_pem.clone(),
                key_pem_enc,
                active: true,
                crl_pem: String::new(),
            };
            let issuer = load_issuer(&ca, encryption_key)?;
            let crl_pem = build_crl(&issuer, &[], crl_lifetime)?;
            store
                .upsert_ca(Ca {
                    crl_pem,
                    ..ca
                })
                .await?;
            return Ok(());
        }
    }

    if store.get_active_ca().await?.is_none() {
        anyhow::bail!(
            "no active CA configured: set ca.import_dir to a directory with ca.pem/ca.key, \
             or seed the store with an active CA row before starting"
        );
    }
    Ok(())
}

fn serial_from_cert_pem(pem: &str) -> Result<String> {
    let (_, parsed_pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).context("invalid CA cert PEM")?;
    let (_, cert) = x509_parser::parse_x509_certificate(&parsed_pem.contents)
        .context("invalid CA certificate")?;
    Ok(hex_upper(cert.raw_serial()))
}

/// Fernet-compatible symmetric authenticated encryption, reimplemented
/// against `aes` + `cbc` + `hmac`/`sha2` so at-rest CA key blobs stay
/// byte-compatible with the `cryptography.fernet.Fernet` format used by
/// the original deployment this system's encryption-key secret is
/// carried over from.
pub mod fernet {
    use aes::Aes128;
    use anyhow::{Result, bail};
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
    use hmac::{Hmac, Mac};
    use ring::rand::{SecureRandom, SystemRandom};
    use sha2::Sha256;
    use time::OffsetDateTime;

    type Enc = cbc::Encryptor<Aes128>;
    type Dec = cbc::Decryptor<Aes128>;
    type HmacSha256 = Hmac<Sha256>;

    const VERSION: u8 = 0x80;

    /// Decodes `key` (a base64url, 32-byte Fernet key) into the split
    /// signing/encryption halves Fernet defines.
    pub fn split_key(key: &[u8; 32]) -> ([u8; 16], [u8; 16]) {
        let mut signing = [0u8; 16];
        let mut encryption = [0u8; 16];
        signing.copy_from_slice(&key[..16]);
        encryption.copy_from_slice(&key[16..]);
        (signing, encryption)
    }

    pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let (signing_key, encryption_key) = split_key(key);
        let mut iv = [0u8; 16];
        SystemRandom::new().fill(&mut iv).expect("system RNG unavailable");

        let ciphertext = Enc::new(&encryption_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let mut token = Vec::with_capacity(1 + 8 + 16 + ciphertext.len() + 32);
        token.push(VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = HmacSha256::new_from_slice(&signing_key).expect("hmac accepts any key length");
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());
        token
    }

    pub fn decrypt(key: &[u8; 32], token: &[u8]) -> Result<Vec<u8>> {
        let (signing_key, encryption_key) = split_key(key);
        if token.len() < 1 + 8 + 16 + 32 {
            bail!("fernet token too short");
        }
        let (body, mac_tag) = token.split_at(token.len() - 32);
        let mut mac = HmacSha256::new_from_slice(&signing_key).expect("hmac accepts any key length");
        mac.update(body);
        mac.verify_slice(mac_tag).map_err(|_| anyhow::anyhow!("fernet hmac mismatch"))?;

        if body[0] != VERSION {
            bail!("unsupported fernet token version");
        }
        let iv: [u8; 16] = body[9..25].try_into().expect("slice is 16 bytes");
        let ciphertext = &body[25..];
        let plaintext = Dec::new(&encryption_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| anyhow::anyhow!("fernet padding invalid"))?;
        Ok(plaintext)
    }

    /// Parses an operator-supplied secret (base64url, no padding) into
    /// the raw 32-byte Fernet key.
    pub fn parse_key(secret: &str) -> Result<[u8; 32]> {
        let bytes = URL_SAFE_NO_PAD
            .decode(secret.trim())
            .map_err(|e| anyhow::anyhow!("ca.encryption_key is not valid base64url: {e}"))?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("ca.encryption_key must decode to exactly 32 bytes"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips() {
            let key = [7u8; 32];
            let token = encrypt(&key, b"hello ca key");
            let plain = decrypt(&key, &token).unwrap();
            assert_eq!(plain, b"hello ca key");
        }

        #[test]
        fn rejects_tampered_token() {
            let key = [7u8; 32];
            let mut token = encrypt(&key, b"hello ca key");
            let last = token.len() - 1;
            token[last] ^= 0xff;
            assert!(decrypt(&key, &token).is_err());
        }
    }
}
