//! JSON Web Key handling: the subset of RFC 7517 this server accepts
//! (RSA and P-256 EC public keys), RFC 7638 thumbprints, and signature
//! verification against a decoded JWS.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::signature::{self, UnparsedPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },
}

impl Jwk {
    /// Parses a JWK from the raw JSON object carried in a JWS header
    /// (`protected.jwk`) or stored alongside an account.
    pub fn from_value(value: &Value) -> Result<Self> {
        let kty = value
            .get("kty")
            .and_then(Value::as_str)
            .context("jwk missing kty")?;
        match kty {
            "RSA" => {
                let n = field_str(value, "n")?;
                let e = field_str(value, "e")?;
                Ok(Self::Rsa { n, e })
            }
            "EC" => {
                let crv = field_str(value, "crv")?;
                if crv != "P-256" {
                    bail!("unsupported EC curve: {crv}");
                }
                let x = field_str(value, "x")?;
                let y = field_str(value, "y")?;
                Ok(Self::Ec { crv, x, y })
            }
            other => bail!("unsupported kty: {other}"),
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the canonical (lexicographically
    /// key-sorted, no whitespace) JSON representation of the *required*
    /// members only.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        let mut canonical: BTreeMap<&'static str, &str> = BTreeMap::new();
        match self {
            Self::Rsa { n, e } => {
                canonical.insert("e", e);
                canonical.insert("kty", "RSA");
                canonical.insert("n", n);
            }
            Self::Ec { crv, x, y } => {
                canonical.insert("crv", crv);
                canonical.insert("kty", "EC");
                canonical.insert("x", x);
                canonical.insert("y", y);
            }
        }
        let json = serde_json::to_string(&canonical).unwrap_or_default();
        let digest = Sha256::digest(json.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Verifies `signature` over `signed_input` (the JWS
    /// `protected-b64.payload-b64` string) for the given `alg`.
    pub fn verify(&self, alg: &str, signed_input: &[u8], signature: &[u8]) -> Result<()> {
        let (algorithm, public_key_bytes): (&dyn VerifyAlg, Vec<u8>) = match (self, alg) {
            (Self::Rsa { n, e }, "RS256" | "RS384" | "RS512") => {
                let n = URL_SAFE_NO_PAD.decode(n).context("invalid jwk n")?;
                let e = URL_SAFE_NO_PAD.decode(e).context("invalid jwk e")?;
                let encoded = rsa_public_key_der(&n, &e)?;
                let alg: &dyn VerifyAlg = match alg {
                    "RS256" => &signature::RSA_PKCS1_2048_8192_SHA256,
                    "RS384" => &signature::RSA_PKCS1_2048_8192_SHA384,
                    _ => &signature::RSA_PKCS1_2048_8192_SHA512,
                };
                (alg, encoded)
            }
            (Self::Ec { .. }, "ES256") => {
                let point = self.ec_uncompressed_point()?;
                (&signature::ECDSA_P256_SHA256_FIXED as &dyn VerifyAlg, point)
            }
            _ => bail!("alg {alg} incompatible with jwk kty"),
        };
        let key = UnparsedPublicKey::new(algorithm, &public_key_bytes);
        key.verify(signed_input, signature)
            .map_err(|_| anyhow::anyhow!("signature verification failed"))
    }

    /// DER-encodes the `SubjectPublicKeyInfo` this key corresponds to, so
    /// it can be compared byte-for-byte against the SPKI `x509-parser`
    /// extracts from an issued certificate (used to authorize a
    /// cert-key-signed revocation without needing to re-derive a JWK from
    /// X.509 structures).
    pub fn spki_der(&self) -> Result<Vec<u8>> {
        match self {
            Self::Rsa { n, e } => {
                let n = URL_SAFE_NO_PAD.decode(n).context("invalid jwk n")?;
                let e = URL_SAFE_NO_PAD.decode(e).context("invalid jwk e")?;
                let key_der = rsa_public_key_der(&n, &e)?;
                let alg = sequence(&[oid(&RSA_ENCRYPTION_OID), NULL_TAG.to_vec()].concat());
                Ok(sequence(&[alg, bit_string(&key_der)].concat()))
            }
            Self::Ec { .. } => {
                let point = self.ec_uncompressed_point()?;
                let alg = sequence(&[oid(&EC_PUBLIC_KEY_OID), oid(&PRIME256V1_OID)].concat());
                Ok(sequence(&[alg, bit_string(&point)].concat()))
            }
        }
    }

    fn ec_uncompressed_point(&self) -> Result<Vec<u8>> {
        let Self::Ec { x, y, .. } = self else {
            bail!("not an EC key");
        };
        let x = URL_SAFE_NO_PAD.decode(x).context("invalid jwk x")?;
        let y = URL_SAFE_NO_PAD.decode(y).context("invalid jwk y")?;
        let mut point = Vec::with_capacity(1 + x.len() + y.len());
        point.push(0x04);
        point.extend_from_slice(&x);
        point.extend_from_slice(&y);
        Ok(point)
    }
}

/// A trait object shim so RSA and ECDSA verification algorithms (which
/// `ring` exposes as distinct static types) can share one call site.
trait VerifyAlg: signature::VerificationAlgorithm {}
impl<T: signature::VerificationAlgorithm> VerifyAlg for T {}

fn field_str(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .with_context(|| format!("jwk missing {key}"))
}

/// `ring`'s RSA verification takes the key as DER-encoded
/// `RSAPublicKey` (PKCS#1), which we build by hand from the raw
/// big-endian `n`/`e` since no teacher dependency does ASN.1 encoding
/// for us here.
fn rsa_public_key_der(n: &[u8], e: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    der_uint(&mut body, n);
    der_uint(&mut body, e);
    Ok(sequence(&body))
}

const RSA_ENCRYPTION_OID: [u8; 9] = [0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];
const EC_PUBLIC_KEY_OID: [u8; 7] = [0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
const PRIME256V1_OID: [u8; 8] = [0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
const NULL_TAG: &[u8] = &[0x05, 0x00];

fn der_uint(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut bytes = bytes;
    while bytes.first() == Some(&0) && bytes.len() > 1 {
        bytes = &bytes[1..];
    }
    let needs_pad = bytes.first().is_some_and(|b| b & 0x80 != 0);
    let len = bytes.len() + usize::from(needs_pad);
    buf.push(0x02);
    der_len(buf, len);
    if needs_pad {
        buf.push(0);
    }
    buf.extend_from_slice(bytes);
}

fn der_len(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(u8::try_from(len).unwrap_or(0x7f));
    } else {
        let bytes = len.to_be_bytes();
        let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        let significant = &bytes[first_nonzero..];
        buf.push(0x80 | u8::try_from(significant.len()).unwrap_or(1));
        buf.extend_from_slice(significant);
    }
}

fn sequence(content: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x30];
    der_len(&mut buf, content.len());
    buf.extend_from_slice(content);
    buf
}

fn bit_string(content: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x03];
    der_len(&mut buf, content.len() + 1);
    buf.push(0x00);
    buf.extend_from_slice(content);
    buf
}

fn oid(bytes: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x06];
    der_len(&mut buf, bytes.len());
    buf.extend_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbprint_is_stable_under_member_order() {
        let jwk = Jwk::from_value(&serde_json::json!({
            "kty": "RSA",
            "e": "AQAB",
            "n": "0vx7",
        }))
        .unwrap();
        let reordered = Jwk::from_value(&serde_json::json!({
            "n": "0vx7",
            "kty": "RSA",
            "e": "AQAB",
        }))
        .unwrap();
        assert_eq!(jwk.thumbprint(), reordered.thumbprint());
    }

    #[test]
    fn rejects_unsupported_curve() {
        let err = Jwk::from_value(&serde_json::json!({
            "kty": "EC",
            "crv": "P-521",
            "x": "AA",
            "y": "AA",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("P-521"));
    }
}
