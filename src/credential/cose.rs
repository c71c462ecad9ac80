//! COSE Key Handling
//!
//! Authenticators hand back credential public keys as COSE_Key CBOR maps
//! (RFC 9052 §7). The rest of the service works with SPKI PEM, so this module
//! converts the two supported key classes: EC2 P-256 (ES256) and RSA (RS256).

use ciborium::value::Value;
use p256::pkcs8::EncodePublicKey as _;
use rsa::pkcs8::EncodePublicKey as _;

use crate::errors::{Result, ServiceError};

/// COSE algorithm identifiers this service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoseAlgorithm {
    /// ECDSA w/ SHA-256 over P-256 (COSE alg -7).
    Es256,
    /// RSASSA-PKCS1-v1_5 w/ SHA-256 (COSE alg -257).
    Rs256,
}

impl CoseAlgorithm {
    pub fn from_cose(alg: i128) -> Result<Self> {
        match alg {
            -7 => Ok(CoseAlgorithm::Es256),
            -257 => Ok(CoseAlgorithm::Rs256),
            other => Err(ServiceError::Credential(format!(
                "unsupported COSE algorithm {}",
                other
            ))),
        }
    }
}

// COSE_Key labels (RFC 9052)
const LABEL_KTY: i128 = 1;
const LABEL_ALG: i128 = 3;
const LABEL_EC2_CRV: i128 = -1;
const LABEL_EC2_X: i128 = -2;
const LABEL_EC2_Y: i128 = -3;
const LABEL_RSA_N: i128 = -1;
const LABEL_RSA_E: i128 = -2;

const KTY_EC2: i128 = 2;
const KTY_RSA: i128 = 3;
const CRV_P256: i128 = 1;

fn map_lookup<'a>(entries: &'a [(Value, Value)], label: i128) -> Option<&'a Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == label => Some(v),
        _ => None,
    })
}

fn as_int(value: Option<&Value>, what: &str) -> Result<i128> {
    match value {
        Some(Value::Integer(i)) => Ok(i128::from(*i)),
        _ => Err(ServiceError::Credential(format!(
            "COSE key missing integer field {}",
            what
        ))),
    }
}

fn as_bytes<'a>(value: Option<&'a Value>, what: &str) -> Result<&'a [u8]> {
    match value {
        Some(Value::Bytes(b)) => Ok(b),
        _ => Err(ServiceError::Credential(format!(
            "COSE key missing byte field {}",
            what
        ))),
    }
}

/// Parse a COSE_Key blob and re-encode it as an SPKI PEM public key.
pub fn cose_key_to_pem(cose_key: &[u8]) -> Result<(String, CoseAlgorithm)> {
    let value: Value = ciborium::de::from_reader(cose_key)
        .map_err(|e| ServiceError::Credential(format!("invalid COSE key CBOR: {}", e)))?;
    let entries = match value {
        Value::Map(entries) => entries,
        _ => {
            return Err(ServiceError::Credential(
                "COSE key is not a CBOR map".to_string(),
            ));
        }
    };

    let kty = as_int(map_lookup(&entries, LABEL_KTY), "kty")?;
    let alg = CoseAlgorithm::from_cose(as_int(map_lookup(&entries, LABEL_ALG), "alg")?)?;

    match (kty, alg) {
        (KTY_EC2, CoseAlgorithm::Es256) => {
            let crv = as_int(map_lookup(&entries, LABEL_EC2_CRV), "crv")?;
            if crv != CRV_P256 {
                return Err(ServiceError::Credential(format!(
                    "unsupported EC2 curve {}",
                    crv
                )));
            }
            let x = as_bytes(map_lookup(&entries, LABEL_EC2_X), "x")?;
            let y = as_bytes(map_lookup(&entries, LABEL_EC2_Y), "y")?;
            if x.len() != 32 || y.len() != 32 {
                return Err(ServiceError::Credential(
                    "EC2 coordinates must be 32 bytes".to_string(),
                ));
            }
            let point = p256::EncodedPoint::from_affine_coordinates(
                p256::FieldBytes::from_slice(x),
                p256::FieldBytes::from_slice(y),
                false,
            );
            let key = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|e| ServiceError::Credential(format!("invalid P-256 point: {}", e)))?;
            let pem = key
                .to_public_key_pem(p256::pkcs8::LineEnding::LF)
                .map_err(|e| ServiceError::Credential(format!("PEM encoding failed: {}", e)))?;
            Ok((pem, CoseAlgorithm::Es256))
        }
        (KTY_RSA, CoseAlgorithm::Rs256) => {
            let n = as_bytes(map_lookup(&entries, LABEL_RSA_N), "n")?;
            let e = as_bytes(map_lookup(&entries, LABEL_RSA_E), "e")?;
            let key = rsa::RsaPublicKey::new(
                rsa::BigUint::from_bytes_be(n),
                rsa::BigUint::from_bytes_be(e),
            )
            .map_err(|e| ServiceError::Credential(format!("invalid RSA key: {}", e)))?;
            let pem = key
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .map_err(|e| ServiceError::Credential(format!("PEM encoding failed: {}", e)))?;
            Ok((pem, CoseAlgorithm::Rs256))
        }
        (kty, alg) => Err(ServiceError::Credential(format!(
            "unsupported COSE kty/alg combination: kty={}, alg={:?}",
            kty, alg
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ciborium::value::Integer;
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    /// Encode a P-256 verifying key as a COSE_Key blob (test vector builder).
    pub fn p256_cose_key(key: &p256::ecdsa::VerifyingKey) -> Vec<u8> {
        let point = key.to_encoded_point(false);
        let entries = vec![
            (
                Value::Integer(Integer::from(1)),
                Value::Integer(Integer::from(2)),
            ),
            (
                Value::Integer(Integer::from(3)),
                Value::Integer(Integer::from(-7)),
            ),
            (
                Value::Integer(Integer::from(-1)),
                Value::Integer(Integer::from(1)),
            ),
            (
                Value::Integer(Integer::from(-2)),
                Value::Bytes(point.x().unwrap().to_vec()),
            ),
            (
                Value::Integer(Integer::from(-3)),
                Value::Bytes(point.y().unwrap().to_vec()),
            ),
        ];
        let mut out = Vec::new();
        ciborium::ser::into_writer(&Value::Map(entries), &mut out).unwrap();
        out
    }
}
