//! FIDO Attestation Verification
//!
//! Registration ceremony (`webauthn.create`): validate the attestation a
//! device produced against the challenge this service derived, and extract
//! the credential public key and signature counter for storage.
//!
//! Supported attestation formats are `none` and `packed` self-attestation.
//! Certificate-chain (`x5c`) attestation is rejected rather than silently
//! downgraded.

use ciborium::value::Value;
use p256::ecdsa::signature::Verifier as _;
use p256::pkcs8::DecodePublicKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::signature::Verifier as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::cose::{CoseAlgorithm, cose_key_to_pem};
use super::{AuthenticatorData, ClientData, decode_base64_lenient};
use crate::errors::{Result, ServiceError};

/// FIDO credential payload as received from the PISP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidoAttestation {
    pub id: String,
    pub raw_id: String,
    pub response: FidoAttestationResponse,
    #[serde(rename = "type")]
    pub credential_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidoAttestationResponse {
    /// base64 CBOR attestation object.
    pub attestation_object: String,
    /// base64 JSON collected client data.
    pub client_data_json: String,
}

/// What the relying party requires of the ceremony.
#[derive(Debug, Clone)]
pub struct AttestationExpectations {
    /// The derived challenge (base64 digest string) the device must have
    /// signed over.
    pub challenge: String,
    /// Expected origin; `None` skips the origin check.
    pub origin: Option<String>,
    pub require_user_verification: bool,
}

/// Outcome of a successful attestation: everything the service stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAttestation {
    pub public_key_pem: String,
    pub signature_counter: u32,
}

struct AttestationObject {
    fmt: String,
    auth_data: Vec<u8>,
    att_stmt: Vec<(Value, Value)>,
}

fn text_lookup<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Text(t) if t == key => Some(v),
        _ => None,
    })
}

fn parse_attestation_object(b64: &str) -> Result<AttestationObject> {
    let raw = decode_base64_lenient(b64)?;
    let value: Value = ciborium::de::from_reader(raw.as_slice())
        .map_err(|e| ServiceError::Credential(format!("invalid attestation object CBOR: {}", e)))?;
    let entries = match value {
        Value::Map(entries) => entries,
        _ => {
            return Err(ServiceError::Credential(
                "attestation object is not a CBOR map".to_string(),
            ));
        }
    };

    let fmt = match text_lookup(&entries, "fmt") {
        Some(Value::Text(t)) => t.clone(),
        _ => {
            return Err(ServiceError::Credential(
                "attestation object missing fmt".to_string(),
            ));
        }
    };
    let auth_data = match text_lookup(&entries, "authData") {
        Some(Value::Bytes(b)) => b.clone(),
        _ => {
            return Err(ServiceError::Credential(
                "attestation object missing authData".to_string(),
            ));
        }
    };
    let att_stmt = match text_lookup(&entries, "attStmt") {
        Some(Value::Map(m)) => m.clone(),
        None => Vec::new(),
        _ => {
            return Err(ServiceError::Credential(
                "attStmt is not a CBOR map".to_string(),
            ));
        }
    };

    Ok(AttestationObject {
        fmt,
        auth_data,
        att_stmt,
    })
}

/// Verify a packed self-attestation signature: `sig` over
/// `authData || SHA-256(clientDataJSON)` with the credential's own key.
fn verify_packed_self_attestation(
    att_stmt: &[(Value, Value)],
    auth_data: &[u8],
    client_data_raw: &[u8],
    public_key_pem: &str,
    key_alg: CoseAlgorithm,
) -> Result<()> {
    if text_lookup(att_stmt, "x5c").is_some() {
        return Err(ServiceError::Credential(
            "unsupported attestation format: packed with certificate chain".to_string(),
        ));
    }
    let stmt_alg = match text_lookup(att_stmt, "alg") {
        Some(Value::Integer(i)) => CoseAlgorithm::from_cose(i128::from(*i))?,
        _ => {
            return Err(ServiceError::Credential(
                "packed attStmt missing alg".to_string(),
            ));
        }
    };
    if stmt_alg != key_alg {
        return Err(ServiceError::Credential(
            "attStmt algorithm does not match credential key".to_string(),
        ));
    }
    let sig = match text_lookup(att_stmt, "sig") {
        Some(Value::Bytes(b)) => b.as_slice(),
        _ => {
            return Err(ServiceError::Credential(
                "packed attStmt missing sig".to_string(),
            ));
        }
    };

    let mut message = auth_data.to_vec();
    message.extend_from_slice(&Sha256::digest(client_data_raw));

    match key_alg {
        CoseAlgorithm::Es256 => {
            let key = p256::ecdsa::VerifyingKey::from_public_key_pem(public_key_pem)
                .map_err(|e| ServiceError::Credential(format!("invalid P-256 key: {}", e)))?;
            let signature = p256::ecdsa::Signature::from_der(sig)
                .map_err(|e| ServiceError::Credential(format!("invalid ES256 signature: {}", e)))?;
            key.verify(&message, &signature)
                .map_err(|_| ServiceError::Credential("self-attestation signature mismatch".to_string()))
        }
        CoseAlgorithm::Rs256 => {
            let key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|e| ServiceError::Credential(format!("invalid RSA key: {}", e)))?;
            let key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
            let signature = rsa::pkcs1v15::Signature::try_from(sig)
                .map_err(|e| ServiceError::Credential(format!("invalid RS256 signature: {}", e)))?;
            key.verify(&message, &signature)
                .map_err(|_| ServiceError::Credential("self-attestation signature mismatch".to_string()))
        }
    }
}

/// Validate a registration ceremony end to end.
pub fn verify_attestation(
    attestation: &FidoAttestation,
    expected: &AttestationExpectations,
) -> Result<VerifiedAttestation> {
    let (client_data, client_data_raw) = ClientData::decode(&attestation.response.client_data_json)?;
    if client_data.ceremony != "webauthn.create" {
        return Err(ServiceError::Credential(format!(
            "expected webauthn.create ceremony, got '{}'",
            client_data.ceremony
        )));
    }
    if !client_data.challenge_matches(&expected.challenge) {
        return Err(ServiceError::Credential(
            "attestation challenge does not match derived challenge".to_string(),
        ));
    }
    if let Some(origin) = &expected.origin {
        if &client_data.origin != origin {
            return Err(ServiceError::Credential(format!(
                "unexpected origin '{}'",
                client_data.origin
            )));
        }
    }

    let object = parse_attestation_object(&attestation.response.attestation_object)?;
    let auth = AuthenticatorData::parse(&object.auth_data)?;
    if !auth.user_present() {
        return Err(ServiceError::Credential(
            "user presence flag not set".to_string(),
        ));
    }
    if expected.require_user_verification && !auth.user_verified() {
        return Err(ServiceError::Credential(
            "user verification required but not performed".to_string(),
        ));
    }
    let cose_key = auth.credential_public_key.as_deref().ok_or_else(|| {
        ServiceError::Credential("attestation carries no attested credential data".to_string())
    })?;
    let (public_key_pem, key_alg) = cose_key_to_pem(cose_key)?;

    match object.fmt.as_str() {
        "none" => {}
        "packed" => verify_packed_self_attestation(
            &object.att_stmt,
            &object.auth_data,
            &client_data_raw,
            &public_key_pem,
            key_alg,
        )?,
        other => {
            return Err(ServiceError::Credential(format!(
                "unsupported attestation format '{}'",
                other
            )));
        }
    }

    debug!(
        credential_id = %attestation.id,
        fmt = %object.fmt,
        counter = auth.counter,
        "attestation verified"
    );
    Ok(VerifiedAttestation {
        public_key_pem,
        signature_counter: auth.counter,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::credential::{FLAG_USER_PRESENT, FLAG_USER_VERIFIED};
    use base64::Engine as _;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::DecodePublicKey;

    const CHALLENGE: &str = "scQtSTIbz8wUVPwjG0nnUYuEAPqhHpLZxPD3twZ1t4Y=";
    const ORIGIN: &str = "https://pisp.example";

    fn expectations() -> AttestationExpectations {
        AttestationExpectations {
            challenge: CHALLENGE.to_string(),
            origin: Some(ORIGIN.to_string()),
            require_user_verification: true,
        }
    }

    #[test]
    fn test_packed_self_attestation_verifies() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let attestation = packed_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            5,
            CHALLENGE,
            ORIGIN,
        );

        let verified = verify_attestation(&attestation, &expectations()).unwrap();
        assert_eq!(verified.signature_counter, 5);
        let restored =
            p256::ecdsa::VerifyingKey::from_public_key_pem(&verified.public_key_pem).unwrap();
        assert_eq!(&restored, key.verifying_key());
    }

    #[test]
    fn test_none_attestation_verifies() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let attestation = none_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            0,
            CHALLENGE,
            ORIGIN,
        );
        let verified = verify_attestation(&attestation, &expectations()).unwrap();
        assert_eq!(verified.signature_counter, 0);
    }

    #[test]
    fn test_wrong_ceremony_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let mut attestation = none_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            0,
            CHALLENGE,
            ORIGIN,
        );
        let (b64, _) = client_data_json("webauthn.get", CHALLENGE, ORIGIN);
        attestation.response.client_data_json = b64;
        assert!(verify_attestation(&attestation, &expectations()).is_err());
    }

    #[test]
    fn test_challenge_mismatch_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let attestation = packed_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            "some-other-challenge",
            ORIGIN,
        );
        assert!(verify_attestation(&attestation, &expectations()).is_err());
    }

    #[test]
    fn test_origin_mismatch_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let attestation = packed_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            CHALLENGE,
            "https://evil.example",
        );
        assert!(verify_attestation(&attestation, &expectations()).is_err());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let mut attestation = packed_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            CHALLENGE,
            ORIGIN,
        );
        // Flip one bit inside the attStmt signature bytes.
        let raw = decode_base64_lenient(&attestation.response.attestation_object).unwrap();
        let mut value: Value = ciborium::de::from_reader(raw.as_slice()).unwrap();
        if let Value::Map(entries) = &mut value {
            for (k, v) in entries.iter_mut() {
                if matches!(k, Value::Text(t) if t == "attStmt") {
                    if let Value::Map(stmt) = v {
                        for (sk, sv) in stmt.iter_mut() {
                            if matches!(sk, Value::Text(t) if t == "sig") {
                                if let Value::Bytes(sig) = sv {
                                    let last = sig.len() - 1;
                                    sig[last] ^= 0x01;
                                }
                            }
                        }
                    }
                }
            }
        }
        let mut out = Vec::new();
        ciborium::ser::into_writer(&value, &mut out).unwrap();
        attestation.response.attestation_object =
            base64::engine::general_purpose::STANDARD.encode(out);

        assert!(verify_attestation(&attestation, &expectations()).is_err());
    }

    #[test]
    fn test_user_verification_enforced() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let attestation = packed_attestation(&key, FLAG_USER_PRESENT, 1, CHALLENGE, ORIGIN);
        assert!(verify_attestation(&attestation, &expectations()).is_err());

        let relaxed = AttestationExpectations {
            require_user_verification: false,
            ..expectations()
        };
        assert!(verify_attestation(&attestation, &relaxed).is_ok());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let attestation = none_attestation(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            0,
            CHALLENGE,
            ORIGIN,
        );
        // Re-encode with an android-key fmt, which this service does not trust.
        let raw = decode_base64_lenient(&attestation.response.attestation_object).unwrap();
        let mut value: Value = ciborium::de::from_reader(raw.as_slice()).unwrap();
        if let Value::Map(entries) = &mut value {
            for (k, v) in entries.iter_mut() {
                if matches!(k, Value::Text(t) if t == "fmt") {
                    *v = Value::Text("android-key".to_string());
                }
            }
        }
        let mut out = Vec::new();
        ciborium::ser::into_writer(&value, &mut out).unwrap();
        let mut attestation = attestation;
        attestation.response.attestation_object =
            base64::engine::general_purpose::STANDARD.encode(out);

        let err = verify_attestation(&attestation, &expectations()).unwrap_err();
        assert!(matches!(err, ServiceError::Credential(_)));
    }
}
