//! FIDO Assertion Verification
//!
//! Transaction-signing ceremony (`webauthn.get`): validate a signed assertion
//! against the credential public key and signature counter stored at
//! registration time.
//!
//! Every failure collapses to [`ServiceError::AuthorizationFailed`]. The
//! specific reason is logged server-side only; callers (and peers) never
//! learn which check failed.

use p256::ecdsa::signature::Verifier as _;
use p256::pkcs8::DecodePublicKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::signature::Verifier as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{AuthenticatorData, ClientData, decode_base64_lenient};
use crate::errors::{Result, ServiceError};

/// Signed assertion payload as received from the PISP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidoAssertion {
    pub id: String,
    pub raw_id: String,
    pub response: FidoAssertionResponse,
    #[serde(rename = "type")]
    pub credential_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidoAssertionResponse {
    /// base64 raw authenticator data.
    pub authenticator_data: String,
    /// base64 JSON collected client data.
    pub client_data_json: String,
    /// base64 signature over `authenticatorData || SHA-256(clientDataJSON)`.
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_handle: Option<String>,
}

/// What the relying party holds from registration, plus ceremony policy.
#[derive(Debug, Clone)]
pub struct AssertionExpectations {
    /// The derived challenge (base64 digest string) the device must have
    /// signed over.
    pub challenge: String,
    /// Expected origin; `None` skips the origin check.
    pub origin: Option<String>,
    /// SPKI PEM credential public key stored at registration.
    pub public_key_pem: String,
    /// Signature counter stored at registration.
    pub previous_counter: u32,
    pub require_user_verification: bool,
}

fn verify_signature(public_key_pem: &str, message: &[u8], signature: &[u8]) -> std::result::Result<(), String> {
    if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(public_key_pem) {
        let sig = p256::ecdsa::Signature::from_der(signature)
            .map_err(|e| format!("invalid ES256 signature encoding: {}", e))?;
        return key
            .verify(message, &sig)
            .map_err(|_| "ES256 signature mismatch".to_string());
    }
    if let Ok(key) = rsa::RsaPublicKey::from_public_key_pem(public_key_pem) {
        let key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
        let sig = rsa::pkcs1v15::Signature::try_from(signature)
            .map_err(|e| format!("invalid RS256 signature encoding: {}", e))?;
        return key
            .verify(message, &sig)
            .map_err(|_| "RS256 signature mismatch".to_string());
    }
    Err("stored public key is neither P-256 nor RSA".to_string())
}

fn check_assertion(
    assertion: &FidoAssertion,
    expected: &AssertionExpectations,
) -> std::result::Result<u32, String> {
    let (client_data, client_data_raw) = ClientData::decode(&assertion.response.client_data_json)
        .map_err(|e| e.to_string())?;
    if client_data.ceremony != "webauthn.get" {
        return Err(format!(
            "expected webauthn.get ceremony, got '{}'",
            client_data.ceremony
        ));
    }
    if !client_data.challenge_matches(&expected.challenge) {
        return Err("assertion challenge does not match derived challenge".to_string());
    }
    if let Some(origin) = &expected.origin {
        if &client_data.origin != origin {
            return Err(format!("unexpected origin '{}'", client_data.origin));
        }
    }

    let auth_data_raw =
        decode_base64_lenient(&assertion.response.authenticator_data).map_err(|e| e.to_string())?;
    let auth = AuthenticatorData::parse(&auth_data_raw).map_err(|e| e.to_string())?;
    if !auth.user_present() {
        return Err("user presence flag not set".to_string());
    }
    if expected.require_user_verification && !auth.user_verified() {
        return Err("user verification required but not performed".to_string());
    }

    let signature =
        decode_base64_lenient(&assertion.response.signature).map_err(|e| e.to_string())?;
    let mut message = auth_data_raw.clone();
    message.extend_from_slice(&Sha256::digest(&client_data_raw));
    verify_signature(&expected.public_key_pem, &message, &signature)?;

    // Clone-detection: the counter must advance, except for authenticators
    // that never implement one and always report zero.
    if auth.counter <= expected.previous_counter && !(auth.counter == 0 && expected.previous_counter == 0) {
        return Err(format!(
            "signature counter did not advance: stored {}, received {}",
            expected.previous_counter, auth.counter
        ));
    }

    Ok(auth.counter)
}

/// Validate a transaction-signing ceremony. Returns the new signature
/// counter to store on success.
pub fn verify_assertion(
    assertion: &FidoAssertion,
    expected: &AssertionExpectations,
) -> Result<u32> {
    check_assertion(assertion, expected).map_err(|reason| {
        warn!(credential_id = %assertion.id, %reason, "assertion rejected");
        ServiceError::AuthorizationFailed
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::credential::attestation::test_support::client_data_json;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer as _;

    /// Plain authenticator data (no attested credential data).
    pub fn auth_data(flags: u8, counter: u32) -> Vec<u8> {
        let mut out = vec![0u8; 32];
        out.push(flags);
        out.extend_from_slice(&counter.to_be_bytes());
        out
    }

    /// Build a complete assertion signed by `signing_key`.
    pub fn signed_assertion(
        signing_key: &SigningKey,
        flags: u8,
        counter: u32,
        challenge: &str,
        origin: &str,
    ) -> FidoAssertion {
        let auth_data_raw = auth_data(flags, counter);
        let (client_data_b64, client_data_raw) = client_data_json("webauthn.get", challenge, origin);

        let mut message = auth_data_raw.clone();
        message.extend_from_slice(&Sha256::digest(&client_data_raw));
        let signature: p256::ecdsa::Signature = signing_key.sign(&message);

        FidoAssertion {
            id: "credential-1".to_string(),
            raw_id: STANDARD.encode([0xabu8; 16]),
            response: FidoAssertionResponse {
                authenticator_data: STANDARD.encode(&auth_data_raw),
                client_data_json: client_data_b64,
                signature: STANDARD.encode(signature.to_der().as_bytes()),
                user_handle: None,
            },
            credential_kind: "public-key".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::credential::{FLAG_USER_PRESENT, FLAG_USER_VERIFIED};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;

    const CHALLENGE: &str = "scQtSTIbz8wUVPwjG0nnUYuEAPqhHpLZxPD3twZ1t4Y=";
    const ORIGIN: &str = "https://pisp.example";

    fn keypair() -> (SigningKey, String) {
        let signing = SigningKey::random(&mut rand::thread_rng());
        let pem = signing
            .verifying_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();
        (signing, pem)
    }

    fn expectations(pem: &str, previous_counter: u32) -> AssertionExpectations {
        AssertionExpectations {
            challenge: CHALLENGE.to_string(),
            origin: Some(ORIGIN.to_string()),
            public_key_pem: pem.to_string(),
            previous_counter,
            require_user_verification: true,
        }
    }

    #[test]
    fn test_valid_assertion_returns_new_counter() {
        let (key, pem) = keypair();
        let assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            7,
            CHALLENGE,
            ORIGIN,
        );
        let counter = verify_assertion(&assertion, &expectations(&pem, 3)).unwrap();
        assert_eq!(counter, 7);
    }

    #[test]
    fn test_counter_regression_rejected() {
        let (key, pem) = keypair();
        let assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            3,
            CHALLENGE,
            ORIGIN,
        );
        let err = verify_assertion(&assertion, &expectations(&pem, 3)).unwrap_err();
        assert!(matches!(err, ServiceError::AuthorizationFailed));
    }

    #[test]
    fn test_zero_counters_permitted() {
        let (key, pem) = keypair();
        let assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            0,
            CHALLENGE,
            ORIGIN,
        );
        assert_eq!(verify_assertion(&assertion, &expectations(&pem, 0)).unwrap(), 0);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (key, _) = keypair();
        let (_, other_pem) = keypair();
        let assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            CHALLENGE,
            ORIGIN,
        );
        let err = verify_assertion(&assertion, &expectations(&other_pem, 0)).unwrap_err();
        assert!(matches!(err, ServiceError::AuthorizationFailed));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (key, pem) = keypair();
        let mut assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            CHALLENGE,
            ORIGIN,
        );
        let mut sig = STANDARD.decode(&assertion.response.signature).unwrap();
        let last = sig.len() - 1;
        sig[last] ^= 0x01;
        assertion.response.signature = STANDARD.encode(sig);

        let err = verify_assertion(&assertion, &expectations(&pem, 0)).unwrap_err();
        assert!(matches!(err, ServiceError::AuthorizationFailed));
    }

    #[test]
    fn test_challenge_mismatch_rejected() {
        let (key, pem) = keypair();
        let assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            "another-challenge",
            ORIGIN,
        );
        assert!(verify_assertion(&assertion, &expectations(&pem, 0)).is_err());
    }

    #[test]
    fn test_user_verification_enforced() {
        let (key, pem) = keypair();
        let assertion = signed_assertion(&key, FLAG_USER_PRESENT, 1, CHALLENGE, ORIGIN);
        assert!(verify_assertion(&assertion, &expectations(&pem, 0)).is_err());

        let relaxed = AssertionExpectations {
            require_user_verification: false,
            ..expectations(&pem, 0)
        };
        assert!(verify_assertion(&assertion, &relaxed).is_ok());
    }

    #[test]
    fn test_wrong_ceremony_rejected() {
        let (key, pem) = keypair();
        let mut assertion = signed_assertion(
            &key,
            FLAG_USER_PRESENT | FLAG_USER_VERIFIED,
            1,
            CHALLENGE,
            ORIGIN,
        );
        let (b64, _) = crate::credential::attestation::test_support::client_data_json(
            "webauthn.create",
            CHALLENGE,
            ORIGIN,
        );
        assertion.response.client_data_json = b64;
        assert!(verify_assertion(&assertion, &expectations(&pem, 0)).is_err());
    }
}
