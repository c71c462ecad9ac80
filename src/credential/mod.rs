//! Credential Verification
//!
//! Public-key verification for the three trust paths the service supports:
//!
//! - [`raw_signature`]: server-to-server challenge/response signatures
//!   (RSA-2048 and ECDSA secp256k1 over PEM keys).
//! - [`attestation`]: FIDO registration. Validate a device attestation and
//!   extract the credential public key and signature counter.
//! - [`assertion`]: FIDO transaction signing. Validate a signed assertion
//!   against the stored public key and counter.
//!
//! One principle across all three: never trust client-asserted success,
//! always re-derive trust from key material this service holds.

pub mod assertion;
pub mod attestation;
pub mod cose;
pub mod raw_signature;

pub use assertion::{AssertionExpectations, FidoAssertion, FidoAssertionResponse, verify_assertion};
pub use attestation::{
    AttestationExpectations, FidoAttestation, FidoAttestationResponse, VerifiedAttestation,
    verify_attestation,
};
pub use raw_signature::verify_raw_signature;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde::Deserialize;

use crate::errors::{Result, ServiceError};

/// Authenticator data flag bits (WebAuthn §6.1).
pub(crate) const FLAG_USER_PRESENT: u8 = 0x01;
pub(crate) const FLAG_USER_VERIFIED: u8 = 0x04;
pub(crate) const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;

/// Decode base64 accepting both standard and url-safe alphabets, padded or
/// not. Browsers and FIDO libraries disagree on which variant they emit.
pub(crate) fn decode_base64_lenient(input: &str) -> Result<Vec<u8>> {
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(input) {
            return Ok(bytes);
        }
    }
    Err(ServiceError::Credential("invalid base64 input".to_string()))
}

/// The collected client data a FIDO ceremony signs over.
#[derive(Debug, Deserialize)]
pub struct ClientData {
    #[serde(rename = "type")]
    pub ceremony: String,
    /// base64url encoding of the challenge bytes the authenticator saw.
    pub challenge: String,
    pub origin: String,
}

impl ClientData {
    /// Decode a base64 clientDataJSON blob.
    pub fn decode(client_data_json_b64: &str) -> Result<(Self, Vec<u8>)> {
        let raw = decode_base64_lenient(client_data_json_b64)?;
        let parsed: ClientData = serde_json::from_slice(&raw)
            .map_err(|e| ServiceError::Credential(format!("invalid clientDataJSON: {}", e)))?;
        Ok((parsed, raw))
    }

    /// Compare the ceremony's challenge with the expected challenge string.
    /// The expected value is the derived base64 digest; the authenticator
    /// signed over its UTF-8 bytes.
    pub fn challenge_matches(&self, expected: &str) -> bool {
        match decode_base64_lenient(&self.challenge) {
            Ok(bytes) => bytes == expected.as_bytes(),
            Err(_) => false,
        }
    }
}

/// Parsed authenticator data block.
#[derive(Debug)]
pub(crate) struct AuthenticatorData {
    pub flags: u8,
    pub counter: u32,
    /// COSE public key bytes, present when the AT flag is set.
    pub credential_public_key: Option<Vec<u8>>,
}

impl AuthenticatorData {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 37 {
            return Err(ServiceError::Credential(
                "authenticator data too short".to_string(),
            ));
        }
        let flags = bytes[32];
        let counter = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);

        let credential_public_key = if flags & FLAG_ATTESTED_CREDENTIAL_DATA != 0 {
            // aaguid (16) + credential id length (2) + credential id + COSE key
            if bytes.len() < 37 + 18 {
                return Err(ServiceError::Credential(
                    "attested credential data truncated".to_string(),
                ));
            }
            let id_len = u16::from_be_bytes([bytes[53], bytes[54]]) as usize;
            let key_offset = 55 + id_len;
            if bytes.len() <= key_offset {
                return Err(ServiceError::Credential(
                    "credential id overruns authenticator data".to_string(),
                ));
            }
            Some(bytes[key_offset..].to_vec())
        } else {
            None
        };

        Ok(Self {
            flags,
            counter,
            credential_public_key,
        })
    }

    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_variants() {
        // "hi~" encodes differently in standard vs url-safe
        assert_eq!(decode_base64_lenient("aGl+").unwrap(), b"hi~");
        assert_eq!(decode_base64_lenient("aGl-").unwrap(), b"hi~");
        assert!(decode_base64_lenient("!!not-base64!!").is_err());
    }

    #[test]
    fn test_client_data_decode_and_challenge_match() {
        let expected_challenge = "scQtSTIbz8wUVPwjG0nnUYuEAPqhHpLZxPD3twZ1t4Y=";
        let json = serde_json::json!({
            "type": "webauthn.create",
            "challenge": URL_SAFE_NO_PAD.encode(expected_challenge.as_bytes()),
            "origin": "https://pisp.example",
        });
        let b64 = STANDARD.encode(serde_json::to_vec(&json).unwrap());

        let (client_data, raw) = ClientData::decode(&b64).unwrap();
        assert_eq!(client_data.ceremony, "webauthn.create");
        assert_eq!(client_data.origin, "https://pisp.example");
        assert!(client_data.challenge_matches(expected_challenge));
        assert!(!client_data.challenge_matches("some-other-challenge"));
        assert!(!raw.is_empty());
    }

    #[test]
    fn test_authenticator_data_minimal() {
        let mut bytes = vec![0u8; 37];
        bytes[32] = FLAG_USER_PRESENT | FLAG_USER_VERIFIED;
        bytes[36] = 9; // counter, big endian
        let auth = AuthenticatorData::parse(&bytes).unwrap();
        assert!(auth.user_present());
        assert!(auth.user_verified());
        assert_eq!(auth.counter, 9);
        assert!(auth.credential_public_key.is_none());
    }

    #[test]
    fn test_authenticator_data_too_short() {
        assert!(AuthenticatorData::parse(&[0u8; 10]).is_err());
    }
}
