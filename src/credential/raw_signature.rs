//! Raw Signature Verification
//!
//! Server-to-server challenge/response verification for participants that
//! sign the derived challenge directly instead of going through a FIDO
//! ceremony. Supported keys: ECDSA secp256k1 and RSA-2048, both as SPKI PEM.
//!
//! Malformed key or signature material is an error; a well-formed signature
//! that simply does not match returns `Ok(false)`.

use k256::ecdsa::signature::Verifier as _;
use k256::pkcs8::DecodePublicKey as _;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::signature::Verifier as _;
use sha2::Sha256;

use super::decode_base64_lenient;
use crate::errors::{Result, ServiceError};

fn parse_secp256k1_signature(bytes: &[u8]) -> Result<k256::ecdsa::Signature> {
    // DER is the common encoding; accept fixed-size r||s as well.
    if let Ok(sig) = k256::ecdsa::Signature::from_der(bytes) {
        return Ok(sig);
    }
    k256::ecdsa::Signature::from_slice(bytes)
        .map_err(|e| ServiceError::Credential(format!("invalid secp256k1 signature: {}", e)))
}

/// Verify a signature over the challenge string's UTF-8 bytes.
pub fn verify_raw_signature(
    challenge: &str,
    signature_b64: &str,
    public_key_pem: &str,
) -> Result<bool> {
    let signature = decode_base64_lenient(signature_b64)?;
    let message = challenge.as_bytes();

    if let Ok(key) = k256::ecdsa::VerifyingKey::from_public_key_pem(public_key_pem) {
        let sig = parse_secp256k1_signature(&signature)?;
        return Ok(key.verify(message, &sig).is_ok());
    }
    if let Ok(key) = rsa::RsaPublicKey::from_public_key_pem(public_key_pem) {
        let key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
        let sig = rsa::pkcs1v15::Signature::try_from(signature.as_slice())
            .map_err(|e| ServiceError::Credential(format!("invalid RSA signature: {}", e)))?;
        return Ok(key.verify(message, &sig).is_ok());
    }

    Err(ServiceError::Credential(
        "public key is neither secp256k1 nor RSA".to_string(),
    ))
}
