//! Document encryption, payload signing and request authentication.
//!
//! Encrypted documents travel as base64 of a JSON [`EncryptedEnvelope`]:
//!
//! | Level      | Scheme                                                     |
//! |------------|------------------------------------------------------------|
//! | `STANDARD` | AES-128-GCM, key = SHA-256(encryption key)[..16]           |
//! | `HIGH`     | AES-256-GCM, key = SHA-256(encryption key)                 |
//! | `MAXIMUM`  | fresh AES-256-GCM data key sealed with ephemeral ECDH      |
//!
//! The document id is bound into every ciphertext as associated data.

use aes_gcm::{
    Aes128Gcm, Aes256Gcm,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng, generic_array::typenum::Unsigned},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use k256::{
    PublicKey, SecretKey,
    ecdsa::{
        Signature, SigningKey, VerifyingKey,
        signature::{RandomizedSigner, Signer, Verifier},
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use taxpoynt_common::{SecurityContext, SecurityLevel};

use crate::error::SystemError;

const KEY_WRAP_AAD: &[u8] = b"taxpoynt-key-wrap";

/// Self-describing encrypted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub algorithm: String,
    pub nonce: String,
    pub tag: String,
    pub ciphertext: String,
    /// Data key sealed for the recipient, `MAXIMUM` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_key: Option<SealedKey>,
}

/// AES-256-GCM data key wrapped under an ECDH-derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Compressed SEC1 ephemeral public key.
    pub ephemeral_public_key: String,
    pub nonce: String,
    pub tag: String,
    pub ciphertext: String,
}

struct Sealed {
    nonce: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn seal<C>(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Sealed, SystemError>
where
    C: AeadInPlace + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|e| SystemError::Encryption(e.to_string()))?;
    let nonce = C::generate_nonce(&mut OsRng);
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|e| SystemError::Encryption(e.to_string()))?;

    Ok(Sealed {
        nonce: nonce.to_vec(),
        tag: tag.to_vec(),
        ciphertext: buffer,
    })
}

fn open<C>(key: &[u8], aad: &[u8], sealed: &Sealed) -> Result<Vec<u8>, SystemError>
where
    C: AeadInPlace + KeyInit,
{
    if sealed.nonce.len() != C::NonceSize::USIZE || sealed.tag.len() != C::TagSize::USIZE {
        return Err(SystemError::Encryption(
            "Malformed envelope: bad nonce or tag length".to_string(),
        ));
    }

    let cipher = C::new_from_slice(key).map_err(|e| SystemError::Encryption(e.to_string()))?;
    let nonce = aes_gcm::aead::Nonce::<C>::from_slice(&sealed.nonce);
    let tag = aes_gcm::aead::Tag::<C>::from_slice(&sealed.tag);
    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(nonce, aad, &mut buffer, tag)
        .map_err(|e| SystemError::Encryption(e.to_string()))?;

    Ok(buffer)
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    Sha256::digest(secret).into()
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>, SystemError> {
    BASE64
        .decode(value)
        .map_err(|e| SystemError::Encryption(format!("Malformed envelope {field}: {e}")))
}

fn ecdh_wrap_key(shared_secret: &[u8], ephemeral_public: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(shared_secret)
        .chain_update(ephemeral_public)
        .finalize()
        .into()
}

/// Encrypt `document` at `level`, returning the encoded envelope.
///
/// # Errors
///
/// Fails if the document cannot be serialized, if `MAXIMUM` is requested
/// without a valid recipient public key, or if the cipher rejects the key.
pub fn encrypt_document(
    document: &Value,
    level: SecurityLevel,
    security: &SecurityContext,
    aad: &[u8],
) -> Result<String, SystemError> {
    let plaintext = serde_json::to_vec(document)?;
    let key = derive_key(&security.encryption_key);

    let envelope = match level {
        SecurityLevel::Standard => {
            let sealed = seal::<Aes128Gcm>(&key[..16], aad, &plaintext)?;
            envelope("AES-128-GCM", &sealed, None)
        }
        SecurityLevel::High => {
            let sealed = seal::<Aes256Gcm>(&key, aad, &plaintext)?;
            envelope("AES-256-GCM", &sealed, None)
        }
        SecurityLevel::Maximum => {
            let recipient = security.recipient_public_key.as_deref().ok_or_else(|| {
                SystemError::Encryption(
                    "MAXIMUM security requires a recipient public key".to_string(),
                )
            })?;
            let recipient = PublicKey::from_sec1_bytes(recipient)
                .map_err(|e| SystemError::Encryption(format!("Invalid recipient key: {e}")))?;

            let data_key = Aes256Gcm::generate_key(OsRng);
            let sealed = seal::<Aes256Gcm>(&data_key, aad, &plaintext)?;

            let ephemeral = k256::ecdh::EphemeralSecret::random(&mut OsRng);
            let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
            let shared = ephemeral.diffie_hellman(&recipient);
            let wrap_key = ecdh_wrap_key(shared.raw_secret_bytes(), ephemeral_public.as_bytes());
            let wrapped = seal::<Aes256Gcm>(&wrap_key, KEY_WRAP_AAD, &data_key)?;

            envelope(
                "ECDH-SECP256K1+AES-256-GCM",
                &sealed,
                Some(SealedKey {
                    ephemeral_public_key: BASE64.encode(ephemeral_public.as_bytes()),
                    nonce: BASE64.encode(&wrapped.nonce),
                    tag: BASE64.encode(&wrapped.tag),
                    ciphertext: BASE64.encode(&wrapped.ciphertext),
                }),
            )
        }
    };

    Ok(BASE64.encode(serde_json::to_vec(&envelope)?))
}

fn envelope(algorithm: &str, sealed: &Sealed, sealed_key: Option<SealedKey>) -> EncryptedEnvelope {
    EncryptedEnvelope {
        algorithm: algorithm.to_string(),
        nonce: BASE64.encode(&sealed.nonce),
        tag: BASE64.encode(&sealed.tag),
        ciphertext: BASE64.encode(&sealed.ciphertext),
        sealed_key,
    }
}

/// Recipient-side decryption of an envelope produced by [`encrypt_document`].
///
/// `recipient_secret` is the SEC1/raw secp256k1 scalar matching the public key
/// the sender used, and is only consulted for `MAXIMUM` envelopes.
///
/// # Errors
///
/// Fails on malformed envelopes, unknown algorithms, wrong keys or tampering.
pub fn open_envelope(
    encrypted_data: &str,
    aad: &[u8],
    encryption_key: &[u8],
    recipient_secret: Option<&[u8]>,
) -> Result<Vec<u8>, SystemError> {
    let raw = decode("body", encrypted_data)?;
    let envelope: EncryptedEnvelope = serde_json::from_slice(&raw)?;
    let sealed = Sealed {
        nonce: decode("nonce", &envelope.nonce)?,
        tag: decode("tag", &envelope.tag)?,
        ciphertext: decode("ciphertext", &envelope.ciphertext)?,
    };
    let key = derive_key(encryption_key);

    match (envelope.algorithm.as_str(), envelope.sealed_key) {
        ("AES-128-GCM", None) => open::<Aes128Gcm>(&key[..16], aad, &sealed),
        ("AES-256-GCM", None) => open::<Aes256Gcm>(&key, aad, &sealed),
        ("ECDH-SECP256K1+AES-256-GCM", Some(sealed_key)) => {
            let secret = recipient_secret.ok_or_else(|| {
                SystemError::Encryption("Recipient secret key required".to_string())
            })?;
            let secret = SecretKey::from_slice(secret)
                .map_err(|e| SystemError::Encryption(format!("Invalid recipient secret: {e}")))?;
            let ephemeral_bytes = decode("ephemeral key", &sealed_key.ephemeral_public_key)?;
            let ephemeral = PublicKey::from_sec1_bytes(&ephemeral_bytes)
                .map_err(|e| SystemError::Encryption(format!("Invalid ephemeral key: {e}")))?;
            let shared =
                k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
            let wrap_key = ecdh_wrap_key(shared.raw_secret_bytes(), &ephemeral_bytes);

            let wrapped = Sealed {
                nonce: decode("key nonce", &sealed_key.nonce)?,
                tag: decode("key tag", &sealed_key.tag)?,
                ciphertext: decode("key ciphertext", &sealed_key.ciphertext)?,
            };
            let data_key = zeroize::Zeroizing::new(open::<Aes256Gcm>(
                &wrap_key,
                KEY_WRAP_AAD,
                &wrapped,
            )?);
            open::<Aes256Gcm>(&data_key, aad, &sealed)
        }
        (algorithm, _) => Err(SystemError::Encryption(format!(
            "Unsupported envelope algorithm: {algorithm}"
        ))),
    }
}

/// Canonical bytes covered by the payload signature.
///
/// `serde_json` maps are ordered, so the keys serialize alphabetically.
fn signing_message(
    encrypted_data: &str,
    timestamp: i64,
    client_id: &str,
    level: SecurityLevel,
) -> Result<Vec<u8>, SystemError> {
    Ok(serde_json::to_vec(&json!({
        "client_id": client_id,
        "encrypted_data": encrypted_data,
        "security_level": level.as_str(),
        "timestamp": timestamp,
    }))?)
}

/// ECDSA/secp256k1 signature over the encrypted payload, base64 encoded.
///
/// `MAXIMUM` signs with fresh randomness mixed into the nonce; lower levels use
/// deterministic RFC 6979 nonces.
///
/// # Errors
///
/// Fails if the signing key is not a valid secp256k1 scalar.
pub fn sign_payload(
    encrypted_data: &str,
    timestamp: i64,
    security: &SecurityContext,
    level: SecurityLevel,
) -> Result<String, SystemError> {
    let key = SigningKey::from_slice(&security.signing_key)
        .map_err(|e| SystemError::Signing(format!("Invalid signing key: {e}")))?;
    let message = signing_message(encrypted_data, timestamp, &security.client_id, level)?;

    let signature: Signature = match level {
        SecurityLevel::Maximum => key.sign_with_rng(&mut OsRng, &message),
        SecurityLevel::Standard | SecurityLevel::High => key.sign(&message),
    };

    Ok(BASE64.encode(signature.to_bytes()))
}

/// Check a signature produced by [`sign_payload`] against the signer's
/// SEC1-encoded public key.
pub fn verify_payload_signature(
    encrypted_data: &str,
    timestamp: i64,
    client_id: &str,
    level: SecurityLevel,
    signature: &str,
    public_key: &[u8],
) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    let Ok(bytes) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    let Ok(message) = signing_message(encrypted_data, timestamp, client_id, level) else {
        return false;
    };

    key.verify(&message, &signature).is_ok()
}

/// `X-Signature` header: hex HMAC-SHA256 over body, timestamp and request id.
///
/// # Errors
///
/// Fails only if the HMAC cannot be keyed.
pub fn request_signature(
    api_key: &str,
    body: &[u8],
    timestamp: i64,
    request_id: &str,
) -> Result<String, SystemError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(api_key.as_bytes())
        .map_err(|e| SystemError::Signing(e.to_string()))?;
    mac.update(body);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(request_id.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}
