use aes_gcm::aead::consts::U16;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::types::CapturedHeaders;

/// AES-256-GCM with the 16-byte nonce used by the stored header format.
type HeaderAead = AesGcm<Aes256, U16>;

type HmacSha256 = Hmac<Sha256>;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const HEADER_AAD: &[u8] = b"webhook-relay.headers";

/// Hex-encoded SHA-256 of the raw payload bytes.
pub fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Compute the `sha256=<hex>` signature header value for a payload.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| <HmacSha256 as Mac>::new_from_slice(b"default").expect("hmac"));
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature header against the raw payload bytes.
///
/// Comparison is constant-time via `Mac::verify_slice`; the payload is
/// never re-parsed before hashing.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_header: &str) -> bool {
    let Some(signature_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| <HmacSha256 as Mac>::new_from_slice(b"default").expect("hmac"));
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Serialized form of an encrypted header bundle. All fields hex-encoded.
#[derive(Debug, Serialize, Deserialize)]
struct HeaderBundle {
    encrypted: String,
    iv: String,
    tag: String,
    salt: String,
}

/// Encrypts captured request headers before they reach the store.
///
/// A fresh salt is drawn per bundle; the key is derived from the master
/// secret with PBKDF2-HMAC-SHA-256 so that rotating the master secret
/// invalidates old bundles without any shared key material on disk.
#[derive(Clone)]
pub struct HeaderCipher {
    master_secret: String,
}

impl HeaderCipher {
    pub fn new(master_secret: impl Into<String>) -> Self {
        Self {
            master_secret: master_secret.into(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.master_secret.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        key
    }

    /// Encrypt a header map into the serialized `{encrypted, iv, tag, salt}`
    /// bundle.
    pub fn seal(&self, headers: &CapturedHeaders) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(headers).map_err(|_| CryptoError::Encrypt)?;

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let cipher = HeaderAead::new_from_slice(&key).map_err(|_| CryptoError::Encrypt)?;
        let nonce = Nonce::<U16>::from_slice(&iv);

        let mut ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: HEADER_AAD,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        // The AEAD output is ciphertext || tag; the stored format keeps the
        // tag as its own field.
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        let bundle = HeaderBundle {
            encrypted: hex::encode(&ciphertext),
            iv: hex::encode(iv),
            tag: hex::encode(&tag),
            salt: hex::encode(salt),
        };

        serde_json::to_string(&bundle).map_err(|_| CryptoError::Encrypt)
    }

    /// Decrypt a bundle produced by [`HeaderCipher::seal`].
    pub fn open(&self, sealed: &str) -> Result<CapturedHeaders, CryptoError> {
        let bundle: HeaderBundle = serde_json::from_str(sealed)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;

        let ciphertext =
            hex::decode(&bundle.encrypted).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let iv = hex::decode(&bundle.iv).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let tag = hex::decode(&bundle.tag).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let salt = hex::decode(&bundle.salt).map_err(|e| CryptoError::Malformed(e.to_string()))?;

        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed(
                "unexpected iv or tag length".to_string(),
            ));
        }

        let key = self.derive_key(&salt);
        let cipher = HeaderAead::new_from_slice(&key).map_err(|_| CryptoError::Decrypt)?;
        let nonce = Nonce::<U16>::from_slice(&iv);

        let mut sealed_bytes = ciphertext;
        sealed_bytes.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed_bytes,
                    aad: HEADER_AAD,
                },
            )
            .map_err(|_| CryptoError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Decrypt)
    }
}
