//! Frame codec: turns envelopes into the text frames carried by the transport.
//!
//! Two encodings exist, matching the two deployment modes of the relay:
//! - `Sealed`: JSON envelope encrypted with AES-256-GCM under a key derived
//!   from the room id. The relay only ever sees `base64(nonce ‖ ciphertext)`.
//! - `Plain`: the JSON envelope itself, for relays that terminate encryption.

use crate::message::Envelope;
use crate::room::RoomId;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

const KEY_SALT: &[u8] = b"collab-frame-key:v1";
const KEY_INFO: &[u8] = b"aes-256-gcm";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed (wrong room key or tampered frame)")]
    Decrypt,

    #[error("Invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Symmetric cipher bound to one room.
#[derive(Clone)]
pub struct RoomCipher {
    cipher: Aes256Gcm,
}

impl RoomCipher {
    /// Derive the room key with HKDF-SHA256 over the room id.
    pub fn for_room(room: &RoomId) -> Result<Self> {
        Self::from_secret(room.as_str().as_bytes())
    }

    /// Derive a key from arbitrary shared input keying material.
    pub fn from_secret(ikm: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), ikm);
        let mut okm = [0u8; 32];
        hk.expand(KEY_INFO, &mut okm)
            .map_err(|_| CodecError::KeyDerivation)?;
        let cipher = Aes256Gcm::new_from_slice(&okm).map_err(|_| CodecError::KeyDerivation)?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext`, returning `base64(nonce ‖ ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::Encrypt)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    pub fn open(&self, frame: &str) -> Result<Vec<u8>> {
        let raw = STANDARD.decode(frame.trim())?;
        if raw.len() <= NONCE_LEN {
            return Err(CodecError::TooShort(raw.len()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Decrypt)
    }
}

impl std::fmt::Debug for RoomCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomCipher(..)")
    }
}

/// How envelopes are framed on the wire.
#[derive(Debug, Clone)]
pub enum FrameCodec {
    Sealed(RoomCipher),
    Plain,
}

impl FrameCodec {
    /// Sealed codec keyed for `room`.
    pub fn sealed(room: &RoomId) -> Result<Self> {
        Ok(FrameCodec::Sealed(RoomCipher::for_room(room)?))
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<String> {
        let json = envelope.to_json()?;
        match self {
            FrameCodec::Sealed(cipher) => cipher.seal(json.as_bytes()),
            FrameCodec::Plain => Ok(json),
        }
    }

    pub fn decode(&self, frame: &str) -> Result<Envelope> {
        match self {
            FrameCodec::Sealed(cipher) => {
                let plaintext = cipher.open(frame)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            FrameCodec::Plain => Ok(Envelope::from_json(frame)?),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, FrameCodec::Sealed(_))
    }
}
