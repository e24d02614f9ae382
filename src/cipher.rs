//! AES-256-GCM sealing of individual chunks.
//!
//! Every chunk travels as `nonce(16) || tag(16) || ciphertext`, with a fresh
//! random nonce per encryption. Ciphertext length equals plaintext length, so
//! a wire packet is always exactly 32 bytes longer than the chunk it carries.

use crate::error::{Result, TunnelError};
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::Aes256;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// Bytes a sealed packet adds on top of its plaintext.
pub const PACKET_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// AES-256-GCM with a 16-byte nonce, matching the wire layout.
type TunnelAead = AesGcm<Aes256, U16>;

/// A sealed chunk split into its wire components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Packet {
    /// Split a raw wire packet as `raw[0..16] || raw[16..32] || raw[32..]`.
    /// Anything shorter than 33 bytes cannot hold a chunk.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() <= PACKET_OVERHEAD {
            return Err(TunnelError::Format(format!(
                "packet is {} bytes, need at least {}",
                raw.len(),
                PACKET_OVERHEAD + 1
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        let mut tag = [0u8; TAG_LEN];
        nonce.copy_from_slice(&raw[..NONCE_LEN]);
        tag.copy_from_slice(&raw[NONCE_LEN..PACKET_OVERHEAD]);
        Ok(Self {
            nonce,
            tag,
            ciphertext: raw[PACKET_OVERHEAD..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(PACKET_OVERHEAD + self.ciphertext.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.tag);
        raw.extend_from_slice(&self.ciphertext);
        raw
    }
}

/// Chunk cipher over the pre-shared key.
pub struct Cipher {
    aead: TunnelAead,
}

impl Cipher {
    /// Key length is enforced by the type; wrong lengths are caught by
    /// config validation long before this constructor runs.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: TunnelAead::new(GenericArray::from_slice(key)),
        }
    }

    /// Seal a chunk into its wire packet with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut ciphertext = plaintext.to_vec();
        let tag = self
            .aead
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut ciphertext)
            .map_err(|_| TunnelError::AuthFail)?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok(Packet {
            nonce,
            tag: tag_bytes,
            ciphertext,
        }
        .to_bytes())
    }

    /// Open a packet, verifying the tag. Any mismatch, wherever the
    /// corruption sits, surfaces as the same `AuthFail`.
    pub fn open(&self, packet: &Packet) -> Result<Vec<u8>> {
        let mut plaintext = packet.ciphertext.clone();
        self.aead
            .decrypt_in_place_detached(
                GenericArray::from_slice(&packet.nonce),
                b"",
                &mut plaintext,
                GenericArray::from_slice(&packet.tag),
            )
            .map_err(|_| TunnelError::AuthFail)?;
        Ok(plaintext)
    }
}
