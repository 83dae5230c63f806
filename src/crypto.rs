//! ESP payload protection.
//!
//! A tunnel holds one [`EspCrypto`] per direction. The provided
//! implementation is AES-CBC with HMAC-SHA2-256-128 (RFC 4303 / RFC 4868),
//! the suite negotiated by the IKE side of the gateway.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::{constant_time, hmac};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, TunnelError};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, also the CBC IV length.
pub const AES_BLOCK_LEN: usize = 16;

/// HMAC-SHA2-256 truncated to 128 bits.
pub const ICV_LEN: usize = 16;

/// One direction of an ESP security association.
pub trait EspCrypto: Send + Sync {
    /// Encrypt `plain`, declaring `next_header` as the protected protocol.
    /// The result is the ESP payload: IV followed by ciphertext.
    fn encrypt(&self, plain: &[u8], next_header: u8) -> Result<Vec<u8>>;

    /// Reverse of [`EspCrypto::encrypt`]: returns the plaintext and the
    /// declared next-header value.
    fn decrypt(&self, payload: &[u8]) -> Result<(Vec<u8>, u8)>;

    /// Compute the integrity tag over `buffer` and append it.
    fn append_checksum(&self, buffer: &mut Vec<u8>);

    /// Check the trailing integrity tag of a complete ESP datagram.
    fn verify_checksum(&self, buffer: &[u8]) -> bool;

    /// Length of the trailing integrity tag.
    fn checksum_len(&self) -> usize;
}

enum CipherKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

/// AES-CBC encryption with an HMAC-SHA2-256-128 integrity check value.
pub struct AesCbcHmacSha256 {
    cipher_key: CipherKey,
    integrity_key: hmac::Key,
    rng: SystemRandom,
}

impl AesCbcHmacSha256 {
    /// `encryption_key` must be 16 or 32 bytes; `integrity_key` is the
    /// 32 byte SK_a for this direction.
    pub fn new(encryption_key: &[u8], integrity_key: &[u8]) -> Result<Self> {
        let cipher_key = match encryption_key.len() {
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(encryption_key);
                CipherKey::Aes128(key)
            }
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(encryption_key);
                CipherKey::Aes256(key)
            }
            _ => return Err(TunnelError::InvalidKey("AES key must be 16 or 32 bytes")),
        };
        if integrity_key.len() != 32 {
            return Err(TunnelError::InvalidKey("HMAC-SHA2-256 key must be 32 bytes"));
        }

        Ok(Self {
            cipher_key,
            integrity_key: hmac::Key::new(hmac::HMAC_SHA256, integrity_key),
            rng: SystemRandom::new(),
        })
    }

    fn tag(&self, data: &[u8]) -> [u8; ICV_LEN] {
        let full = hmac::sign(&self.integrity_key, data);
        let mut tag = [0u8; ICV_LEN];
        tag.copy_from_slice(&full.as_ref()[..ICV_LEN]);
        tag
    }
}

impl EspCrypto for AesCbcHmacSha256 {
    fn encrypt(&self, plain: &[u8], next_header: u8) -> Result<Vec<u8>> {
        // Payload | Padding (1, 2, 3, ...) | Pad Length | Next Header
        let pad_len = padding_len(plain.len(), AES_BLOCK_LEN);
        let mut body = Vec::with_capacity(plain.len() + pad_len + 2);
        body.extend_from_slice(plain);
        body.extend((1..=pad_len).map(|i| i as u8));
        body.push(pad_len as u8);
        body.push(next_header);

        let mut iv = [0u8; AES_BLOCK_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| TunnelError::Encrypt("IV generation failed"))?;

        let ciphertext = match &self.cipher_key {
            CipherKey::Aes128(key) => Aes128CbcEnc::new_from_slices(key, &iv)
                .map_err(|_| TunnelError::Encrypt("bad key or IV length"))?
                .encrypt_padded_vec_mut::<NoPadding>(&body),
            CipherKey::Aes256(key) => Aes256CbcEnc::new_from_slices(key, &iv)
                .map_err(|_| TunnelError::Encrypt("bad key or IV length"))?
                .encrypt_padded_vec_mut::<NoPadding>(&body),
        };

        let mut payload = Vec::with_capacity(AES_BLOCK_LEN + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    fn decrypt(&self, payload: &[u8]) -> Result<(Vec<u8>, u8)> {
        if payload.len() < 2 * AES_BLOCK_LEN {
            return Err(TunnelError::Decrypt("payload shorter than IV and one block"));
        }
        let (iv, ciphertext) = payload.split_at(AES_BLOCK_LEN);
        if ciphertext.len() % AES_BLOCK_LEN != 0 {
            return Err(TunnelError::Decrypt("ciphertext is not block aligned"));
        }

        let plain = match &self.cipher_key {
            CipherKey::Aes128(key) => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|_| TunnelError::Decrypt("bad key or IV length"))?
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
            CipherKey::Aes256(key) => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| TunnelError::Decrypt("bad key or IV length"))?
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        }
        .map_err(|_| TunnelError::Decrypt("unpad failed"))?;

        let next_header = plain[plain.len() - 1];
        let pad_len = plain[plain.len() - 2] as usize;
        if pad_len + 2 > plain.len() {
            return Err(TunnelError::Decrypt("pad length exceeds payload"));
        }
        let payload_len = plain.len() - pad_len - 2;

        let mut plain = plain;
        plain.truncate(payload_len);
        Ok((plain, next_header))
    }

    fn append_checksum(&self, buffer: &mut Vec<u8>) {
        let tag = self.tag(buffer);
        buffer.extend_from_slice(&tag);
    }

    #[allow(deprecated)]
    fn verify_checksum(&self, buffer: &[u8]) -> bool {
        if buffer.len() < ICV_LEN {
            return false;
        }
        let (data, received) = buffer.split_at(buffer.len() - ICV_LEN);
        let expected = self.tag(data);
        constant_time::verify_slices_are_equal(&expected, received).is_ok()
    }

    fn checksum_len(&self) -> usize {
        ICV_LEN
    }
}

/// Padding needed so that payload + trailer fills whole cipher blocks.
pub fn padding_len(payload_len: usize, block_size: usize) -> usize {
    let remainder = (payload_len + 2) % block_size;
    if remainder == 0 {
        0
    } else {
        block_size - remainder
    }
}
