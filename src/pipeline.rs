//! On-wire transformations applied to segment value payloads.
//!
//! Encoding compresses then encrypts; decoding runs the inverse in
//! reverse order. The transformer is built once from the store
//! configuration and never changes for the life of the store.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};

use crate::error::{Error, Result};

const AES_BLOCK_SIZE: usize = 16;

/// A block compressor over raw byte payloads.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// A symmetric cipher over raw byte payloads.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, secret: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Snappy raw-block compression, no framing.
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Pipeline(format!("snappy compress: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Pipeline(format!("snappy decompress: {e}")))
    }
}

/// AES in CBC mode with PKCS#7 padding. Every encryption draws a fresh
/// random IV; the output is `IV || ciphertext`.
pub struct AesCbcEncryptor;

impl Encryptor for AesCbcEncryptor {
    fn encrypt(&self, secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = match secret.len() {
            16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(secret, &iv)
                .map_err(|e| Error::Pipeline(format!("aes-128 init: {e}")))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(secret, &iv)
                .map_err(|e| Error::Pipeline(format!("aes-192 init: {e}")))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(secret, &iv)
                .map_err(|e| Error::Pipeline(format!("aes-256 init: {e}")))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            n => return Err(Error::Pipeline(format!("unsupported AES key length {n}"))),
        };

        let mut out = Vec::with_capacity(AES_BLOCK_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, secret: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < AES_BLOCK_SIZE {
            return Err(Error::Pipeline(
                "ciphertext shorter than one AES block".to_string(),
            ));
        }
        let (iv, body) = ciphertext.split_at(AES_BLOCK_SIZE);

        let plaintext = match secret.len() {
            16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(secret, iv)
                .map_err(|e| Error::Pipeline(format!("aes-128 init: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(body),
            24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(secret, iv)
                .map_err(|e| Error::Pipeline(format!("aes-192 init: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(body),
            32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(secret, iv)
                .map_err(|e| Error::Pipeline(format!("aes-256 init: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(body),
            n => return Err(Error::Pipeline(format!("unsupported AES key length {n}"))),
        };

        plaintext.map_err(|e| Error::Pipeline(format!("aes unpad: {e}")))
    }
}

/// The value pipeline: optional compression and optional encryption,
/// fixed at construction.
pub struct Transformer {
    compressor: Option<Box<dyn Compressor>>,
    encryptor: Option<Box<dyn Encryptor>>,
    secret: Vec<u8>,
}

impl Transformer {
    /// A pass-through transformer.
    pub fn new() -> Self {
        Self {
            compressor: None,
            encryptor: None,
            secret: Vec::new(),
        }
    }

    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Attach an encryptor. The secret must be a valid AES key length
    /// (16, 24 or 32 bytes).
    pub fn with_encryptor(mut self, encryptor: Box<dyn Encryptor>, secret: Vec<u8>) -> Result<Self> {
        if !matches!(secret.len(), 16 | 24 | 32) {
            return Err(Error::Config(format!(
                "secret key must be 16, 24 or 32 bytes, got {}",
                secret.len()
            )));
        }
        self.secret = secret;
        self.encryptor = Some(encryptor);
        Ok(self)
    }

    pub fn compression_enabled(&self) -> bool {
        self.compressor.is_some()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Compress, then encrypt.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut data = std::borrow::Cow::Borrowed(data);
        if let Some(compressor) = &self.compressor {
            data = std::borrow::Cow::Owned(compressor.compress(&data)?);
        }
        if let Some(encryptor) = &self.encryptor {
            data = std::borrow::Cow::Owned(encryptor.encrypt(&self.secret, &data)?);
        }
        Ok(data.into_owned())
    }

    /// Decrypt, then decompress.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut data = std::borrow::Cow::Borrowed(data);
        if let Some(encryptor) = &self.encryptor {
            data = std::borrow::Cow::Owned(encryptor.decrypt(&self.secret, &data)?);
        }
        if let Some(compressor) = &self.compressor {
            data = std::borrow::Cow::Owned(compressor.decompress(&data)?);
        }
        Ok(data.into_owned())
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}
