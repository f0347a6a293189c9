//! Client-side encryption between a file's byte stream and its sink.
//!
//! Stage order is fixed: plaintext stream → [`CipherSink`] → backend sink.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::EncryptionConfig;
use crate::store::{RemoteReceipt, UploadSink};
use crate::{UploadError, UploadResult};

/// Plaintext bytes per encrypted frame
pub const FRAME_SIZE: usize = 64 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherAlgorithm {
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl std::fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CipherAlgorithm {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            other => Err(UploadError::config(format!("unsupported encryption algorithm: {}", other))),
        }
    }
}

/// Incremental byte transform applied to one file
pub trait ChunkCipher: Send {
    /// Bytes written ahead of the first transformed chunk
    fn header(&mut self) -> Option<Bytes> {
        None
    }

    /// Transform one plaintext chunk. May buffer and return nothing.
    fn update(&mut self, chunk: Bytes) -> UploadResult<Bytes>;

    /// Flush whatever is still buffered
    fn finish(&mut self) -> UploadResult<Bytes>;
}

/// Builds one cipher per file
pub trait CipherFactory: Send + Sync {
    fn create(&self, config: &EncryptionConfig) -> UploadResult<Box<dyn ChunkCipher>>;
}

/// Builds the ciphers named by [`CipherAlgorithm`]
#[derive(Debug, Clone, Default)]
pub struct DefaultCipherFactory;

impl CipherFactory for DefaultCipherFactory {
    fn create(&self, config: &EncryptionConfig) -> UploadResult<Box<dyn ChunkCipher>> {
        let key = derive_key(&config.key)?;
        match config.algorithm {
            CipherAlgorithm::ChaCha20Poly1305 => Ok(Box::new(FramedChaCha20Poly1305::new(key))),
        }
    }
}

/// Turn configured key material into a 256-bit key.
///
/// `base64:`-prefixed values must decode to exactly 32 bytes; anything else
/// is treated as a passphrase and hashed with SHA-256.
pub fn derive_key(material: &str) -> UploadResult<[u8; 32]> {
    if let Some(encoded) = material.strip_prefix("base64:") {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| UploadError::config(format!("invalid base64 encryption key: {}", e)))?;
        if raw.len() != 32 {
            return Err(UploadError::config(format!(
                "encryption key must be 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        return Ok(key);
    }

    let digest = Sha256::digest(material.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}

/// ChaCha20-Poly1305 over fixed-size frames.
///
/// Every frame is `nonce ‖ ciphertext ‖ tag`; all frames but the last carry
/// exactly [`FRAME_SIZE`] plaintext bytes.
pub struct FramedChaCha20Poly1305 {
    cipher: ChaCha20Poly1305,
    pending: BytesMut,
}

impl FramedChaCha20Poly1305 {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&Key::from(key)),
            pending: BytesMut::with_capacity(FRAME_SIZE),
        }
    }

    /// Ciphertext length for `plaintext_len` input bytes
    pub fn ciphertext_len(plaintext_len: u64) -> u64 {
        let frames = plaintext_len.div_ceil(FRAME_SIZE as u64);
        plaintext_len + frames * (NONCE_LEN + TAG_LEN) as u64
    }

    fn seal(&self, plaintext: &[u8], out: &mut BytesMut) -> UploadResult<()> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| UploadError::cipher(e.to_string()))?;
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl ChunkCipher for FramedChaCha20Poly1305 {
    fn update(&mut self, chunk: Bytes) -> UploadResult<Bytes> {
        self.pending.extend_from_slice(&chunk);

        let mut out = BytesMut::new();
        while self.pending.len() >= FRAME_SIZE {
            let frame = self.pending.split_to(FRAME_SIZE);
            self.seal(&frame, &mut out)?;
        }
        Ok(out.freeze())
    }

    fn finish(&mut self) -> UploadResult<Bytes> {
        let mut out = BytesMut::new();
        if !self.pending.is_empty() {
            let frame = self.pending.split();
            self.seal(&frame, &mut out)?;
        }
        Ok(out.freeze())
    }
}

/// Sink that transforms bytes before delegating to another sink.
///
/// Exposes the same [`UploadSink`] interface as the sink it wraps.
pub struct CipherSink {
    inner: Box<dyn UploadSink>,
    cipher: Box<dyn ChunkCipher>,
    header_sent: bool,
}

impl CipherSink {
    pub fn new(inner: Box<dyn UploadSink>, cipher: Box<dyn ChunkCipher>) -> Self {
        Self {
            inner,
            cipher,
            header_sent: false,
        }
    }

    async fn send_header(&mut self) -> UploadResult<()> {
        if !self.header_sent {
            self.header_sent = true;
            if let Some(header) = self.cipher.header() {
                self.inner.write(header).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UploadSink for CipherSink {
    async fn write(&mut self, chunk: Bytes) -> UploadResult<()> {
        self.send_header().await?;
        let out = self.cipher.update(chunk)?;
        if !out.is_empty() {
            self.inner.write(out).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> UploadResult<RemoteReceipt> {
        self.send_header().await?;
        let tail = self.cipher.finish()?;
        if !tail.is_empty() {
            self.inner.write(tail).await?;
        }
        self.inner.finish().await
    }

    async fn abort(self: Box<Self>) {
        self.inner.abort().await
    }
}

/// Put a cipher stage in front of `sink`.
///
/// The sink is aborted when no cipher can be built for `encryption`.
pub async fn wrap(
    sink: Box<dyn UploadSink>,
    encryption: &EncryptionConfig,
    factory: &dyn CipherFactory,
) -> UploadResult<Box<dyn UploadSink>> {
    match factory.create(encryption) {
        Ok(cipher) => Ok(Box::new(CipherSink::new(sink, cipher))),
        Err(e) => {
            sink.abort().await;
            Err(e)
        }
    }
}
