//! Streaming compress→encrypt envelope for encrypted jobs.
//!
//! The envelope is framed: a fixed header carrying the algorithm ids, a
//! random per-file salt and a nonce seed, then one sealed frame with the
//! original filename, then sealed frames of compressed content chunks. A
//! 1 MiB working buffer bounds memory regardless of file size.

use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};

use domain::model::vo::config::{Cipher, Compression, EncryptionConfig, HashAlgorithm};
use domain::SyncError;

const MAGIC: &[u8; 4] = b"DRVE";
const VERSION: u8 = 1;
const CHUNK_SIZE: usize = 1024 * 1024;
const SALT_LEN: usize = 16;
const SEED_LEN: usize = 8;

#[derive(Debug)]
pub struct CryptoPipeline {
    compression: Compression,
    cipher: Cipher,
    key_hash: HashAlgorithm,
    password: String,
    encrypt_names: bool,
}

enum SealCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl SealCipher {
    fn new(cipher: Cipher, key: &[u8; 32]) -> Self {
        match cipher {
            Cipher::Aes256Gcm => Self::Aes(Box::new(Aes256Gcm::new(key.into()))),
            Cipher::ChaCha20Poly1305 => Self::ChaCha(Box::new(ChaCha20Poly1305::new(key.into()))),
        }
    }

    fn seal(&self, nonce: &[u8; 12], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let sealed = match self {
            Self::Aes(aead) => aead.encrypt(nonce.into(), plaintext),
            Self::ChaCha(aead) => aead.encrypt(nonce.into(), plaintext),
        };
        sealed.map_err(|_| anyhow::anyhow!("encryption failed"))
    }

    fn open(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let opened = match self {
            Self::Aes(aead) => aead.decrypt(nonce.into(), ciphertext),
            Self::ChaCha(aead) => aead.decrypt(nonce.into(), ciphertext),
        };
        opened.map_err(|_| anyhow::anyhow!("decryption failed; wrong password or corrupt envelope"))
    }
}

impl CryptoPipeline {
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, SyncError> {
        if config.password.is_empty() {
            return Err(SyncError::ConfigInvalid("encryption password is empty".into()));
        }
        Ok(Self {
            compression: config.compression,
            cipher: config.cipher,
            key_hash: config.key_hash,
            password: config.password.clone(),
            encrypt_names: config.encrypt_names,
        })
    }

    /// The name an encrypted file carries on the remote side.
    pub fn remote_name(&self, name: &str) -> String {
        if self.encrypt_names {
            format!("{:x}.e", md5::compute(name.as_bytes()))
        } else {
            format!("{name}.e")
        }
    }

    /// Envelope `src` into `dst`, recording `original_name` inside the
    /// encrypted payload. Returns the envelope length in bytes.
    pub fn seal(
        &self,
        src: &mut impl Read,
        dst: &mut impl Write,
        original_name: &str,
    ) -> anyhow::Result<u64> {
        let mut salt = [0u8; SALT_LEN];
        let mut seed = [0u8; SEED_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut seed);

        let cipher = SealCipher::new(self.cipher, &self.derive_key(&salt));

        dst.write_all(MAGIC)?;
        dst.write_all(&[
            VERSION,
            self.compression as u8,
            self.cipher as u8,
            self.key_hash as u8,
        ])?;
        dst.write_all(&salt)?;
        dst.write_all(&seed)?;
        let mut written = (MAGIC.len() + 4 + SALT_LEN + SEED_LEN) as u64;

        let mut frame_index = 0u32;
        written += write_frame(dst, &cipher, &seed, &mut frame_index, original_name.as_bytes())?;

        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = read_up_to(src, &mut chunk)?;
            if n == 0 {
                break;
            }
            let compressed = self.compress(&chunk[..n])?;
            written += write_frame(dst, &cipher, &seed, &mut frame_index, &compressed)?;
        }
        dst.flush()?;
        Ok(written)
    }

    /// Inverse of [`CryptoPipeline::seal`]; returns the original filename.
    pub fn open(&self, src: &mut impl Read, dst: &mut impl Write) -> anyhow::Result<String> {
        let mut header = [0u8; 4 + 4 + SALT_LEN + SEED_LEN];
        src.read_exact(&mut header)?;
        if &header[..4] != MAGIC || header[4] != VERSION {
            anyhow::bail!("not an envelope, or unsupported version");
        }
        let salt: [u8; SALT_LEN] = header[8..8 + SALT_LEN].try_into().unwrap();
        let seed: [u8; SEED_LEN] = header[8 + SALT_LEN..].try_into().unwrap();

        let cipher = SealCipher::new(self.cipher, &self.derive_key(&salt));

        let mut frame_index = 0u32;
        let name_bytes = read_frame(src, &cipher, &seed, &mut frame_index)?
            .ok_or_else(|| anyhow::anyhow!("envelope is missing its name frame"))?;
        let original_name = String::from_utf8(name_bytes)?;

        while let Some(compressed) = read_frame(src, &cipher, &seed, &mut frame_index)? {
            let chunk = self.decompress(&compressed)?;
            dst.write_all(&chunk)?;
        }
        dst.flush()?;
        Ok(original_name)
    }

    pub fn seal_file(&self, src: &Path, dst: &Path, original_name: &str) -> anyhow::Result<u64> {
        let mut input = File::open(src)?;
        let mut output = File::create(dst)?;
        self.seal(&mut input, &mut output, original_name)
    }

    pub fn open_file(&self, src: &Path, dst: &Path) -> anyhow::Result<String> {
        let mut input = File::open(src)?;
        let mut output = File::create(dst)?;
        self.open(&mut input, &mut output)
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        match self.key_hash {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(self.password.as_bytes());
                hasher.update(salt);
                hasher.finalize().into()
            }
            HashAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(self.password.as_bytes());
                hasher.update(salt);
                *hasher.finalize().as_bytes()
            }
        }
    }

    fn compress(&self, chunk: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(match self.compression {
            Compression::Zstd => zstd::encode_all(chunk, 3)?,
            Compression::Lz4 => lz4::block::compress(chunk, None, true)?,
            Compression::Snappy => snap::raw::Encoder::new().compress_vec(chunk)?,
        })
    }

    fn decompress(&self, frame: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(match self.compression {
            Compression::Zstd => zstd::decode_all(frame)?,
            Compression::Lz4 => lz4::block::decompress(frame, None)?,
            Compression::Snappy => snap::raw::Decoder::new().decompress_vec(frame)?,
        })
    }
}

fn frame_nonce(seed: &[u8; SEED_LEN], index: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..SEED_LEN].copy_from_slice(seed);
    nonce[SEED_LEN..].copy_from_slice(&index.to_le_bytes());
    nonce
}

fn write_frame(
    dst: &mut impl Write,
    cipher: &SealCipher,
    seed: &[u8; SEED_LEN],
    index: &mut u32,
    plaintext: &[u8],
) -> anyhow::Result<u64> {
    let sealed = cipher.seal(&frame_nonce(seed, *index), plaintext)?;
    *index += 1;
    dst.write_all(&(sealed.len() as u32).to_le_bytes())?;
    dst.write_all(&sealed)?;
    Ok(4 + sealed.len() as u64)
}

fn read_frame(
    src: &mut impl Read,
    cipher: &SealCipher,
    seed: &[u8; SEED_LEN],
    index: &mut u32,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match src.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut sealed = vec![0u8; len];
    src.read_exact(&mut sealed)?;
    let opened = cipher.open(&frame_nonce(seed, *index), &sealed)?;
    *index += 1;
    Ok(Some(opened))
}

fn read_up_to(src: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(compression: Compression, cipher: Cipher) -> CryptoPipeline {
        CryptoPipeline::from_config(&EncryptionConfig {
            compression,
            cipher,
            key_hash: HashAlgorithm::Sha256,
            password: "correct horse".into(),
            encrypt_names: false,
        })
        .unwrap()
    }

    #[test]
    fn empty_password_is_rejected_before_the_run() {
        let err = CryptoPipeline::from_config(&EncryptionConfig {
            compression: Compression::Zstd,
            cipher: Cipher::Aes256Gcm,
            key_hash: HashAlgorithm::Sha256,
            password: String::new(),
            encrypt_names: false,
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::ConfigInvalid(_)));
    }

    #[test]
    fn seal_open_recovers_content_and_name() {
        for compression in [Compression::Zstd, Compression::Lz4, Compression::Snappy] {
            for cipher in [Cipher::Aes256Gcm, Cipher::ChaCha20Poly1305] {
                let pipeline = pipeline(compression, cipher);
                let payload: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect();

                let mut envelope = Vec::new();
                let written =
                    pipeline.seal(&mut &payload[..], &mut envelope, "report.pdf").unwrap();
                assert_eq!(written, envelope.len() as u64);
                assert_ne!(envelope, payload);

                let mut restored = Vec::new();
                let name = pipeline.open(&mut &envelope[..], &mut restored).unwrap();
                assert_eq!(name, "report.pdf");
                assert_eq!(restored, payload);
            }
        }
    }

    #[test]
    fn wrong_password_fails_to_open() {
        let sealer = pipeline(Compression::Zstd, Cipher::Aes256Gcm);
        let mut envelope = Vec::new();
        sealer.seal(&mut &b"secret"[..], &mut envelope, "f").unwrap();

        let mut opener = pipeline(Compression::Zstd, Cipher::Aes256Gcm);
        opener.password = "wrong".into();
        let mut out = Vec::new();
        assert!(opener.open(&mut &envelope[..], &mut out).is_err());
    }

    #[test]
    fn name_encryption_hashes_the_remote_name() {
        let mut config = EncryptionConfig {
            compression: Compression::Zstd,
            cipher: Cipher::Aes256Gcm,
            key_hash: HashAlgorithm::Blake3,
            password: "p".into(),
            encrypt_names: false,
        };
        let plain = CryptoPipeline::from_config(&config).unwrap();
        assert_eq!(plain.remote_name("a.txt"), "a.txt.e");

        config.encrypt_names = true;
        let hashed = CryptoPipeline::from_config(&config).unwrap();
        let name = hashed.remote_name("a.txt");
        assert!(name.ends_with(".e"));
        assert_eq!(name.len(), 34);
        assert_ne!(name, "a.txt.e");
    }
}
