pub mod config;

#[rustfmt::skip]
pub use self::config::{
    Cipher, CompareMethod, Compression, ConflictResolution, EncryptionConfig,
    HashAlgorithm, JobConfig, SyncMode, TargetOptions,
};
