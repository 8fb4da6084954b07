//! Error types for the flipper-video backend

use thiserror::Error;

/// Main error type for the video core
#[derive(Error, Debug)]
pub enum VideoError {
    /// The host graphics API lacks something the core cannot run without.
    /// Fatal to startup.
    #[error("Missing graphics capability: {0}")]
    Capability(String),

    #[error("Program compilation failed: {0}")]
    ProgramCompilation(String),

    #[error("Program store error: {0}")]
    Store(#[from] StoreError),

    #[error("Graphics device lost")]
    DeviceLost,

    #[error("Video core is not initialized")]
    NotInitialized,

    #[error("Render thread panicked")]
    ThreadPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Errors raised while reading or writing the persisted program store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid store magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("Store version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Driver fingerprint mismatch: expected {expected:?}, found {found:?}")]
    FingerprintMismatch { expected: String, found: String },

    #[error("Store truncated at offset {0}")]
    Truncated(usize),

    #[error("Signature size mismatch: expected {expected} bytes, found {found}")]
    SignatureSize { expected: usize, found: usize },

    #[error("Empty program payload for entry {0}")]
    EmptyProgram(usize),

    #[error("{0} unexpected bytes after the last entry")]
    TrailingData(usize),

    #[error("Store checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

/// Result type alias for video core operations
pub type Result<T> = std::result::Result<T, VideoError>;
