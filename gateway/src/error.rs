//! Layered error model. Each subsystem owns a narrow error enum; all of
//! them converge into [`CoreError`], which is the only place the
//! tagged-result-to-close-code translation named in the design notes
//! happens. Degrading failures (profile load, notifications, translation)
//! are logged at their call site and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to acquire lock for {key} within {wait_secs}s")]
    Acquisition { key: String, wait_secs: u64 },
    #[error("released lock {key} that was no longer owned (lease expired)")]
    Release { key: String },
    #[error("lock store error: {0}")]
    Backend(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("conversation {uid}/{id} not found")]
    NotFound { uid: String, id: String },
    #[error("in-progress pointer for {uid} already points at a different conversation")]
    PointerConflict { uid: String },
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no STT provider supports language {0:?}")]
    UnsupportedLanguage(String),
    #[error("failed to load speech profile audio: {0}")]
    ProfileLoad(String),
    #[error("failed to connect to STT provider: {0}")]
    SttConnect(String),
    #[error("opus decode error: {0}")]
    OpusDecode(#[from] opus::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config value: {0}")]
    Missing(&'static str),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// The WebSocket close codes named in §6 of the contract this core
/// implements against.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const UNAUTHENTICATED: u16 = 4401;
    pub const UNSUPPORTED_LANGUAGE: u16 = 4402;
    pub const NO_CREDITS: u16 = 4403;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error(transparent)]
    UnsupportedLanguage(#[from] AudioUnsupportedLanguage),
    #[error("STT connection failed: {0}")]
    SttConnect(String),
    #[error("STT transport failed: {0}")]
    SttTransport(String),
    #[error("speech profile unavailable, continuing without calibration: {0}")]
    ProfileLoadFailed(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("downstream processing failed: {0}")]
    DownstreamProcessing(String),
    #[error("notification failed: {0}")]
    NotificationFailed(String),
    #[error("translation failed: {0}")]
    TranslationFailed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Thin wrapper so `CoreError::UnsupportedLanguage` can carry a `#[from]`
/// without colliding with [`AudioError`]'s broader variant set.
#[derive(Debug, Error)]
#[error("unsupported language: {0}")]
pub struct AudioUnsupportedLanguage(pub String);

impl From<AudioError> for CoreError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::UnsupportedLanguage(lang) => {
                CoreError::UnsupportedLanguage(AudioUnsupportedLanguage(lang))
            }
            AudioError::ProfileLoad(msg) => CoreError::ProfileLoadFailed(msg),
            AudioError::SttConnect(msg) => CoreError::SttConnect(msg),
            AudioError::OpusDecode(e) => CoreError::SttTransport(e.to_string()),
        }
    }
}

impl CoreError {
    /// Maps a failure to the WebSocket close code the transport layer
    /// should use, or `None` if this error never reaches the transport
    /// layer (degrading failures are swallowed at their call site).
    pub fn close_code(&self) -> Option<u16> {
        use close_code::*;
        match self {
            CoreError::Unauthenticated => Some(UNAUTHENTICATED),
            CoreError::UnsupportedLanguage(_) => Some(UNSUPPORTED_LANGUAGE),
            CoreError::SttConnect(_) | CoreError::SttTransport(_) => Some(INTERNAL_ERROR),
            CoreError::Lock(LockError::Release { .. }) => Some(INTERNAL_ERROR),
            CoreError::Store(_) => Some(INTERNAL_ERROR),
            CoreError::Config(_) | CoreError::Io(_) => Some(INTERNAL_ERROR),
            // Acquisition failures, downstream-processing failures and the
            // feature-degrading kinds never fail the session outright.
            _ => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
