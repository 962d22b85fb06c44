//! STT provider adapters. A single capability trait stands in for the
//! duck-typed adapters of the source system; `deepgram`/`soniox`/
//! `speechmatics` each implement it. Wire formats are out of scope here —
//! the adapters in this module are structurally complete but stubbed at
//! the transport boundary.

mod deepgram;
mod soniox;
mod speechmatics;

pub use deepgram::DeepgramProvider;
pub use soniox::SonioxProvider;
pub use speechmatics::SpeechmaticsProvider;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use transcription_protocol::TranscriptSegment;

#[derive(Debug, Error)]
pub enum SttError {
    #[error("failed to connect to {provider}: {message}")]
    Connect { provider: &'static str, message: String },
    #[error("channel send failed: {0}")]
    Send(String),
}

/// One open streaming channel to a provider. Segments arrive on
/// `callback` rather than as a return value from `send`, matching the
/// provider's own push model (§4.3).
#[async_trait]
pub trait SttChannel: Send + Sync {
    async fn send(&self, audio: &[i16]) -> Result<(), SttError>;
    async fn close(&self);
}

/// One provider's entry point: open a channel bound to a callback that
/// receives transcript batches as they arrive.
#[async_trait]
pub trait SttProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        language: &str,
        sample_rate: u32,
        channels: u8,
        model: &str,
        preroll: Option<&[i16]>,
        callback: TranscriptCallback,
    ) -> Result<Arc<dyn SttChannel>, SttError>;
}

pub type TranscriptCallback = mpsc::UnboundedSender<Vec<TranscriptSegment>>;

/// `(provider, canonical_language, model)`, as returned by
/// [`select_provider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChoice {
    pub provider: &'static str,
    pub canonical_language: String,
    pub model: &'static str,
}

/// Pure provider-selection policy (§4.3). `"auto"` normalizes to
/// `"multi"` before matching. Returns `None` if nothing supports the
/// language.
pub fn select_provider(language: &str) -> Option<ProviderChoice> {
    let lang = if language == "auto" { "multi" } else { language };
    match lang {
        "en" | "multi" => Some(ProviderChoice {
            provider: "deepgram",
            canonical_language: lang.to_string(),
            model: "nova-2",
        }),
        "es" | "fr" | "de" | "it" | "pt" | "nl" | "hi" | "ja" | "ko" | "zh" => Some(ProviderChoice {
            provider: "soniox",
            canonical_language: lang.to_string(),
            model: "stt-rt-preview",
        }),
        "ru" | "pl" | "tr" | "ar" => Some(ProviderChoice {
            provider: "speechmatics",
            canonical_language: lang.to_string(),
            model: "enhanced",
        }),
        _ => None,
    }
}

pub fn provider_by_name(name: &str) -> Option<Arc<dyn SttProvider>> {
    match name {
        "deepgram" => Some(Arc::new(DeepgramProvider::new())),
        "soniox" => Some(Arc::new(SonioxProvider::new())),
        "speechmatics" => Some(Arc::new(SpeechmaticsProvider::new())),
        _ => None,
    }
}

#[cfg(test)]
pub mod fake;
