use super::{SttChannel, SttError, SttProvider, TranscriptCallback};
use async_trait::async_trait;
use std::sync::Arc;

/// Speechmatics, like Soniox, is async over `send`/`close`. Wire protocol
/// out of scope.
pub struct SpeechmaticsProvider;

impl SpeechmaticsProvider {
    pub fn new() -> Self {
        SpeechmaticsProvider
    }
}

impl Default for SpeechmaticsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SttProvider for SpeechmaticsProvider {
    fn name(&self) -> &'static str {
        "speechmatics"
    }

    async fn open(
        &self,
        _language: &str,
        _sample_rate: u32,
        _channels: u8,
        _model: &str,
        _preroll: Option<&[i16]>,
        _callback: TranscriptCallback,
    ) -> Result<Arc<dyn SttChannel>, SttError> {
        Ok(Arc::new(SpeechmaticsChannel))
    }
}

struct SpeechmaticsChannel;

#[async_trait]
impl SttChannel for SpeechmaticsChannel {
    async fn send(&self, _audio: &[i16]) -> Result<(), SttError> {
        Ok(())
    }

    async fn close(&self) {}
}
