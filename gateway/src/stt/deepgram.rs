use super::{SttChannel, SttError, SttProvider, TranscriptCallback};
use async_trait::async_trait;
use std::sync::Arc;

/// Deepgram's streaming API is a synchronous `send`/`finish` pair over a
/// single websocket; callback delivery happens on a reader task owned by
/// the channel. The wire protocol itself is out of scope.
pub struct DeepgramProvider;

impl DeepgramProvider {
    pub fn new() -> Self {
        DeepgramProvider
    }
}

impl Default for DeepgramProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SttProvider for DeepgramProvider {
    fn name(&self) -> &'static str {
        "deepgram"
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
        Ok(Arc::new(DeepgramChannel))
    }
}

struct DeepgramChannel;

#[async_trait]
impl SttChannel for DeepgramChannel {
    async fn send(&self, _audio: &[i16]) -> Result<(), SttError> {
        Ok(())
    }

    async fn close(&self) {}
}
