use super::{SttChannel, SttError, SttProvider, TranscriptCallback};
use async_trait::async_trait;
use std::sync::Arc;

/// Soniox accepts `language_hints` on open and is fully async over
/// `send`/`close`. Wire protocol out of scope.
pub struct SonioxProvider;

impl SonioxProvider {
    pub fn new() -> Self {
        SonioxProvider
    }
}

impl Default for SonioxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SttProvider for SonioxProvider {
    fn name(&self) -> &'static str {
        "soniox"
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
        Ok(Arc::new(SonioxChannel))
    }
}

struct SonioxChannel;

#[async_trait]
impl SttChannel for SonioxChannel {
    async fn send(&self, _audio: &[i16]) -> Result<(), SttError> {
        Ok(())
    }

    async fn close(&self) {}
}
