//! Test double used by `conversation` and `session` integration tests:
//! a provider whose channel echoes one canned segment per `send` call
//! instead of talking to a real endpoint.

use super::{SttChannel, SttError, SttProvider, TranscriptCallback};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use transcription_protocol::TranscriptSegment;

pub struct FakeSttProvider {
    pub opened: AtomicUsize,
}

impl FakeSttProvider {
    pub fn new() -> Self {
        FakeSttProvider {
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SttProvider for FakeSttProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn open(
        &self,
        _language: &str,
        _sample_rate: u32,
        _channels: u8,
        _model: &str,
        _preroll: Option<&[i16]>,
        callback: TranscriptCallback,
    ) -> Result<Arc<dyn SttChannel>, SttError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSttChannel {
            callback,
            calls: Mutex::new(0),
        }))
    }
}

pub struct FakeSttChannel {
    callback: TranscriptCallback,
    calls: Mutex<u32>,
}

#[async_trait]
impl SttChannel for FakeSttChannel {
    async fn send(&self, audio: &[i16]) -> Result<(), SttError> {
        let mut calls = self.calls.lock();
        *calls += 1;
        let segment = TranscriptSegment {
            id: format!("fake-{calls}"),
            text: "hello world".to_string(),
            speaker_label: "SPEAKER_00".to_string(),
            speaker_id: 0,
            is_user: false,
            person_id: None,
            start_sec: 0.0,
            end_sec: audio.len() as f64 / 16000.0,
            translations: vec![],
            source: "deepgram".to_string(),
            speech_profile_processed: false,
        };
        self.callback.send(vec![segment]).map_err(|e| SttError::Send(e.to_string()))
    }

    async fn close(&self) {}
}
