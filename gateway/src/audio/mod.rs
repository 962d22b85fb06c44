//! C3 Audio Processor. Owns exactly one audio stream for one session:
//! codec decode, STT provider selection, and the profile-calibration
//! channel that runs alongside the primary channel for the first few
//! seconds of a session.

use crate::error::AudioError;
use crate::external::ProfileAudioStore;
use crate::stt::{select_provider, ProviderChoice, SttChannel, SttProvider, TranscriptCallback};
use opus::{Channels as OpusChannels, Decoder as OpusDecoder};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use transcription_protocol::Codec;

pub const DEFAULT_PROFILE_WINDOW_PADDING_S: f64 = 5.0;

/// Initialization result: the STT channel's canonical language and the
/// user's preferred translation language, both threaded back up to the
/// session so emitted segments can be checked against it.
pub struct AudioInit {
    pub stt_language: String,
    pub translation_language: Option<String>,
}

enum Decoder {
    Passthrough,
    Opus { decoder: Mutex<OpusDecoder>, frame_size: usize },
}

pub struct AudioProcessor {
    decoder: Decoder,
    primary: Arc<dyn SttChannel>,
    calibration: Option<Arc<dyn SttChannel>>,
    profile_window: Duration,
    timer_start: Instant,
    profile_processed: AtomicBool,
}

impl AudioProcessor {
    /// Selects a provider, optionally loads a speech profile and opens a
    /// calibration channel alongside the primary, and returns both
    /// languages the session needs to remember. `fails_with
    /// UnsupportedLanguage | ProfileLoadFailed | STTConnect` per §4.3,
    /// except profile-load failure degrades instead of failing (logged,
    /// the profile window becomes zero).
    pub async fn initialize(
        language: &str,
        translation_language: Option<String>,
        sample_rate: u32,
        channels: u8,
        codec: Codec,
        include_speech_profile: bool,
        profile_audio: &dyn ProfileAudioStore,
        uid: &str,
        callback: TranscriptCallback,
    ) -> Result<(Self, AudioInit), AudioError> {
        let ProviderChoice {
            provider: provider_name,
            canonical_language,
            model,
        } = select_provider(language).ok_or_else(|| AudioError::UnsupportedLanguage(language.to_string()))?;

        let provider: Arc<dyn SttProvider> =
            crate::stt::provider_by_name(provider_name).expect("select_provider only returns known provider names");

        let primary = provider
            .open(&canonical_language, sample_rate, channels, model, None, callback.clone())
            .await
            .map_err(|e| AudioError::SttConnect(e.to_string()))?;

        let wants_profile = include_speech_profile
            && matches!(codec, Codec::Opus | Codec::OpusFs320 | Codec::Pcm16)
            && (canonical_language == "en" || canonical_language == "multi");

        let mut calibration = None;
        let mut profile_window = Duration::ZERO;
        if wants_profile {
            match load_profile_preroll(profile_audio, uid).await {
                Ok(Some((preroll, duration))) => {
                    profile_window = duration + Duration::from_secs_f64(DEFAULT_PROFILE_WINDOW_PADDING_S);
                    match provider
                        .open(&canonical_language, sample_rate, channels, model, Some(&preroll), callback)
                        .await
                    {
                        Ok(channel) => calibration = Some(channel),
                        Err(e) => {
                            tracing::warn!(uid, error = %e, "failed to open calibration channel, continuing without it");
                            profile_window = Duration::ZERO;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(uid, %e, "failed to load speech profile, continuing without calibration");
                }
            }
        }

        let decoder = match codec.stored() {
            Codec::Opus => {
                let frame_size = codec.frame_size_samples().unwrap_or(160) as usize;
                let opus_channels = if channels > 1 { OpusChannels::Stereo } else { OpusChannels::Mono };
                let decoder = OpusDecoder::new(sample_rate, opus_channels)?;
                Decoder::Opus {
                    decoder: Mutex::new(decoder),
                    frame_size,
                }
            }
            _ => Decoder::Passthrough,
        };

        let processor = AudioProcessor {
            decoder,
            primary,
            calibration,
            profile_window,
            timer_start: Instant::now(),
            profile_processed: AtomicBool::new(false),
        };

        Ok((
            processor,
            AudioInit {
                stt_language: canonical_language,
                translation_language,
            },
        ))
    }

    fn decode(&self, audio_bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
        match &self.decoder {
            Decoder::Passthrough => Ok(audio_bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect()),
            Decoder::Opus { decoder, frame_size } => {
                let mut decoder = decoder.lock();
                let mut output = vec![0i16; *frame_size];
                let n = decoder.decode(audio_bytes, &mut output, false)?;
                output.truncate(n);
                Ok(output)
            }
        }
    }

    /// Decodes (if needed) and fans `audio_bytes` out to the active
    /// channel(s). Returns whether the calibration channel was just
    /// closed by this call (the session marks `speech_profile_processed`
    /// on that transition).
    pub async fn push(&self, audio_bytes: &[u8]) -> Result<bool, AudioError> {
        let samples = self.decode(audio_bytes)?;

        let within_window = self.timer_start.elapsed() <= self.profile_window;
        if within_window {
            if let Some(calibration) = &self.calibration {
                let _ = calibration.send(&samples).await;
            }
            self.primary.send(&samples).await.map_err(|e| AudioError::SttConnect(e.to_string()))?;
            return Ok(false);
        }

        self.primary.send(&samples).await.map_err(|e| AudioError::SttConnect(e.to_string()))?;

        if let Some(calibration) = self.calibration.as_ref() {
            if !self.profile_processed.swap(true, Ordering::SeqCst) {
                calibration.close().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Terminates all channels. Best-effort: errors are logged by the
    /// channel implementations, never raised here.
    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(calibration) = &self.calibration {
            calibration.close().await;
        }
    }
}

async fn load_profile_preroll(
    profile_audio: &dyn ProfileAudioStore,
    uid: &str,
) -> Result<Option<(Vec<i16>, Duration)>, AudioError> {
    let Some(path) = profile_audio.get_profile_audio(uid).await else {
        return Ok(None);
    };
    let samples = read_wav_samples(&path).map_err(|e| AudioError::ProfileLoad(e.to_string()))?;
    let duration = Duration::from_secs_f64(samples.len() as f64 / 16000.0);
    Ok(Some((samples, duration)))
}

/// Minimal WAV reader: assumes a canonical 44-byte PCM16 mono header,
/// which is what the profile recorder in this deployment writes.
fn read_wav_samples(path: &std::path::Path) -> std::io::Result<Vec<i16>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() <= 44 {
        return Ok(Vec::new());
    }
    Ok(bytes[44..]
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryCollaborators;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn b2_zero_profile_window_uses_only_primary() {
        let collaborators = InMemoryCollaborators::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (processor, init) = AudioProcessor::initialize(
            "en",
            None,
            16000,
            1,
            Codec::Pcm16,
            true,
            &collaborators,
            "u1",
            tx,
        )
        .await
        .unwrap();
        assert_eq!(init.stt_language, "en");
        assert!(processor.calibration.is_none());
        assert_eq!(processor.profile_window, Duration::ZERO);
    }

    #[tokio::test]
    async fn unsupported_language_fails_initialize() {
        let collaborators = InMemoryCollaborators::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = AudioProcessor::initialize(
            "klingon",
            None,
            16000,
            1,
            Codec::Pcm16,
            false,
            &collaborators,
            "u1",
            tx,
        )
        .await;
        assert!(matches!(result, Err(AudioError::UnsupportedLanguage(_))));
    }

    #[tokio::test]
    async fn b4_opus_fs320_decodes_with_frame_320() {
        let collaborators = InMemoryCollaborators::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (processor, _init) = AudioProcessor::initialize(
            "en",
            None,
            16000,
            1,
            Codec::OpusFs320,
            false,
            &collaborators,
            "u1",
            tx,
        )
        .await
        .unwrap();
        match &processor.decoder {
            Decoder::Opus { frame_size, .. } => assert_eq!(*frame_size, 320),
            Decoder::Passthrough => panic!("expected opus decoder"),
        }
    }

    #[tokio::test]
    async fn pcm_passthrough_decodes_little_endian_samples() {
        let collaborators = InMemoryCollaborators::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (processor, _init) = AudioProcessor::initialize(
            "en",
            None,
            16000,
            1,
            Codec::Pcm16,
            false,
            &collaborators,
            "u1",
            tx,
        )
        .await
        .unwrap();
        let bytes = 1000i16.to_le_bytes();
        let samples = processor.decode(&bytes).unwrap();
        assert_eq!(samples, vec![1000]);
    }
}
