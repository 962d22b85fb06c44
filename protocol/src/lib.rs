use serde::{Deserialize, Serialize};

/// Audio codec negotiated at handshake. `OpusFs320` is normalized to `Opus`
/// with `frame_size=320` once decoded; the wire value is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Pcm8,
    Pcm16,
    Opus,
    OpusFs320,
}

impl Codec {
    /// Frame size in samples for codecs that decode in fixed-size frames.
    /// `Pcm8`/`Pcm16` pass through and have no fixed frame.
    pub fn frame_size_samples(self) -> Option<u32> {
        match self {
            Codec::Opus => Some(160),
            Codec::OpusFs320 => Some(320),
            Codec::Pcm8 | Codec::Pcm16 => None,
        }
    }

    /// The codec value as it is stored once decoded (`opus_fs320` normalizes
    /// down to `opus`; the frame size is tracked separately).
    pub fn stored(self) -> Codec {
        match self {
            Codec::OpusFs320 => Codec::Opus,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    InProgress,
    Processing,
    Completed,
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationSource {
    Omi,
    Openglass,
    External,
    EdgeAsr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTranslation {
    pub lang: String,
    pub text: String,
}

/// A single transcribed utterance window. `id` is content-addressed and
/// stable across retries of the same underlying audio window so repeated
/// merges of the same STT response coalesce instead of duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: String,
    pub text: String,
    pub speaker_label: String,
    pub speaker_id: i32,
    pub is_user: bool,
    pub person_id: Option<String>,
    pub start_sec: f64,
    pub end_sec: f64,
    #[serde(default)]
    pub translations: Vec<SegmentTranslation>,
    pub source: String,
    #[serde(default)]
    pub speech_profile_processed: bool,
}

impl TranscriptSegment {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPhoto {
    pub id: String,
    pub bytes_ref: String,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub uid: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub status: ConversationStatus,
    pub source: ConversationSource,
    pub language: String,
    #[serde(default)]
    pub transcript_segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub photos: Vec<ConversationPhoto>,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub geolocation: Option<Geolocation>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub private_cloud_sync_enabled: bool,
    #[serde(default)]
    pub discarded: bool,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.transcript_segments.is_empty() && self.photos.is_empty()
    }
}

/// Frames the client may send as JSON text. Binary frames carry raw audio
/// and are not represented here. An unrecognized `type` is ignored by the
/// receiver rather than treated as a protocol error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    TranscriptSegment {
        text: String,
        #[serde(default = "default_speaker")]
        speaker: String,
        #[serde(default)]
        start: f64,
        #[serde(default)]
        end: f64,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        confidence: Option<f32>,
    },
    Stop,
    ImageChunk {
        id: String,
        index: u32,
        total: u32,
        data: String,
    },
    SpeakerAssignment {
        segment_id: String,
        /// Either an opaque person id or the literal `"user"`.
        person_id: String,
    },
    /// Catch-all for any `type` this protocol version doesn't recognize;
    /// the receiver silently ignores these rather than closing the session.
    #[serde(other)]
    Unknown,
}

fn default_speaker() -> String {
    "SPEAKER_00".to_string()
}

/// Frames emitted to the client. `"ping"` heartbeats are sent as a bare
/// text frame outside this enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ServiceStatus {
        status: String,
        status_text: String,
    },
    LastConversation {
        conversation_id: String,
    },
    TranscriptSegments {
        segments: Vec<TranscriptSegment>,
    },
    Translation {
        segments: Vec<TranslatedSegmentRef>,
    },
    ConversationProcessingStarted {
        conversation: Conversation,
    },
    ConversationCreated {
        conversation: Conversation,
        messages: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslatedSegmentRef {
    pub id: String,
    pub translations: Vec<SegmentTranslation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_fs320_normalizes_to_opus_with_frame_320() {
        assert_eq!(Codec::OpusFs320.stored(), Codec::Opus);
        assert_eq!(Codec::OpusFs320.frame_size_samples(), Some(320));
        assert_eq!(Codec::Opus.frame_size_samples(), Some(160));
    }

    #[test]
    fn client_frame_unknown_type_is_ignored_not_an_error() {
        let raw = r#"{"type":"unknown_thing","foo":1}"#;
        let parsed: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientFrame::Unknown));
    }

    #[test]
    fn transcript_segment_frame_defaults() {
        let raw = r#"{"type":"transcript_segment","text":"hi"}"#;
        let parsed: ClientFrame = serde_json::from_str(raw).unwrap();
        match parsed {
            ClientFrame::TranscriptSegment {
                text,
                speaker,
                start,
                end,
                ..
            } => {
                assert_eq!(text, "hi");
                assert_eq!(speaker, "SPEAKER_00");
                assert_eq!(start, 0.0);
                assert_eq!(end, 0.0);
            }
            _ => panic!("wrong variant"),
        }
    }
}
