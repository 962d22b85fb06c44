//! Collaborator interfaces the core depends on but does not own (§6).
//! Each trait is the boundary between this crate and systems that sit
//! outside the transcription core proper: user/billing records,
//! downstream conversation processing, push notifications, geolocation,
//! and profile audio storage. In-memory implementations back the unit
//! and integration tests and the bundled demo binary; a real deployment
//! swaps them for adapters that call out to those systems.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use transcription_protocol::{Conversation, Geolocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPlan {
    Basic,
    Unlimited,
}

#[derive(Debug, Clone)]
pub struct Person {
    pub id: String,
    pub name: String,
}

/// Read-only view onto user/subscription state (§6).
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn has_transcription_credits(&self, uid: &str) -> bool;
    async fn get_user_subscription(&self, uid: &str) -> SubscriptionPlan;
    async fn get_user_language_preference(&self, uid: &str) -> Option<String>;
    async fn get_user_private_cloud_sync_enabled(&self, uid: &str) -> bool;
    async fn get_person_by_name(&self, uid: &str, name: &str) -> Option<Person>;
}

#[derive(Debug, thiserror::Error)]
#[error("downstream processing failed: {0}")]
pub struct DownstreamError(pub String);

/// Synchronous, idempotent conversation post-processing (§6). MUST be
/// safe to call more than once with the same conversation id — crash
/// recovery in C4's startup rehydration depends on it.
#[async_trait]
pub trait DownstreamProcessor: Send + Sync {
    async fn process_conversation(&self, uid: &str, language: &str, conversation: Conversation) -> Result<Conversation, DownstreamError>;
}

/// Side-effecting, best-effort. Never raises on partial failure — an
/// empty message list stands in for "nothing triggered".
#[async_trait]
pub trait IntegrationsTrigger: Send + Sync {
    async fn trigger_external_integrations(&self, uid: &str, conversation: &Conversation) -> Vec<String>;
}

/// Speech-profile calibration audio, keyed by user. The returned path
/// names a readable WAV file.
#[async_trait]
pub trait ProfileAudioStore: Send + Sync {
    async fn get_profile_audio(&self, uid: &str) -> Option<PathBuf>;
}

/// Fire-and-forget notifications (§6). Failures are logged by the
/// implementation and never propagate.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_credit_limit(&self, uid: &str);
    async fn notify_silent_user(&self, uid: &str);
    async fn notify_last_conversation(&self, uid: &str, conversation_id: &str);
}

#[async_trait]
pub trait GeolocationResolver: Send + Sync {
    async fn get_cached_user_geolocation(&self, uid: &str) -> Option<Geolocation>;
    async fn resolve_location(&self, lat: f64, lon: f64) -> Geolocation;
}

/// Describes an assembled image for the `image_chunk` flow (§4.5).
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe_image(&self, bytes: &[u8]) -> String;
}

/// Async translation used by C5's translation scheduling. Failures are
/// logged and swallowed at the call site (`TranslationFailed`, §7).
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslationError>;
}

#[derive(Debug, thiserror::Error)]
#[error("translation failed: {0}")]
pub struct TranslationError(pub String);

/// In-memory collaborators for tests and the bundled demo deployment.
/// None of this is meant to be a real backend — it has no persistence
/// and every user has unlimited credits by default.
pub struct InMemoryCollaborators {
    pub credits: Mutex<HashMap<String, bool>>,
    pub plans: Mutex<HashMap<String, SubscriptionPlan>>,
    pub translation_prefs: Mutex<HashMap<String, String>>,
    pub private_cloud_sync: Mutex<HashMap<String, bool>>,
    pub people: Mutex<HashMap<String, Vec<Person>>>,
    pub profile_audio: Mutex<HashMap<String, PathBuf>>,
    pub geolocations: Mutex<HashMap<String, Geolocation>>,
    pub credit_limit_notified: AtomicBool,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        InMemoryCollaborators {
            credits: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            translation_prefs: Mutex::new(HashMap::new()),
            private_cloud_sync: Mutex::new(HashMap::new()),
            people: Mutex::new(HashMap::new()),
            profile_audio: Mutex::new(HashMap::new()),
            geolocations: Mutex::new(HashMap::new()),
            credit_limit_notified: AtomicBool::new(false),
        }
    }

    pub fn set_credits(&self, uid: &str, has_credits: bool) {
        self.credits.lock().insert(uid.to_string(), has_credits);
    }
}

impl Default for InMemoryCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for InMemoryCollaborators {
    async fn has_transcription_credits(&self, uid: &str) -> bool {
        *self.credits.lock().get(uid).unwrap_or(&true)
    }

    async fn get_user_subscription(&self, uid: &str) -> SubscriptionPlan {
        *self.plans.lock().get(uid).unwrap_or(&SubscriptionPlan::Basic)
    }

    async fn get_user_language_preference(&self, uid: &str) -> Option<String> {
        self.translation_prefs.lock().get(uid).cloned()
    }

    async fn get_user_private_cloud_sync_enabled(&self, uid: &str) -> bool {
        *self.private_cloud_sync.lock().get(uid).unwrap_or(&false)
    }

    async fn get_person_by_name(&self, uid: &str, name: &str) -> Option<Person> {
        self.people.lock().get(uid)?.iter().find(|p| p.name == name).cloned()
    }
}

#[async_trait]
impl ProfileAudioStore for InMemoryCollaborators {
    async fn get_profile_audio(&self, uid: &str) -> Option<PathBuf> {
        self.profile_audio.lock().get(uid).cloned()
    }
}

#[async_trait]
impl Notifier for InMemoryCollaborators {
    async fn notify_credit_limit(&self, uid: &str) {
        self.credit_limit_notified.store(true, Ordering::SeqCst);
        tracing::info!(uid, "credit limit notification sent");
    }

    async fn notify_silent_user(&self, uid: &str) {
        tracing::info!(uid, "silent user notification sent");
    }

    async fn notify_last_conversation(&self, uid: &str, conversation_id: &str) {
        tracing::info!(uid, conversation_id, "last conversation notification sent");
    }
}

#[async_trait]
impl GeolocationResolver for InMemoryCollaborators {
    async fn get_cached_user_geolocation(&self, uid: &str) -> Option<Geolocation> {
        self.geolocations.lock().get(uid).copied()
    }

    async fn resolve_location(&self, lat: f64, lon: f64) -> Geolocation {
        Geolocation { lat, lon }
    }
}

#[async_trait]
impl ImageDescriber for InMemoryCollaborators {
    async fn describe_image(&self, bytes: &[u8]) -> String {
        format!("an image ({} bytes)", bytes.len())
    }
}

#[async_trait]
impl Translator for InMemoryCollaborators {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslationError> {
        Ok(format!("[{target_lang}] {text}"))
    }
}

/// The downstream processor in the demo deployment: a no-op pass-through
/// that marks the conversation's `structured` field so callers can see it
/// was "processed".
pub struct PassthroughDownstreamProcessor;

#[async_trait]
impl DownstreamProcessor for PassthroughDownstreamProcessor {
    async fn process_conversation(&self, _uid: &str, _language: &str, mut conversation: Conversation) -> Result<Conversation, DownstreamError> {
        conversation.structured = Some(serde_json::json!({ "processed": true }));
        Ok(conversation)
    }
}

pub struct NoopIntegrationsTrigger;

#[async_trait]
impl IntegrationsTrigger for NoopIntegrationsTrigger {
    async fn trigger_external_integrations(&self, _uid: &str, _conversation: &Conversation) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_user_has_credits_until_explicitly_revoked() {
        let collaborators = InMemoryCollaborators::new();
        assert!(collaborators.has_transcription_credits("u1").await);
        collaborators.set_credits("u1", false);
        assert!(!collaborators.has_transcription_credits("u1").await);
    }

    #[tokio::test]
    async fn passthrough_processor_marks_structured() {
        let processor = PassthroughDownstreamProcessor;
        let conv = Conversation {
            id: "c1".to_string(),
            uid: "u1".to_string(),
            created_at: chrono::Utc::now(),
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            status: transcription_protocol::ConversationStatus::InProgress,
            source: transcription_protocol::ConversationSource::Omi,
            language: "en".to_string(),
            transcript_segments: vec![],
            photos: vec![],
            structured: None,
            geolocation: None,
            is_locked: false,
            private_cloud_sync_enabled: false,
            discarded: false,
        };
        let processed = processor.process_conversation("u1", "en", conv).await.unwrap();
        assert!(processed.structured.is_some());
    }
}
