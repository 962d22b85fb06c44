//! C5 Transcription Session: one long-lived bidirectional stream per
//! client. Owns a tree of background tasks (heartbeat, usage accounting,
//! idle-timeout monitor, STT callback dispatch) all canceled together
//! when the transport closes.

use crate::audio::AudioProcessor;
use crate::conversation::{ConversationManager, MergeInput};
use crate::error::{close_code, CoreError};
use crate::external::{ImageDescriber, Notifier, ProfileAudioStore, SubscriptionPlan, Translator, UserStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;
use transcription_protocol::{
    ClientFrame, Codec, ConversationPhoto, SegmentTranslation, ServerEvent, TranscriptSegment, TranslatedSegmentRef,
};

pub struct SessionParams {
    pub uid: String,
    pub language: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub codec: Codec,
    pub include_speech_profile: bool,
    pub conversation_timeout: Duration,
}

pub struct SessionServices {
    pub conversations: Arc<ConversationManager>,
    pub users: Arc<dyn UserStore>,
    pub notifier: Arc<dyn Notifier>,
    pub profile_audio: Arc<dyn ProfileAudioStore>,
    pub images: Arc<dyn ImageDescriber>,
    pub translator: Arc<dyn Translator>,
    pub heartbeat_interval: Duration,
    pub inactivity_timeout: Duration,
    pub usage_interval: Duration,
    pub max_concurrent_translations: usize,
    pub silent_user_threshold: Duration,
}

enum Outbound {
    Event(ServerEvent),
    Ping,
    Close(u16),
}

struct ImageAssembly {
    total: u32,
    chunks: Vec<Option<String>>,
}

struct SharedState {
    uid: String,
    conversation_id: Arc<Mutex<String>>,
    speaker_assignments: Mutex<HashMap<String, String>>,
    stt_language: Mutex<String>,
    translation_language: Mutex<Option<String>>,
    user_has_credits: AtomicBool,
    credit_limit_notified: AtomicBool,
    last_audio_time_ms: AtomicI64,
    session_start_ms: i64,
    last_transcript_time_ms: AtomicI64,
    locked_conversations: Mutex<HashSet<String>>,
    image_chunks: Mutex<HashMap<String, ImageAssembly>>,
    stop_requested: AtomicBool,
}

impl SharedState {
    fn touch_audio(&self) {
        self.last_audio_time_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn conversation_id(&self) -> String {
        self.conversation_id.lock().clone()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Runs one session to completion: transport accept and uid
/// authentication already performed by the caller. Returns the close
/// code used so the caller can log it.
pub async fn run_session(stream: WebSocketStream<TcpStream>, params: SessionParams, services: Arc<SessionServices>) -> u16 {
    let (mut ws_sender, mut ws_receiver) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let sent = match msg {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => ws_sender.send(Message::Text(json)).await,
                    Err(_) => Ok(()),
                },
                Outbound::Ping => ws_sender.send(Message::Text("ping".to_string())).await,
                Outbound::Close(code) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
    });

    macro_rules! shutdown {
        ($code:expr, $tasks:expr) => {{
            let code = $code;
            let _ = outbound_tx.send(Outbound::Close(code));
            drop(outbound_tx);
            let _ = writer.await;
            for task in $tasks {
                task.abort();
            }
            return code;
        }};
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    {
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if outbound_tx.send(Outbound::Event(event)).is_err() {
                    break;
                }
            }
        });
    }

    let has_credits = services.users.has_transcription_credits(&params.uid).await;
    let translation_language = services.users.get_user_language_preference(&params.uid).await;

    let now = now_ms();
    let shared = Arc::new(SharedState {
        uid: params.uid.clone(),
        conversation_id: Arc::new(Mutex::new(String::new())),
        speaker_assignments: Mutex::new(HashMap::new()),
        stt_language: Mutex::new(params.language.clone()),
        translation_language: Mutex::new(translation_language.clone()),
        user_has_credits: AtomicBool::new(has_credits),
        credit_limit_notified: AtomicBool::new(false),
        last_audio_time_ms: AtomicI64::new(now),
        session_start_ms: now,
        last_transcript_time_ms: AtomicI64::new(now),
        locked_conversations: Mutex::new(HashSet::new()),
        image_chunks: Mutex::new(HashMap::new()),
        stop_requested: AtomicBool::new(false),
    });

    let mut background_tasks = Vec::new();
    background_tasks.push(spawn_heartbeat(shared.clone(), services.clone(), outbound_tx.clone()));
    background_tasks.push(spawn_usage_accounting(shared.clone(), services.clone()));

    let (cb_tx, mut cb_rx) = mpsc::unbounded_channel::<Vec<TranscriptSegment>>();

    let audio_processor = match AudioProcessor::initialize(
        &params.language,
        translation_language,
        params.sample_rate,
        params.channels,
        params.codec,
        params.include_speech_profile,
        services.profile_audio.as_ref(),
        &params.uid,
        cb_tx,
    )
    .await
    {
        Ok((processor, init)) => {
            *shared.stt_language.lock() = init.stt_language;
            Arc::new(processor)
        }
        Err(e) => {
            let code = CoreError::from(e).close_code().unwrap_or(close_code::INTERNAL_ERROR);
            warn!(uid = %params.uid, "audio processor init failed, closing with {code}");
            shutdown!(code, background_tasks);
        }
    };

    {
        let shared = shared.clone();
        let conversations = services.conversations.clone();
        let events_tx = events_tx.clone();
        let translator = services.translator.clone();
        let max_translations = services.max_concurrent_translations.max(1);
        let semaphore = Arc::new(Semaphore::new(max_translations));
        tokio::spawn(async move {
            while let Some(batch) = cb_rx.recv().await {
                handle_stt_batch(&shared, &conversations, &events_tx, &translator, &semaphore, batch).await;
            }
        });
    }

    let rehydration = match services
        .conversations
        .rehydrate(&params.uid, &params.language, params.conversation_timeout, &events_tx)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(uid = %params.uid, error = %e, "rehydration failed");
            audio_processor.close().await;
            shutdown!(close_code::INTERNAL_ERROR, background_tasks);
        }
    };
    *shared.conversation_id.lock() = rehydration.conversation_id;

    let monitor = services.conversations.spawn_idle_monitor(
        params.uid.clone(),
        params.language.clone(),
        params.conversation_timeout,
        events_tx.clone(),
        shared.conversation_id.clone(),
    );
    background_tasks.push(monitor);

    let close_code_used = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                shared.touch_audio();
                if let Err(e) = audio_processor.push(&data).await {
                    warn!(uid = %params.uid, error = %e, "audio push failed");
                    break close_code::INTERNAL_ERROR;
                }
            }
            Some(Ok(Message::Text(text))) => {
                handle_text_frame(&text, &shared, &services, &events_tx).await;
            }
            Some(Ok(Message::Close(_))) | None => break close_code::NORMAL,
            Some(Ok(_)) => {}
            Some(Err(_)) => break close_code::INTERNAL_ERROR,
        }

        if shared.stop_requested.load(Ordering::SeqCst) {
            break close_code::NORMAL;
        }
    };

    // Graceful shutdown: close the audio channels and record final usage,
    // but never finalize the in-progress conversation here. The idle
    // monitor owns that transition so a reconnecting session can resume it.
    audio_processor.close().await;
    record_usage(&shared, &services).await;

    shutdown!(close_code_used, background_tasks);
}

fn spawn_heartbeat(shared: Arc<SharedState>, services: Arc<SessionServices>, outbound_tx: mpsc::UnboundedSender<Outbound>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(services.heartbeat_interval).await;
            let idle_ms = now_ms() - shared.last_audio_time_ms.load(Ordering::SeqCst);
            if idle_ms as u64 >= services.inactivity_timeout.as_millis() as u64 {
                shared.stop_requested.store(true, Ordering::SeqCst);
                let _ = outbound_tx.send(Outbound::Close(close_code::GOING_AWAY));
                break;
            }
            if outbound_tx.send(Outbound::Ping).is_err() {
                break;
            }
        }
    })
}

fn spawn_usage_accounting(shared: Arc<SharedState>, services: Arc<SessionServices>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(services.usage_interval).await;
            record_usage(&shared, &services).await;
        }
    })
}

async fn record_usage(shared: &SharedState, services: &SessionServices) {
    let has_credits = services.users.has_transcription_credits(&shared.uid).await;
    shared.user_has_credits.store(has_credits, Ordering::SeqCst);

    if !has_credits {
        if !shared.credit_limit_notified.swap(true, Ordering::SeqCst) {
            services.notifier.notify_credit_limit(&shared.uid).await;
        }
        let conversation_id = shared.conversation_id();
        let mut locked = shared.locked_conversations.lock();
        if !locked.contains(&conversation_id) {
            locked.insert(conversation_id);
        }
        return;
    }

    if services.users.get_user_subscription(&shared.uid).await == SubscriptionPlan::Basic {
        let last_audio = shared.last_audio_time_ms.load(Ordering::SeqCst);
        let anchor = shared.last_transcript_time_ms.load(Ordering::SeqCst).max(shared.session_start_ms);
        let silent_ms = last_audio - anchor;
        if silent_ms >= services.silent_user_threshold.as_millis() as i64 {
            services.notifier.notify_silent_user(&shared.uid).await;
        }
    }
}

/// §4.5 B3: empty or whitespace-only edge-ASR text is silently ignored.
fn is_blank_transcript_text(text: &str) -> bool {
    text.trim().is_empty()
}

async fn handle_text_frame(text: &str, shared: &SharedState, services: &SessionServices, events_tx: &mpsc::UnboundedSender<ServerEvent>) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    match frame {
        ClientFrame::TranscriptSegment {
            text,
            speaker,
            start,
            end,
            is_final,
            confidence: _,
        } => {
            if !is_final || is_blank_transcript_text(&text) {
                return;
            }
            let segment = TranscriptSegment {
                id: uuid::Uuid::new_v4().to_string(),
                text,
                speaker_label: speaker,
                speaker_id: 0,
                is_user: false,
                person_id: None,
                start_sec: start,
                end_sec: end,
                translations: vec![],
                source: "edge_asr".to_string(),
                speech_profile_processed: false,
            };
            merge_and_emit(shared, services, events_tx, vec![segment], vec![]).await;
        }
        ClientFrame::Stop => {
            shared.stop_requested.store(true, Ordering::SeqCst);
        }
        ClientFrame::ImageChunk { id, index, total, data } => {
            let assembled = {
                let mut chunks = shared.image_chunks.lock();
                let entry = chunks.entry(id.clone()).or_insert_with(|| ImageAssembly {
                    total,
                    chunks: vec![None; total as usize],
                });
                if (index as usize) < entry.chunks.len() {
                    entry.chunks[index as usize] = Some(data);
                }
                entry.chunks.iter().all(Option::is_some).then(|| entry.chunks.clone())
            };
            if let Some(parts) = assembled {
                shared.image_chunks.lock().remove(&id);
                let mut bytes = Vec::new();
                for part in parts.into_iter().flatten() {
                    if let Ok(mut decoded) = BASE64.decode(part) {
                        bytes.append(&mut decoded);
                    }
                }
                let description = services.images.describe_image(&bytes).await;
                let photo = ConversationPhoto {
                    id,
                    bytes_ref: format!("{}b", bytes.len()),
                    description: Some(description),
                    created_at: chrono::Utc::now(),
                };
                merge_and_emit(shared, services, events_tx, vec![], vec![photo]).await;
            }
        }
        ClientFrame::SpeakerAssignment { segment_id, person_id } => {
            shared.speaker_assignments.lock().insert(segment_id, person_id);
        }
        ClientFrame::Unknown => {}
    }
}

async fn merge_and_emit(
    shared: &SharedState,
    services: &SessionServices,
    events_tx: &mpsc::UnboundedSender<ServerEvent>,
    segments: Vec<TranscriptSegment>,
    photos: Vec<ConversationPhoto>,
) {
    if !shared.user_has_credits.load(Ordering::SeqCst) {
        return;
    }
    let conversation_id = shared.conversation_id();
    if shared.locked_conversations.lock().contains(&conversation_id) {
        return;
    }
    let speaker_assignments = shared.speaker_assignments.lock().clone();
    if let Some((conv, range)) = services
        .conversations
        .merge(
            &shared.uid,
            &conversation_id,
            MergeInput {
                segments,
                photos,
                finished_at: chrono::Utc::now(),
                speaker_assignments,
            },
        )
        .await
    {
        let touched = conv.transcript_segments[range].to_vec();
        if !touched.is_empty() {
            let _ = events_tx.send(ServerEvent::TranscriptSegments { segments: touched });
        }
    }
}

async fn handle_stt_batch(
    shared: &SharedState,
    conversations: &ConversationManager,
    events_tx: &mpsc::UnboundedSender<ServerEvent>,
    translator: &Arc<dyn Translator>,
    semaphore: &Arc<Semaphore>,
    batch: Vec<TranscriptSegment>,
) {
    if !shared.user_has_credits.load(Ordering::SeqCst) {
        return;
    }
    shared.last_transcript_time_ms.store(now_ms(), Ordering::SeqCst);
    let conversation_id = shared.conversation_id();
    if shared.locked_conversations.lock().contains(&conversation_id) {
        return;
    }
    let speaker_assignments = shared.speaker_assignments.lock().clone();
    let Some((conv, range)) = conversations
        .merge(
            &shared.uid,
            &conversation_id,
            MergeInput {
                segments: batch,
                photos: vec![],
                finished_at: chrono::Utc::now(),
                speaker_assignments,
            },
        )
        .await
    else {
        return;
    };

    let touched = conv.transcript_segments[range].to_vec();
    if touched.is_empty() {
        return;
    }
    let _ = events_tx.send(ServerEvent::TranscriptSegments { segments: touched.clone() });

    let Some(target_lang) = shared.translation_language.lock().clone() else {
        return;
    };
    if *shared.stt_language.lock() == target_lang {
        return;
    }
    for segment in touched {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            continue;
        };
        let translator = translator.clone();
        let events_tx = events_tx.clone();
        let target_lang = target_lang.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match translator.translate(&segment.text, &target_lang).await {
                Ok(text) => {
                    let _ = events_tx.send(ServerEvent::Translation {
                        segments: vec![TranslatedSegmentRef {
                            id: segment.id,
                            translations: vec![SegmentTranslation { lang: target_lang, text }],
                        }],
                    });
                }
                Err(e) => {
                    warn!(segment_id = %segment.id, error = %e, "translation failed");
                }
            }
        });
    }
}
