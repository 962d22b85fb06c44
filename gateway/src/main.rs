use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use transcription_gateway::config::{Args, ServerConfig};
use transcription_gateway::conversation::{ConversationManager, ConversationManagerConfig};
use transcription_gateway::external::{InMemoryCollaborators, NoopIntegrationsTrigger, PassthroughDownstreamProcessor};
use transcription_gateway::lock::LockService;
use transcription_gateway::server;
use transcription_gateway::session::SessionServices;
use transcription_gateway::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);

    let expected_token = match &args.token_file {
        Some(path) => {
            info!("API token authentication enabled");
            Some(std::fs::read_to_string(path)?.trim().to_string())
        }
        None => None,
    };

    let lock_service = LockService::open(&config.lock_store_path)?;
    let store = Arc::new(Store::open(&config.conversation_store_path)?);
    let collaborators = Arc::new(InMemoryCollaborators::new());

    let conversations = Arc::new(ConversationManager::new(
        lock_service,
        store,
        Arc::new(PassthroughDownstreamProcessor),
        Arc::new(NoopIntegrationsTrigger),
        ConversationManagerConfig {
            lock_wait_conversation: Duration::from_secs(config.lock_wait_conversation_s),
            lock_lease_conversation: Duration::from_secs(config.lock_lease_conversation_s),
            conversation_timeout_min: Duration::from_secs(config.conversation_timeout_min_s),
            conversation_timeout_max: Duration::from_secs(config.conversation_timeout_max_s),
            merge_coalesce_gap_secs: config.merge_coalesce_gap_s,
            store_retry_backoff: config.stt_retry_backoff.clone(),
            monitor_interval: Duration::from_secs(config.monitor_interval_s),
        },
    ));

    let services = Arc::new(SessionServices {
        conversations,
        users: collaborators.clone(),
        notifier: collaborators.clone(),
        profile_audio: collaborators.clone(),
        images: collaborators.clone(),
        translator: collaborators,
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_s),
        inactivity_timeout: Duration::from_secs(config.inactivity_timeout_s),
        usage_interval: Duration::from_secs(config.usage_interval_s),
        max_concurrent_translations: config.max_concurrent_translations,
        silent_user_threshold: Duration::from_secs(config.silent_user_threshold_s),
    });

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port).parse()?;
    let clamp_config = config.clone();
    server::serve(
        addr,
        services,
        expected_token,
        Duration::from_secs(config.conversation_timeout_min_s),
        move |requested_s| clamp_config.clamp_conversation_timeout(requested_s),
    )
    .await
}
