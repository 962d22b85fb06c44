//! Accept loop and handshake. One TCP connection per session: the query
//! string carries the handshake parameters a client would otherwise send
//! as a first `Configure` frame, since a wearable's firmware negotiates
//! codec and sample rate before it ever opens the socket.

use crate::error::close_code;
use crate::session::{run_session, SessionParams, SessionServices};
use anyhow::{anyhow, Result};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};
use transcription_protocol::Codec;

pub async fn serve(addr: SocketAddr, services: Arc<SessionServices>, expected_token: Option<String>, default_conversation_timeout: Duration, clamp: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    let clamp = Arc::new(clamp);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!(%peer_addr, "connection accepted");
        let services = services.clone();
        let expected_token = expected_token.clone();
        let clamp = clamp.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, services, expected_token, default_conversation_timeout, clamp).await {
                error!(%peer_addr, error = %e, "connection error");
            }
        });
    }
    Ok(())
}

struct Handshake {
    uid: String,
    language: String,
    sample_rate: u32,
    channels: u8,
    codec: Codec,
    include_speech_profile: bool,
    conversation_timeout_s: u64,
    token: Option<String>,
}

fn parse_handshake(query: &str) -> Result<Handshake> {
    let params: std::collections::HashMap<String, String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect();
    let uid = params.get("uid").cloned().ok_or_else(|| anyhow!("missing uid"))?;
    let language = params.get("language").cloned().unwrap_or_else(|| "en".to_string());
    let sample_rate = params.get("sample_rate").and_then(|s| s.parse().ok()).unwrap_or(16000);
    let channels = params.get("channels").and_then(|s| s.parse().ok()).unwrap_or(1);
    let codec = match params.get("codec").map(String::as_str) {
        Some("opus") => Codec::Opus,
        Some("opus_fs320") => Codec::OpusFs320,
        Some("pcm8") => Codec::Pcm8,
        _ => Codec::Pcm16,
    };
    let include_speech_profile = params.get("include_speech_profile").map(|s| s == "true").unwrap_or(false);
    let conversation_timeout_s = params.get("conversation_timeout_s").and_then(|s| s.parse().ok()).unwrap_or(120);
    let token = params.get("token").cloned();
    Ok(Handshake {
        uid,
        language,
        sample_rate,
        channels,
        codec,
        include_speech_profile,
        conversation_timeout_s,
        token,
    })
}

async fn handle_connection(
    stream: TcpStream,
    services: Arc<SessionServices>,
    expected_token: Option<String>,
    default_conversation_timeout: Duration,
    clamp: Arc<impl Fn(u64) -> u64 + Send + Sync + 'static>,
) -> Result<()> {
    let mut uri = None;
    let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &tokio_tungstenite::tungstenite::handshake::server::Request, response| {
        uri = Some(req.uri().clone());
        Ok(response)
    })
    .await?;

    let query = uri.as_ref().and_then(|u| u.query()).unwrap_or("").to_string();
    let handshake = match parse_handshake(&query) {
        Ok(h) => h,
        Err(e) => return Err(anyhow!("bad handshake: {e}")),
    };

    if let Some(expected) = &expected_token {
        match &handshake.token {
            Some(t) if t == expected => {}
            _ => {
                let frame = CloseFrame {
                    code: CloseCode::from(close_code::UNAUTHENTICATED),
                    reason: "".into(),
                };
                let _ = ws_stream.send(Message::Close(Some(frame))).await;
                return Err(anyhow!("unauthenticated"));
            }
        }
    }

    let conversation_timeout = Duration::from_secs(clamp(handshake.conversation_timeout_s));
    let _ = default_conversation_timeout;

    let params = SessionParams {
        uid: handshake.uid.clone(),
        language: handshake.language,
        sample_rate: handshake.sample_rate,
        channels: handshake.channels,
        codec: handshake.codec,
        include_speech_profile: handshake.include_speech_profile,
        conversation_timeout,
    };

    let code = run_session(ws_stream, params, services).await;
    info!(uid = %handshake.uid, close_code = code, "session ended");
    Ok(())
}
