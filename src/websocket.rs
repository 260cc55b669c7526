//! # Provider Link (WebSocket Media Streams)
//!
//! Terminates one provider media-streams WebSocket per active call. The
//! provider speaks JSON over text frames, discriminated by an `event` field:
//! `connected`, `start`, `media` (base64 μ-law payload), `stop`, `closed`.
//!
//! ## Connection lifecycle:
//! 1. **Upgrade**: `GET /api/telephony/calls/stream/{session_id}`; the
//!    session must already exist (404 before upgrade otherwise)
//! 2. **Streaming**: inbound media is decoded and fed to the session's
//!    phone → pipeline queue; the outbound drain task forwards pipeline
//!    audio back as `media` events
//! 3. **Close**: idempotent; the link cancels its own scope and asks the
//!    registry to tear the session down. It never closes session queues
//!    itself
//!
//! ## Liveness:
//! A ping ticker doubles as the read-deadline check: the link pings the
//! peer on every tick and closes the connection after the configured window
//! of silence. Every inbound frame refreshes the activity timestamp.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::registry::{BridgeRegistry, LinkEndpoints};
use crate::bridge::session::{AudioFrame, BridgeSession};
use crate::config::BridgeConfig;
use crate::state::AppState;

/// Inbound provider events, discriminated on the `event` field. Events the
/// provider adds in the future land in `Unknown` and are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProviderEvent {
    Connected,
    Start,
    Media { media: MediaPayload },
    Stop,
    Closed,
    #[serde(other)]
    Unknown,
}

/// Nested payload of a `media` event.
#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// `"inbound"` (phone microphone) or `"outbound"` (our own echo).
    pub track: String,
    /// Base64-encoded μ-law audio.
    pub payload: String,
}

/// Link connection state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Streaming,
    Stopping,
    Closed,
}

/// The permitted state transitions for a provider event.
///
/// Returns the next state, or `None` when the event is not allowed in the
/// current state (the caller counts it as a protocol error and stays put).
/// The `closed` event is accepted from every state; `Unknown` never
/// transitions.
pub fn transition_on(state: LinkState, event: &ProviderEvent) -> Option<LinkState> {
    use LinkState::*;

    match (state, event) {
        (_, ProviderEvent::Closed) => Some(Closed),
        (Connecting, ProviderEvent::Connected) => Some(Connected),
        (Connected, ProviderEvent::Start) => Some(Streaming),
        (Streaming, ProviderEvent::Media { .. }) => Some(Streaming),
        (Streaming, ProviderEvent::Stop) => Some(Stopping),
        _ => None,
    }
}

/// Decode the audio carried by a media event, if it is on the inbound
/// track. The stream is requested with `track="both"`, so our own outbound
/// echo comes back and yields `None` here.
fn decode_inbound_media(media: &MediaPayload) -> Option<Result<Vec<u8>, base64::DecodeError>> {
    if media.track != "inbound" {
        return None;
    }
    Some(BASE64.decode(&media.payload))
}

/// Build the outbound media message for one telephony frame.
fn outbound_media_json(frame: &[u8]) -> serde_json::Value {
    json!({
        "event": "media",
        "media": {
            "track": "outbound",
            "payload": BASE64.encode(frame),
        }
    })
}

/// Message carrying one outbound audio frame from the drain task.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundMedia(AudioFrame);

/// WebSocket actor for one provider media-streams connection.
pub struct CallLink {
    /// Unique identifier for this connection (distinct from the session id)
    link_id: String,

    /// Bridge session this link feeds
    session_id: String,

    /// Provider call identifier (may be empty until known)
    call_sid: String,

    registry: Arc<BridgeRegistry>,
    session: Arc<BridgeSession>,

    state: LinkState,

    /// Child of the session scope; cancelled when the link closes
    scope: CancellationToken,

    /// Shock-absorber queues between wire I/O and the session queues.
    /// The receivers move out to the registry/drain task in `started`.
    audio_in: Option<mpsc::Sender<AudioFrame>>,
    audio_in_rx: Option<mpsc::Receiver<AudioFrame>>,
    audio_out_tx: Option<mpsc::Sender<AudioFrame>>,
    audio_out_rx: Option<mpsc::Receiver<AudioFrame>>,

    last_activity: Instant,

    closed: bool,
    close_count: u32,
    parse_errors: u64,

    ping_interval: Duration,
    read_deadline: Duration,
}

impl CallLink {
    pub fn new(
        registry: Arc<BridgeRegistry>,
        session: Arc<BridgeSession>,
        call_sid: String,
        config: &BridgeConfig,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::channel(config.link_queue_capacity);
        let (out_tx, out_rx) = mpsc::channel(config.link_queue_capacity);
        let scope = session.scope().child_token();
        let session_id = session.session_id().to_string();

        Self {
            link_id: Uuid::new_v4().to_string(),
            session_id,
            call_sid,
            registry,
            session,
            state: LinkState::Connecting,
            scope,
            audio_in: Some(in_tx),
            audio_in_rx: Some(in_rx),
            audio_out_tx: Some(out_tx),
            audio_out_rx: Some(out_rx),
            last_activity: Instant::now(),
            closed: false,
            close_count: 0,
            parse_errors: 0,
            ping_interval: Duration::from_millis(config.ws_ping_interval_ms),
            read_deadline: Duration::from_secs(config.ws_read_deadline_s),
        }
    }

    /// Send a control event (`{event: <name>, ...fields}`) to the provider.
    fn send_event(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        event: &str,
        mut extra: serde_json::Value,
    ) {
        if self.closed {
            debug!(link_id = %self.link_id, event, "suppressing event after close");
            return;
        }

        let mut message = json!({ "event": event });
        if let (Some(fields), Some(extra)) = (message.as_object_mut(), extra.as_object_mut()) {
            fields.append(extra);
        }

        match serde_json::to_string(&message) {
            Ok(text) => ctx.text(text),
            Err(err) => error!(link_id = %self.link_id, %err, "failed to serialize event"),
        }
    }

    /// Parse and dispatch one provider text frame.
    fn handle_provider_event(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let event: ProviderEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                self.parse_errors += 1;
                warn!(link_id = %self.link_id, %err, "unparseable provider message");
                return;
            }
        };

        if matches!(event, ProviderEvent::Unknown) {
            debug!(link_id = %self.link_id, "ignoring unknown provider event");
            return;
        }

        let Some(next) = transition_on(self.state, &event) else {
            self.parse_errors += 1;
            warn!(
                link_id = %self.link_id,
                state = ?self.state,
                event = ?event,
                "provider event not permitted in current state"
            );
            return;
        };

        match event {
            ProviderEvent::Connected => {
                self.state = next;
                info!(call_sid = %self.call_sid, "call connected");
                let timestamp = chrono::Utc::now().timestamp();
                self.send_event(
                    ctx,
                    "connection_ready",
                    json!({ "call_sid": self.call_sid, "timestamp": timestamp }),
                );
            }
            ProviderEvent::Start => {
                self.state = next;
                self.session.mark_streaming_started();
                info!(call_sid = %self.call_sid, "media stream started");
                let timestamp = chrono::Utc::now().timestamp();
                self.send_event(
                    ctx,
                    "stream_started",
                    json!({ "call_sid": self.call_sid, "timestamp": timestamp }),
                );
            }
            ProviderEvent::Media { media } => {
                self.handle_media(&media, ctx);
            }
            ProviderEvent::Stop => {
                self.state = next;
                info!(call_sid = %self.call_sid, "media stream stopped");
                let timestamp = chrono::Utc::now().timestamp();
                self.send_event(
                    ctx,
                    "stream_stopped",
                    json!({ "call_sid": self.call_sid, "timestamp": timestamp }),
                );
            }
            ProviderEvent::Closed => {
                info!(link_id = %self.link_id, "provider sent closed event");
                self.shutdown_link(ctx, ws::CloseCode::Normal);
            }
            ProviderEvent::Unknown => {}
        }
    }

    /// Handle one inbound `media` event: filter the track, decode the
    /// payload, and push it into the link's inbound queue.
    fn handle_media(&mut self, media: &MediaPayload, ctx: &mut ws::WebsocketContext<Self>) {
        let audio = match decode_inbound_media(media) {
            None => return,
            Some(Ok(audio)) => audio,
            Some(Err(err)) => {
                self.parse_errors += 1;
                warn!(link_id = %self.link_id, %err, "invalid base64 media payload");
                return;
            }
        };

        if audio.is_empty() {
            return;
        }

        let Some(audio_in) = &self.audio_in else {
            return;
        };

        match audio_in.try_send(audio) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.session.metrics().record_overrun();
                debug!(link_id = %self.link_id, "link inbound queue full, dropping chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(link_id = %self.link_id, "session queues gone, closing link");
                self.shutdown_link(ctx, ws::CloseCode::Error);
            }
        }
    }

    /// Idempotent close. Every call bumps `close_count` for diagnostics;
    /// only the first actually closes anything. Session teardown is the
    /// registry's job and is requested from `stopped`.
    fn close_link(&mut self) {
        self.close_count += 1;
        if self.closed {
            return;
        }

        self.closed = true;
        self.state = LinkState::Closed;
        self.scope.cancel();
        self.audio_in = None;

        info!(
            link_id = %self.link_id,
            session_id = %self.session_id,
            close_count = self.close_count,
            "provider link closed"
        );
    }

    /// Close the link and stop the actor, sending a best-effort closure
    /// frame (1000 on normal teardown, 1011 on internal failure) while the
    /// context is still writable.
    fn shutdown_link(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: ws::CloseCode) {
        if !self.closed {
            // Best-effort; the peer may already be gone.
            ctx.close(Some(code.into()));
        }
        self.close_link();
        ctx.stop();
    }
}

impl Actor for CallLink {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            link_id = %self.link_id,
            session_id = %self.session_id,
            call_sid = %self.call_sid,
            "provider link established"
        );

        let (Some(audio_in_rx), Some(audio_out_tx), Some(mut audio_out_rx)) = (
            self.audio_in_rx.take(),
            self.audio_out_tx.take(),
            self.audio_out_rx.take(),
        ) else {
            error!(link_id = %self.link_id, "link endpoints already taken");
            ctx.stop();
            return;
        };

        let endpoints = LinkEndpoints {
            audio_in: audio_in_rx,
            audio_out: audio_out_tx,
            scope: self.scope.clone(),
            call_sid: (!self.call_sid.is_empty()).then(|| self.call_sid.clone()),
        };

        if let Err(err) = self.registry.bind_link(&self.session_id, endpoints) {
            error!(session_id = %self.session_id, %err, "failed to bind link to session");
            self.shutdown_link(ctx, ws::CloseCode::Error);
            return;
        }

        // Outbound drain: forward pipeline audio to this actor, which owns
        // the only write path onto the WebSocket.
        let addr = ctx.address();
        let scope = self.scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    frame = audio_out_rx.recv() => {
                        match frame {
                            Some(frame) => addr.do_send(OutboundMedia(frame)),
                            None => break,
                        }
                    }
                }
            }
        });

        // Tell the orchestrator side the link is up before any provider
        // event arrives.
        let timestamp = chrono::Utc::now().timestamp();
        let greeting = json!({
            "session_id": self.session_id,
            "call_session_id": self.link_id,
            "timestamp": timestamp,
        });
        self.send_event(ctx, "connected", greeting);

        // The ping ticker keeps NAT state alive and enforces the read
        // deadline; a stalled peer is detected here rather than on write.
        ctx.run_interval(self.ping_interval, |link, ctx| {
            if link.last_activity.elapsed() > link.read_deadline {
                warn!(
                    link_id = %link.link_id,
                    deadline_s = link.read_deadline.as_secs(),
                    "read deadline exceeded, closing link"
                );
                link.shutdown_link(ctx, ws::CloseCode::Normal);
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.close_link();

        if self.parse_errors > 0 {
            debug!(
                link_id = %self.link_id,
                parse_errors = self.parse_errors,
                "link finished with parse errors"
            );
        }

        // Teardown goes through the registry so the session queues are
        // closed exactly once and the map entry is removed.
        self.registry.close(&self.session_id);

        info!(link_id = %self.link_id, "provider link stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallLink {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_activity = Instant::now();
                self.handle_provider_event(&text, ctx);
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_activity = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_activity = Instant::now();
            }
            Ok(ws::Message::Binary(_)) => {
                // The media-streams protocol is JSON over text frames only.
                self.parse_errors += 1;
                warn!(link_id = %self.link_id, "unexpected binary frame");
            }
            Ok(ws::Message::Close(reason)) => {
                info!(link_id = %self.link_id, ?reason, "peer closed websocket");
                self.shutdown_link(ctx, ws::CloseCode::Normal);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(link_id = %self.link_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(link_id = %self.link_id, %err, "websocket protocol error");
                self.shutdown_link(ctx, ws::CloseCode::Error);
            }
        }
    }
}

impl Handler<OutboundMedia> for CallLink {
    type Result = ();

    fn handle(&mut self, msg: OutboundMedia, ctx: &mut Self::Context) {
        if self.closed || self.state == LinkState::Closed {
            debug!(link_id = %self.link_id, "dropping outbound media after close");
            return;
        }

        match serde_json::to_string(&outbound_media_json(&msg.0)) {
            Ok(text) => ctx.text(text),
            Err(err) => error!(link_id = %self.link_id, %err, "failed to serialize media"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub call_sid: Option<String>,
}

/// WebSocket endpoint handler.
///
/// Validates the session *before* upgrading: an unknown session id is a
/// plain 404, not a doomed WebSocket.
pub async fn call_stream(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    if session_id.trim().is_empty() {
        return Ok(HttpResponse::BadRequest().body("session_id required"));
    }

    let registry = state.bridge();
    let Some(session) = registry.get(&session_id) else {
        warn!(%session_id, "websocket connection for unknown session");
        return Ok(HttpResponse::NotFound().body("session not found"));
    };

    info!(%session_id, "incoming websocket connection");

    let call_sid = query.into_inner().call_sid.unwrap_or_default();
    let link = CallLink::new(registry.clone(), session, call_sid, registry.config());

    ws::start(link, &req, stream)
}
