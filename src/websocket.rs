//! # WebSocket Transport
//!
//! One actor per connected client. The actor owns the connection lifecycle:
//! it creates and registers the [`ClientSession`] on start, feeds inbound
//! frames to the ingest router, drains the session's outbox back onto the
//! socket, and marks the session `Closed` when the connection ends so the
//! reaper can free it.
//!
//! RFC 6455 framing, masking, the upgrade handshake and control-frame
//! bookkeeping are `actix-web-actors`' job; this module only configures the
//! maximum frame size and answers PING with the mirrored payload.

use crate::audio::{ClientSession, SessionRegistry, SessionState};
use crate::ingest::{self, ServerMessage};
use crate::speaker::SpeakerIdentifier;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Fresh opaque session id. Ids are never reused across reconnects.
fn next_session_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("client_{}", &uuid[..8])
}

/// Actor bridging one WebSocket connection to the recognition pipeline.
pub struct StreamSocket {
    state: AppState,
    registry: Arc<SessionRegistry>,
    speaker: Arc<dyn SpeakerIdentifier>,
    session: Option<Arc<ClientSession>>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    max_buffer_samples: usize,
}

impl StreamSocket {
    pub fn new(
        state: AppState,
        registry: Arc<SessionRegistry>,
        speaker: Arc<dyn SpeakerIdentifier>,
    ) -> Self {
        let config = state.get_config();
        Self {
            registry,
            speaker,
            session: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.recognition.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.recognition.client_timeout_secs),
            max_buffer_samples: config.max_buffer_samples(),
            state,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |actor, ctx| {
            if Instant::now().duration_since(actor.last_heartbeat) > actor.client_timeout {
                warn!("client heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for StreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new(
            next_session_id(),
            self.max_buffer_samples,
            outbox_tx,
        ));

        info!(session_id = %session.id, "client connected");
        self.registry.insert(Arc::clone(&session));
        self.state.session_opened();
        self.session = Some(session);

        ctx.add_stream(UnboundedReceiverStream::new(outbox_rx));
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = &self.session {
            info!(session_id = %session.id, "client disconnected");
            session.mark_closed();
        }
        self.state.session_closed();
        // The reaper frees the registry entry once no decode is in flight.
    }
}

/// Outbound path: recognition results queued on the session outbox.
impl StreamHandler<ServerMessage> for StreamSocket {
    fn handle(&mut self, message: ServerMessage, ctx: &mut Self::Context) {
        match serde_json::to_string(&message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "failed to serialize outbound message"),
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        // The outbox sender lives in the session; it only drops after the
        // session is reaped, by which time the actor is long gone.
    }
}

/// Inbound path: frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamSocket {
    fn handle(&mut self, message: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let Some(session) = self.session.clone() else {
            return;
        };

        match message {
            Ok(ws::Message::Text(text)) => {
                ingest::handle_text(&self.state, &session, &text);
            }
            Ok(ws::Message::Binary(payload)) => {
                ingest::handle_binary(&self.state, &session, self.speaker.as_ref(), &payload);
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %session.id, ?reason, "close frame received");
                session.mark_closed();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented messages are outside the client contract.
                warn!(session_id = %session.id, "unexpected continuation frame");
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %session.id, error = %err, "websocket protocol error");
                session.set_state(SessionState::Closing);
                ctx.stop();
            }
        }
    }
}

/// HTTP entry point: upgrade any GET into a streaming session.
pub async fn stream_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    registry: web::Data<Arc<SessionRegistry>>,
    speaker: web::Data<Arc<dyn SpeakerIdentifier>>,
) -> ActixResult<HttpResponse> {
    let max_frame_bytes = state.get_config().recognition.max_frame_bytes;
    let socket = StreamSocket::new(
        state.get_ref().clone(),
        registry.get_ref().clone(),
        speaker.get_ref().clone(),
    );

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
