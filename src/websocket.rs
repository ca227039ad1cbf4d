//! # Voice WebSocket Handler
//!
//! Bridges one WebSocket connection to one session task.
//! Clients connect to `/ws/voice/{session_id}` (or `/ws/voice` for a server-generated id).
//!
//! ## Connection Flow:
//! 1. **Upgrade**: the HTTP request is upgraded and a `VoiceWebSocket` actor is started
//! 2. **Session task**: the actor spawns [`run_session`] with two channels, one per direction
//! 3. **Inbound**: text frames are decoded into [`InboundFrame`]s, binary frames become audio
//! 4. **Outbound**: every [`OutboundEvent`] the session emits is written as a JSON text frame
//! 5. **Close**: whichever side finishes first tears the other down
//!
//! ## Why an actor plus a task:
//! Actix actors own the socket, but the session logic is plain async code that is
//! easier to test without a socket. The channels are the only link between them.

use crate::state::AppState;
use crate::voice::protocol::{EventSink, InboundFrame, OutboundEvent};
use crate::voice::session::{run_session, SessionRuntime};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_SESSION_ID_LEN: usize = 128;

/// Channel ends handed over to the session task once the actor starts.
struct PendingSession {
    frames: mpsc::UnboundedReceiver<InboundFrame>,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<OutboundEvent>,
}

/// WebSocket actor for one voice connection.
///
/// ## Actor Model:
/// Each connection is an independent actor. It never touches session state
/// directly; it only forwards frames in and writes events out.
pub struct VoiceWebSocket {
    session_id: String,
    runtime: SessionRuntime,

    /// Inbound frames; dropping it tells the session task the client left
    frames: mpsc::UnboundedSender<InboundFrame>,

    /// Taken in `started`
    pending: Option<PendingSession>,

    /// Last ping/pong seen from the client
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(session_id: String, runtime: SessionRuntime) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sink, events) = EventSink::channel();

        Self {
            session_id,
            runtime,
            frames: frames_tx,
            pending: Some(PendingSession {
                frames: frames_rx,
                sink,
                events,
            }),
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        if self.frames.send(frame).is_err() {
            // the session task has already finished
            debug!(session_id = %self.session_id, "Frame after session end, closing");
            ctx.stop();
        }
    }

    fn handle_text(&self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match InboundFrame::decode_text(text) {
            Ok(frame) => self.forward(frame, ctx),
            Err(err) => warn!(session_id = %self.session_id, "{}", err),
        }
    }
}

/// Implement Actor trait for WebSocket handling.
impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        if let Some(pending) = self.pending.take() {
            ctx.add_stream(UnboundedReceiverStream::new(pending.events));
            tokio::spawn(run_session(
                self.runtime.clone(),
                self.session_id.clone(),
                pending.frames,
                pending.sink,
            ));
        }

        // Start heartbeat timer
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Called when the WebSocket connection stops.
    ///
    /// Dropping the actor drops `frames`, which ends the session task.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

/// Handle incoming WebSocket messages from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.forward(InboundFrame::Audio(data.to_vec()), ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Write session events to the client, in order.
impl StreamHandler<OutboundEvent> for VoiceWebSocket {
    fn handle(&mut self, event: OutboundEvent, ctx: &mut Self::Context) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session_id, "Failed to serialize event: {}", err),
        }
    }

    /// The session task ended and dropped its sink.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Session task finished, closing socket");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.trim().is_empty() && session_id.len() <= MAX_SESSION_ID_LEN
}

/// `GET /ws/voice`: upgrade with a server-generated session id.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = uuid::Uuid::new_v4().to_string();
    start_session(session_id, &req, stream, &state)
}

/// `GET /ws/voice/{session_id}`: upgrade with a client-chosen session id.
pub async fn voice_websocket_with_id(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    if !is_valid_session_id(&session_id) {
        warn!(len = session_id.len(), "Rejected invalid session id");
        return Ok(HttpResponse::BadRequest().json(json!({
            "error": {
                "type": "bad_request",
                "message": format!("Session id must be 1-{} characters", MAX_SESSION_ID_LEN),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }
    start_session(session_id, &req, stream, &state)
}

/// Upgrade the HTTP request and hand the socket to a new actor.
fn start_session(
    session_id: String,
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState,
) -> ActixResult<HttpResponse> {
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New voice connection"
    );
    ws::start(VoiceWebSocket::new(session_id, state.runtime.clone()), req, stream)
}
