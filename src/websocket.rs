//! # Room WebSocket Handler
//!
//! One actor per connected participant. The actor owns the participant's
//! session (state machine, audio buffer, liveness clock) and is the only
//! place that writes to the socket: room broadcasts reach it as mailbox
//! messages, so frames to one participant go out in the order they were sent.
//!
//! ## Connection Flow:
//! 1. `GET /ws/{room_id}?target_lang=xx` upgrades to a WebSocket
//! 2. `started()` joins the room and replies `connection_established`
//! 3. Text frames are control messages, binary frames are PCM audio
//! 4. Flushed audio goes to the translation dispatcher, never blocking the loop
//! 5. `stopped()` leaves the room and tells the others the new head count

use crate::audio::{
    AudioBufferConfig, AudioProcessor, CloseReason, ControlAction, Liveness, ParticipantSession,
    PcmFormat, SessionConfig, SessionState,
};
use crate::config::AppConfig;
use crate::error::{AppError, RelayError};
use crate::protocol::{Outbound, ServerMessage};
use crate::room::{Participant, ParticipantSink};
use crate::state::AppState;
use crate::translation::FlushJob;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Frames a participant may have queued before it counts as too slow.
const OUTBOUND_MAILBOX_CAPACITY: usize = 256;

/// A frame from the room for this participant.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver(pub Outbound);

/// The room dropped this participant after a failed delivery.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Evict;

/// Delivers room frames through the actor mailbox.
struct SocketSink {
    addr: Addr<ParticipantSocket>,
}

impl ParticipantSink for SocketSink {
    fn deliver(&self, frame: Outbound) -> Result<(), RelayError> {
        self.addr.try_send(Deliver(frame)).map_err(|e| match e {
            SendError::Full(_) => RelayError::Connection("outbound queue full".to_string()),
            SendError::Closed(_) => RelayError::Connection("connection closed".to_string()),
        })
    }

    fn evict(&self) {
        self.addr.do_send(Evict);
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinQuery {
    pub target_lang: Option<String>,
}

pub struct ParticipantSocket {
    session: ParticipantSession,
    state: web::Data<AppState>,
}

impl ParticipantSocket {
    pub fn new(session: ParticipantSession, state: web::Data<AppState>) -> Self {
        Self { session, state }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        ctx.text(message.to_json());
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, error: &RelayError) {
        self.send_event(
            ctx,
            &ServerMessage::Error {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        );
    }

    fn join_room(&mut self, sink: Arc<dyn ParticipantSink>) -> Result<usize, RelayError> {
        let participant = Participant::new(
            self.session.id.clone(),
            self.session.room_id.clone(),
            self.session.language.clone(),
            self.session.flags(),
            sink,
        );
        let count = self.state.registry.add_participant(participant)?;
        self.session.activate()?;
        Ok(count)
    }

    /// Move to Closing. Returns false if the session was already shutting down.
    fn begin_close(&mut self, reason: &CloseReason) -> bool {
        match self.session.state() {
            SessionState::Connecting | SessionState::Active => {
                if let Err(e) = self.session.begin_close(reason) {
                    error!(participant_id = %self.session.id, error = %e, "Close rejected");
                    return false;
                }
                info!(
                    room_id = %self.session.room_id,
                    participant_id = %self.session.id,
                    reason = reason.as_str(),
                    "Closing session"
                );
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    fn close(&mut self, reason: CloseReason, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.begin_close(&reason) {
            return;
        }
        let code = match reason {
            CloseReason::ClientRequested | CloseReason::TransportClosed => ws::CloseCode::Normal,
            CloseReason::IdleTimeout | CloseReason::Evicted => ws::CloseCode::Away,
            CloseReason::ProtocolViolation(_) => ws::CloseCode::Protocol,
            CloseReason::HandshakeFailed(_) => ws::CloseCode::Policy,
        };
        ctx.close(Some(code.into()));
        ctx.stop();
    }

    /// Leave the room and finish the lifecycle. Safe to call more than once.
    fn leave_room(&mut self) {
        self.begin_close(&CloseReason::TransportClosed);

        let room_id = self.session.room_id.clone();
        if self.state.registry.remove_participant(&room_id, &self.session.id) {
            self.state.registry.broadcast_participant_count(&room_id);
        }

        if self.session.state() == SessionState::Closing {
            if let Err(e) = self.session.finish_close() {
                error!(participant_id = %self.session.id, error = %e, "Teardown failed");
            }
        }
    }

    fn apply(&mut self, action: ControlAction, ctx: &mut ws::WebsocketContext<Self>) {
        match action {
            ControlAction::Pong => self.send_event(ctx, &ServerMessage::Pong),
            ControlAction::Close => self.close(CloseReason::ClientRequested, ctx),
            ControlAction::Reject(err) => {
                warn!(participant_id = %self.session.id, error = %err, "Frame rejected");
                self.send_error(ctx, &err);
            }
            ControlAction::CloseProtocol(err) => {
                warn!(participant_id = %self.session.id, error = %err, "Too many protocol errors");
                self.send_error(ctx, &err);
                self.close(CloseReason::ProtocolViolation(err.to_string()), ctx);
            }
        }
    }

    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match self.session.on_audio_at(data, Instant::now()) {
            Ok(Some(audio)) => {
                debug!(
                    room_id = %self.session.room_id,
                    participant_id = %self.session.id,
                    audio_bytes = audio.len(),
                    "Dispatching flush"
                );
                self.state.dispatcher.dispatch(FlushJob {
                    room_id: self.session.room_id.clone(),
                    speaker_id: self.session.id.clone(),
                    speaker_lang: self.session.language.clone(),
                    audio,
                    flags: self.session.flags(),
                });
            }
            Ok(None) => {}
            Err(action) => self.apply(action, ctx),
        }
    }

    fn tick(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.session.check_liveness(Instant::now()) {
            Liveness::Healthy => {}
            Liveness::SendKeepalive => ctx.ping(b""),
            Liveness::TimedOut => self.close_idle(ctx),
        }
    }

    /// Arm a one-shot check at the current idle deadline. Traffic before it
    /// fires pushes the deadline out and the check re-arms itself.
    fn schedule_idle_check(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let wait = self.session.idle_deadline().saturating_duration_since(Instant::now());
        ctx.run_later(wait, |act, ctx| {
            if act.session.state() != SessionState::Active {
                return;
            }
            match act.session.check_liveness(Instant::now()) {
                Liveness::TimedOut => act.close_idle(ctx),
                _ => act.schedule_idle_check(ctx),
            }
        });
    }

    fn close_idle(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let err = RelayError::Timeout {
            idle_secs: self.session.idle_timeout().as_secs(),
        };
        warn!(participant_id = %self.session.id, error = %err, "Session idle");
        self.close(CloseReason::IdleTimeout, ctx);
    }
}

impl Actor for ParticipantSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(OUTBOUND_MAILBOX_CAPACITY);

        let sink: Arc<dyn ParticipantSink> = Arc::new(SocketSink { addr: ctx.address() });
        match self.join_room(sink) {
            Ok(count) => {
                info!(
                    room_id = %self.session.room_id,
                    participant_id = %self.session.id,
                    language = %self.session.language,
                    participants = count,
                    "WebSocket session started"
                );
                self.send_event(
                    ctx,
                    &ServerMessage::ConnectionEstablished {
                        room_id: self.session.room_id.clone(),
                        user_id: self.session.id.to_string(),
                    },
                );
                self.state.registry.broadcast_participant_count(&self.session.room_id);
            }
            Err(err) => {
                error!(room_id = %self.session.room_id, error = %err, "Join failed");
                self.send_error(ctx, &err);
                self.close(CloseReason::HandshakeFailed(err.to_string()), ctx);
                return;
            }
        }

        let ping_interval = self.state.get_config().session.ping_interval();
        ctx.run_interval(ping_interval, |act, ctx| act.tick(ctx));
        self.schedule_idle_check(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.leave_room();
        self.state.close_session();
        let stats = self.session.stats();
        info!(
            room_id = %self.session.room_id,
            participant_id = %self.session.id,
            audio_bytes = stats.audio_bytes,
            flushes = stats.flushes,
            deferred_flushes = stats.deferred_flushes,
            unsent_bytes = self.session.buffered_bytes(),
            "WebSocket session stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ParticipantSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                let action = self.session.on_text_at(&text, Instant::now());
                self.apply(action, ctx);
            }
            Ok(ws::Message::Binary(data)) => self.handle_audio(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                self.session.touch(Instant::now());
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => self.session.touch(Instant::now()),
            Ok(ws::Message::Close(reason)) => {
                debug!(participant_id = %self.session.id, ?reason, "Client closed connection");
                self.close(CloseReason::TransportClosed, ctx);
            }
            Ok(ws::Message::Continuation(_)) => {
                let err = RelayError::Protocol("Fragmented frames are not supported".to_string());
                let action = self.session.on_protocol_error(err);
                self.apply(action, ctx);
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(participant_id = %self.session.id, error = %err, "WebSocket protocol error");
                self.close(CloseReason::ProtocolViolation(err.to_string()), ctx);
            }
        }
    }
}

impl Handler<Deliver> for ParticipantSocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        match msg.0 {
            Outbound::Event(event) => ctx.text(event.to_json()),
            Outbound::Audio(bytes) => ctx.binary(bytes),
        }
    }
}

impl Handler<Evict> for ParticipantSocket {
    type Result = ();

    fn handle(&mut self, _msg: Evict, ctx: &mut Self::Context) {
        self.close(CloseReason::Evicted, ctx);
    }
}

/// Room and language tags: 1-64 chars of `[A-Za-z0-9_-]`.
fn is_valid_tag(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn new_session(room_id: String, language: String, config: &AppConfig) -> ParticipantSession {
    ParticipantSession::new(
        room_id,
        language,
        SessionConfig {
            buffer: AudioBufferConfig::from_settings(&config.audio),
            ping_interval: config.session.ping_interval(),
            idle_timeout: config.session.idle_timeout(),
            max_protocol_errors: config.session.max_protocol_errors,
        },
        AudioProcessor::new(PcmFormat::from_settings(&config.audio)),
        Instant::now(),
    )
}

/// WebSocket endpoint handler for `/ws/{room_id}`.
pub async fn room_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<JoinQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let room_id = path.into_inner();
    let config = state.get_config();
    let language = query
        .into_inner()
        .target_lang
        .unwrap_or_else(|| config.session.default_target_lang.clone());

    if !is_valid_tag(&room_id) {
        return Err(AppError::BadRequest(format!("Invalid room id: {:?}", room_id)).into());
    }
    if !is_valid_tag(&language) {
        return Err(AppError::BadRequest(format!("Invalid target_lang: {:?}", language)).into());
    }

    if !state.try_open_session(config.performance.max_concurrent_sessions) {
        warn!(room_id = %room_id, "Session limit reached, rejecting connection");
        return Err(AppError::Unavailable("Too many active sessions".to_string()).into());
    }

    info!(
        room_id = %room_id,
        language = %language,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let socket = ParticipantSocket::new(new_session(room_id, language, &config), state.clone());
    ws::start(socket, &req, stream).map_err(|e| {
        // The actor never started, so stopped() will not release the slot
        state.close_session();
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::participant::testing::ChannelSink;
    use crate::state::tests::test_state;
    use std::time::Duration;

    #[test]
    fn test_tag_validation() {
        assert!(is_valid_tag("room-1a2b3c"));
        assert!(is_valid_tag("en"));
        assert!(is_valid_tag("zh_Hant"));
        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag("../etc"));
        assert!(!is_valid_tag(&"x".repeat(65)));
    }

    #[test]
    fn test_idle_session_is_closed_and_removed() {
        let config = AppConfig::default();
        let state = web::Data::new(test_state(config.clone()));

        let mut socket = ParticipantSocket::new(new_session("r1".into(), "es".into(), &config), state.clone());
        let (own_sink, _own_rx) = ChannelSink::new();
        socket.join_room(own_sink).unwrap();

        let other = new_session("r1".into(), "en".into(), &config);
        let (other_sink, mut other_rx) = ChannelSink::new();
        state
            .registry
            .add_participant(Participant::new(
                other.id.clone(),
                "r1".into(),
                "en".into(),
                other.flags(),
                other_sink,
            ))
            .unwrap();

        let later = Instant::now() + config.session.idle_timeout() + Duration::from_secs(1);
        assert_eq!(socket.session.check_liveness(later), Liveness::TimedOut);

        assert!(socket.begin_close(&CloseReason::IdleTimeout));
        socket.leave_room();

        assert_eq!(socket.session.state(), SessionState::Closed);
        assert!(socket.session.flags().is_closed());
        assert!(!state
            .registry
            .get("r1")
            .unwrap()
            .snapshot()
            .iter()
            .any(|p| p.id == socket.session.id));
        assert_eq!(
            other_rx.try_recv().unwrap(),
            Outbound::Event(ServerMessage::ParticipantCount { count: 1 })
        );

        // Last one out drops the room
        state.registry.remove_participant("r1", &other.id);
        assert!(state.registry.get("r1").is_none());

        // Teardown is idempotent
        socket.leave_room();
        assert_eq!(socket.session.state(), SessionState::Closed);
    }

    #[test]
    fn test_duplicate_join_is_rejected() {
        let config = AppConfig::default();
        let state = web::Data::new(test_state(config.clone()));

        let mut socket = ParticipantSocket::new(new_session("r1".into(), "es".into(), &config), state.clone());
        let (sink, _rx) = ChannelSink::new();
        socket.join_room(sink.clone()).unwrap();

        let mut clone = ParticipantSocket::new(new_session("r1".into(), "es".into(), &config), state.clone());
        clone.session.id = socket.session.id.clone();
        assert!(matches!(clone.join_room(sink), Err(RelayError::Membership(_))));
        assert_eq!(clone.session.state(), SessionState::Connecting);
        assert_eq!(state.registry.participant_count("r1"), 1);
    }
}
