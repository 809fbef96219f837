//! # Media Stream WebSocket Handler
//!
//! The telephony provider connects to `/media-stream` once the call's TwiML
//! has been fetched. Each connection becomes one `MediaStreamSocket` actor,
//! which owns:
//! - the telephony WebSocket (the actor's own context)
//! - the outbound link to the audio peer, opened when the actor starts
//! - the [`CallSession`] deciding what to do with every frame
//!
//! ## Lifecycle:
//! 1. **Upgrade**: refused with 503 when the concurrent call limit is reached
//! 2. **Start**: heartbeat timer, audio peer connect, handshake timer
//! 3. **Relay**: frames from both sockets arrive in the actor's mailbox and
//!    are fed to the session one at a time; its actions are executed in order
//! 4. **Stop**: either side closing ends the call and closes the other side;
//!    the call slot is released and its counters are recorded

use crate::audio::pipeline::Transcoder;
use crate::config::AppConfig;
use crate::error::{AppError, RelayError};
use crate::protocol::audio_peer::WireSchema;
use crate::protocol::telephony::InboundTelephonyEvent;
use crate::relay::peer::{self, AudioPeerLink};
use crate::relay::session::{CallSession, RelayAction, SessionSettings, Side};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

/// Silence from the telephony side tolerated before the call is dropped,
/// as a multiple of the heartbeat interval.
const HEARTBEAT_TIMEOUT_FACTOR: u32 = 2;

/// One bridged call.
///
/// ## Actor Model:
/// The actor handles one message at a time. Telephony frames, peer frames and
/// timers all arrive through its mailbox, so `session` never needs a lock.
pub struct MediaStreamSocket {
    session: CallSession,
    link: Option<AudioPeerLink>,
    wire_schema: WireSchema,
    peer_url: String,
    heartbeat_interval: Duration,
    handshake_timeout: Duration,
    last_heartbeat: Instant,
    app_state: AppState,
}

impl MediaStreamSocket {
    /// Build the actor from a configuration snapshot.
    pub fn new(config: &AppConfig, app_state: AppState) -> Self {
        let transcoder = Transcoder::new(config.audio_peer.input_sample_rate, config.relay.resample_settings());

        Self {
            session: CallSession::new(SessionSettings::from_config(config), transcoder),
            link: None,
            wire_schema: config.audio_peer.wire_schema,
            peer_url: config.audio_peer.connect_url(),
            heartbeat_interval: Duration::from_secs(config.server.heartbeat_interval_secs),
            handshake_timeout: Duration::from_millis(config.audio_peer.handshake_timeout_ms),
            last_heartbeat: Instant::now(),
            app_state,
        }
    }

    /// Execute session actions in order, including any follow-ups caused by a
    /// failed send.
    ///
    /// ## Rust Concepts:
    /// - **VecDeque**: follow-up actions are appended behind the ones still pending
    /// - **Option::take**: moves the link out, leaving `None` behind
    fn apply(&mut self, actions: Vec<RelayAction>, ctx: &mut ws::WebsocketContext<Self>) {
        let mut queue: VecDeque<RelayAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                RelayAction::SendToTelephony(event) => match event.encode() {
                    Ok(text) => ctx.text(text),
                    Err(e) => warn!(relay_id = %self.session.relay_id(), error = %e, "Could not encode telephony frame"),
                },
                RelayAction::SendToAudioPeer(command) => {
                    let kind = command.kind();
                    let result = self
                        .wire_schema
                        .encode(&command)
                        .and_then(|text| match &self.link {
                            Some(link) => link.send_text(text),
                            None => Err(RelayError::Transport("audio peer is not connected".to_string())),
                        });

                    if let Err(e) = result {
                        if e.is_fatal() {
                            queue.extend(self.session.on_transport_error(Side::AudioPeer, &e));
                        } else {
                            warn!(relay_id = %self.session.relay_id(), command = kind, error = %e, "Dropping audio peer command");
                        }
                    }
                }
                RelayAction::CloseAudioPeer => {
                    if let Some(mut link) = self.link.take() {
                        link.close();
                    }
                }
                RelayAction::CloseTelephony => {
                    ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Normal)));
                    ctx.stop();
                }
            }
        }
    }

    fn handle_telephony_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match InboundTelephonyEvent::decode(text) {
            Ok(event) => {
                let actions = self.session.on_telephony_event(event);
                self.apply(actions, ctx);
            }
            Err(e) => self.session.on_malformed_frame(Side::Telephony, &e),
        }
    }

    fn handle_peer_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match self.wire_schema.decode(text) {
            Ok(event) => {
                let actions = self.session.on_audio_peer_event(event);
                self.apply(actions, ctx);
            }
            Err(e) => self.session.on_malformed_frame(Side::AudioPeer, &e),
        }
    }

    /// Dial the audio peer without blocking the actor.
    ///
    /// ## Rust Concepts:
    /// - **into_actor**: turns the future into an `ActorFuture`, so its
    ///   completion closure gets `&mut self` and the context back
    /// - **add_stream**: peer frames are then delivered as `StreamHandler` messages
    fn connect_audio_peer(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let url = self.peer_url.clone();

        let connect = async move { peer::connect(&url).await }
            .into_actor(self)
            .map(|result, act, ctx| match result {
                Ok((link, stream)) => {
                    act.link = Some(link);
                    ctx.add_stream(stream);
                    let actions = act.session.on_audio_peer_connected();
                    act.apply(actions, ctx);
                }
                Err(e) => {
                    let actions = act.session.on_audio_peer_connect_failed(&e);
                    act.apply(actions, ctx);
                }
            });
        ctx.spawn(connect);
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(relay_id = %self.session.relay_id(), "Media stream connected");

        let timeout = self.heartbeat_interval * HEARTBEAT_TIMEOUT_FACTOR;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                let error = RelayError::Transport("telephony heartbeat timeout".to_string());
                let actions = act.session.on_transport_error(Side::Telephony, &error);
                act.apply(actions, ctx);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let waited_ms = self.handshake_timeout.as_millis() as u64;
        ctx.run_later(self.handshake_timeout, move |act, ctx| {
            let actions = act.session.on_handshake_timeout(waited_ms);
            act.apply(actions, ctx);
        });

        self.connect_audio_peer(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Covers stops the session did not initiate, such as a heartbeat timeout
        let _ = self.session.on_telephony_closed();
        if let Some(mut link) = self.link.take() {
            link.close();
        }

        let stats = self.session.stats();
        info!(
            relay_id = %self.session.relay_id(),
            stream_sid = ?self.session.stream_sid(),
            call_sid = ?self.session.call_sid(),
            state = self.session.state().as_str(),
            uplink_chunks = stats.uplink_chunks,
            downlink_chunks = stats.downlink_chunks,
            dropped_chunks = stats.dropped_chunks,
            interruptions = stats.interruptions,
            "Media stream closed"
        );

        self.app_state.record_session(stats);
        self.app_state.decrement_active_sessions();
    }
}

/// Frames from the telephony provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_telephony_text(&text, ctx);
            }
            Ok(ws::Message::Binary(bytes)) => {
                self.last_heartbeat = Instant::now();
                match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_telephony_text(text, ctx),
                    Err(e) => self.session.on_malformed_frame(
                        Side::Telephony,
                        &RelayError::MalformedFrame(format!("binary frame is not UTF-8: {}", e)),
                    ),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(relay_id = %self.session.relay_id(), reason = ?reason, "Telephony close frame");
                let actions = self.session.on_telephony_closed();
                self.apply(actions, ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                let error = RelayError::Transport(e.to_string());
                let actions = self.session.on_transport_error(Side::Telephony, &error);
                self.apply(actions, ctx);
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        let actions = self.session.on_telephony_closed();
        self.apply(actions, ctx);
        ctx.stop();
    }
}

/// Frames from the audio peer, attached once its connection is open.
impl StreamHandler<Result<tungstenite::Message, tungstenite::Error>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<tungstenite::Message, tungstenite::Error>, ctx: &mut Self::Context) {
        match msg {
            Ok(tungstenite::Message::Text(text)) => self.handle_peer_text(&text, ctx),
            // The peer may deliver its JSON in binary frames
            Ok(tungstenite::Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.handle_peer_text(text, ctx),
                Err(e) => self.session.on_malformed_frame(
                    Side::AudioPeer,
                    &RelayError::MalformedFrame(format!("binary frame is not UTF-8: {}", e)),
                ),
            },
            Ok(tungstenite::Message::Close(frame)) => {
                debug!(relay_id = %self.session.relay_id(), frame = ?frame, "Audio peer close frame");
                let actions = self.session.on_audio_peer_closed();
                self.apply(actions, ctx);
            }
            Ok(_) => {}
            Err(e) => {
                let error = RelayError::from(e);
                let actions = self.session.on_transport_error(Side::AudioPeer, &error);
                self.apply(actions, ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        let actions = self.session.on_audio_peer_closed();
        self.apply(actions, ctx);
    }
}

/// `GET /media-stream`: upgrade the telephony provider's request to a WebSocket.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();
    let limit = config.performance.max_concurrent_sessions;

    if !app_state.try_acquire_session(limit) {
        warn!(limit, peer = ?req.connection_info().peer_addr(), "Rejecting media stream, call limit reached");
        return Err(AppError::ServiceUnavailable(format!("Maximum concurrent calls ({}) reached", limit)).into());
    }

    info!(
        peer = ?req.connection_info().peer_addr(),
        active_sessions = app_state.active_sessions(),
        limit,
        "Media stream upgrade requested"
    );
    let socket = MediaStreamSocket::new(&config, app_state.get_ref().clone());

    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        // The actor never started, so its slot is released here
        app_state.decrement_active_sessions();
    }
    response
}
