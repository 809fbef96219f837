//! # Call Session State Machine
//!
//! One `CallSession` exists per bridged call. It owns no sockets: every input
//! (a decoded frame from either side, a connection event, a timer) returns the
//! list of [`RelayAction`]s the caller must perform, in order. The WebSocket
//! actor in `crate::websocket` is the only owner of a session, so inputs from
//! the two connections are processed strictly one after another.
//!
//! ## Handshake States:
//! ```text
//! Connecting ──peer connected──▶ AwaitingAudioPeerReady ──setupComplete──▶ Ready
//!      │                                  │                                 │
//!      └──────────── stop / close / error / timeout ───────────────────────┴──▶ Closed | Error
//! ```
//!
//! ## Invariants:
//! - The `streamSid` is bound by the first `start` event and never changes
//! - No caller audio reaches the peer before `Ready`
//! - No frame goes to the telephony side before the `streamSid` is known
//! - Once `Closed` or `Error`, every input is a no-op

use crate::audio::buffer::PendingAudioQueue;
use crate::audio::pipeline::Transcoder;
use crate::audio::resample::SampleRate;
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::protocol::audio_peer::{AudioPeerCommand, AudioPeerEvent, ServerContent};
use crate::protocol::telephony::{InboundTelephonyEvent, MediaPayload, OutboundMedia, OutboundTelephonyEvent, StreamStart};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    /// Telephony side accepted, audio peer connection being opened
    Connecting,
    /// Setup sent, waiting for the peer's acknowledgement
    AwaitingAudioPeerReady,
    /// Audio flows both ways
    Ready,
    /// Ended normally
    Closed,
    /// Ended by a transport failure or handshake timeout
    Error,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Closed | HandshakeState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeState::Connecting => "connecting",
            HandshakeState::AwaitingAudioPeerReady => "awaiting_audio_peer_ready",
            HandshakeState::Ready => "ready",
            HandshakeState::Closed => "closed",
            HandshakeState::Error => "error",
        }
    }
}

/// Handling of caller audio that arrives before the peer is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreReadyAudioPolicy {
    /// Discard it
    Drop,
    /// Keep the most recent chunks and send them once ready
    #[default]
    Queue,
}

/// Which connection an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Telephony,
    AudioPeer,
}

/// Work the session asks its owner to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    SendToTelephony(OutboundTelephonyEvent),
    SendToAudioPeer(AudioPeerCommand),
    CloseAudioPeer,
    CloseTelephony,
}

/// Per-call settings, captured from the configuration when the call starts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub greeting: Option<String>,
    pub peer_output_rate: SampleRate,
    pub pre_ready_policy: PreReadyAudioPolicy,
    pub max_pending_chunks: usize,
    pub echo_suppression_enabled: bool,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let non_empty = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };

        Self {
            model: config.audio_peer.model.clone(),
            voice: non_empty(&config.audio_peer.voice),
            system_instruction: non_empty(&config.audio_peer.system_instruction),
            greeting: non_empty(&config.audio_peer.greeting),
            peer_output_rate: config.audio_peer.output_sample_rate,
            pre_ready_policy: config.relay.pre_ready_policy,
            max_pending_chunks: config.relay.max_pending_chunks,
            echo_suppression_enabled: config.relay.echo_suppression_enabled,
        }
    }
}

/// Counters for one call, reported when it ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub uplink_chunks: u64,
    pub downlink_chunks: u64,
    pub queued_chunks: u64,
    pub dropped_chunks: u64,
    pub malformed_frames: u64,
    pub interruptions: u64,
}

/// State of one bridged call.
pub struct CallSession {
    /// Correlation id for logs, available before the streamSid
    relay_id: Uuid,
    stream_sid: Option<String>,
    call_sid: Option<String>,
    state: HandshakeState,
    settings: SessionSettings,
    transcoder: Transcoder,
    pending: PendingAudioQueue,
    /// Whether the peer is mid-turn; only consulted for echo suppression
    peer_speaking: bool,
    stats: SessionStats,
}

impl CallSession {
    /// Create a session for a freshly accepted telephony connection.
    pub fn new(settings: SessionSettings, transcoder: Transcoder) -> Self {
        let pending = PendingAudioQueue::new(match settings.pre_ready_policy {
            PreReadyAudioPolicy::Queue => settings.max_pending_chunks,
            PreReadyAudioPolicy::Drop => 0,
        });

        Self {
            relay_id: Uuid::new_v4(),
            stream_sid: None,
            call_sid: None,
            state: HandshakeState::Connecting,
            settings,
            transcoder,
            pending,
            peer_speaking: false,
            stats: SessionStats::default(),
        }
    }

    pub fn relay_id(&self) -> Uuid {
        self.relay_id
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn call_sid(&self) -> Option<&str> {
        self.call_sid.as_deref()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The audio peer connection is open: send the setup message.
    pub fn on_audio_peer_connected(&mut self) -> Vec<RelayAction> {
        match self.state {
            HandshakeState::Connecting => {
                self.state = HandshakeState::AwaitingAudioPeerReady;
                info!(relay_id = %self.relay_id, model = %self.settings.model, "Audio peer connected, sending setup");
                vec![RelayAction::SendToAudioPeer(AudioPeerCommand::Setup {
                    model: self.settings.model.clone(),
                    voice: self.settings.voice.clone(),
                    system_instruction: self.settings.system_instruction.clone(),
                })]
            }
            state if state.is_terminal() => {
                // The call ended while we were still dialling the peer
                vec![RelayAction::CloseAudioPeer]
            }
            state => {
                warn!(relay_id = %self.relay_id, state = state.as_str(), "Duplicate audio peer connect ignored");
                Vec::new()
            }
        }
    }

    /// Opening the audio peer connection failed.
    pub fn on_audio_peer_connect_failed(&mut self, error: &RelayError) -> Vec<RelayAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        warn!(relay_id = %self.relay_id, error = %error, "Could not connect to audio peer");
        self.state = HandshakeState::Error;
        self.pending.clear();
        vec![RelayAction::CloseTelephony]
    }

    /// Handle one decoded frame from the telephony side.
    pub fn on_telephony_event(&mut self, event: InboundTelephonyEvent) -> Vec<RelayAction> {
        if self.state.is_terminal() {
            debug!(relay_id = %self.relay_id, event = event.kind(), "Telephony event after session end ignored");
            return Vec::new();
        }

        match event {
            InboundTelephonyEvent::Connected { protocol } => {
                debug!(relay_id = %self.relay_id, protocol = ?protocol, "Telephony stream connected");
                Vec::new()
            }
            InboundTelephonyEvent::Start { start } => {
                self.bind_stream(start);
                Vec::new()
            }
            InboundTelephonyEvent::Media { media } => self.relay_caller_audio(media),
            InboundTelephonyEvent::Mark { mark } => {
                debug!(relay_id = %self.relay_id, mark = ?mark.map(|m| m.name), "Playback mark reached");
                Vec::new()
            }
            InboundTelephonyEvent::Dtmf { dtmf } => {
                debug!(relay_id = %self.relay_id, digit = ?dtmf.map(|d| d.digit), "DTMF received");
                Vec::new()
            }
            InboundTelephonyEvent::Stop => {
                info!(
                    relay_id = %self.relay_id,
                    stream_sid = ?self.stream_sid,
                    "Telephony stream stopped, closing session"
                );
                self.finish(HandshakeState::Closed);
                vec![RelayAction::CloseAudioPeer, RelayAction::CloseTelephony]
            }
            InboundTelephonyEvent::Unrecognized => {
                debug!(relay_id = %self.relay_id, "Unrecognized telephony event ignored");
                Vec::new()
            }
        }
    }

    /// Handle one decoded frame from the audio peer.
    pub fn on_audio_peer_event(&mut self, event: AudioPeerEvent) -> Vec<RelayAction> {
        if self.state.is_terminal() {
            debug!(relay_id = %self.relay_id, event = event.kind(), "Audio peer event after session end ignored");
            return Vec::new();
        }

        match event {
            AudioPeerEvent::SetupComplete => self.enter_ready(),
            AudioPeerEvent::ServerContent(content) => self.relay_peer_content(content),
            AudioPeerEvent::GoAway => {
                warn!(relay_id = %self.relay_id, "Audio peer announced it will disconnect");
                Vec::new()
            }
            AudioPeerEvent::Unrecognized => {
                debug!(relay_id = %self.relay_id, "Unrecognized audio peer frame ignored");
                Vec::new()
            }
        }
    }

    /// A frame from `side` could not be decoded. It is dropped; the state is unchanged.
    pub fn on_malformed_frame(&mut self, side: Side, error: &RelayError) {
        self.stats.malformed_frames += 1;
        warn!(relay_id = %self.relay_id, side = ?side, error = %error, "Dropping malformed frame");
    }

    /// The handshake timer fired.
    pub fn on_handshake_timeout(&mut self, waited_ms: u64) -> Vec<RelayAction> {
        match self.state {
            HandshakeState::Connecting | HandshakeState::AwaitingAudioPeerReady => {
                let error = RelayError::HandshakeTimeout { waited_ms };
                warn!(relay_id = %self.relay_id, state = self.state.as_str(), error = %error, "Closing session");
                self.finish(HandshakeState::Error);
                vec![RelayAction::CloseAudioPeer, RelayAction::CloseTelephony]
            }
            _ => Vec::new(),
        }
    }

    /// The telephony connection closed without a `stop` event.
    pub fn on_telephony_closed(&mut self) -> Vec<RelayAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        info!(relay_id = %self.relay_id, stream_sid = ?self.stream_sid, "Telephony connection closed");
        self.finish(HandshakeState::Closed);
        vec![RelayAction::CloseAudioPeer]
    }

    /// The audio peer closed its connection.
    pub fn on_audio_peer_closed(&mut self) -> Vec<RelayAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        info!(relay_id = %self.relay_id, stream_sid = ?self.stream_sid, "Audio peer connection closed");
        self.finish(HandshakeState::Closed);
        vec![RelayAction::CloseTelephony]
    }

    /// A socket-level error on `side`. Terminal: the other side is closed too.
    pub fn on_transport_error(&mut self, side: Side, error: &RelayError) -> Vec<RelayAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        warn!(relay_id = %self.relay_id, side = ?side, error = %error, "Transport error, closing session");
        self.finish(HandshakeState::Error);
        match side {
            Side::Telephony => vec![RelayAction::CloseAudioPeer],
            Side::AudioPeer => vec![RelayAction::CloseTelephony],
        }
    }

    fn bind_stream(&mut self, start: StreamStart) {
        if let Some(existing) = &self.stream_sid {
            warn!(
                relay_id = %self.relay_id,
                stream_sid = %existing,
                ignored = %start.stream_sid,
                "Stream already started, ignoring second start event"
            );
            return;
        }

        if let Some(format) = &start.media_format {
            if format.sample_rate != SampleRate::NARROWBAND.as_hz() || format.channels != 1 {
                warn!(
                    relay_id = %self.relay_id,
                    encoding = %format.encoding,
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "Unexpected telephony media format, assuming 8kHz mono μ-law"
                );
            }
        }

        info!(
            relay_id = %self.relay_id,
            stream_sid = %start.stream_sid,
            call_sid = ?start.call_sid,
            "Telephony stream started"
        );
        self.stream_sid = Some(start.stream_sid);
        self.call_sid = start.call_sid;
    }

    fn relay_caller_audio(&mut self, media: MediaPayload) -> Vec<RelayAction> {
        let companded = match general_purpose::STANDARD.decode(media.payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.on_malformed_frame(Side::Telephony, &RelayError::from(e));
                return Vec::new();
            }
        };

        if companded.is_empty() {
            return Vec::new();
        }

        if self.settings.echo_suppression_enabled && self.peer_speaking {
            self.stats.dropped_chunks += 1;
            return Vec::new();
        }

        let pcm = match self.transcoder.uplink(&companded) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(relay_id = %self.relay_id, error = %e, "Dropping caller audio chunk");
                self.stats.dropped_chunks += 1;
                return Vec::new();
            }
        };

        if self.state == HandshakeState::Ready {
            self.stats.uplink_chunks += 1;
            return vec![self.realtime_audio(pcm)];
        }

        match self.settings.pre_ready_policy {
            PreReadyAudioPolicy::Drop => {
                self.stats.dropped_chunks += 1;
            }
            PreReadyAudioPolicy::Queue => {
                if self.pending.push(pcm) {
                    self.stats.dropped_chunks += 1;
                    debug!(
                        relay_id = %self.relay_id,
                        pending = self.pending.len(),
                        "Pre-ready queue full, oldest chunk dropped"
                    );
                }
                self.stats.queued_chunks += 1;
            }
        }
        Vec::new()
    }

    fn enter_ready(&mut self) -> Vec<RelayAction> {
        if self.state != HandshakeState::AwaitingAudioPeerReady {
            warn!(relay_id = %self.relay_id, state = self.state.as_str(), "Unexpected setup acknowledgement ignored");
            return Vec::new();
        }

        self.state = HandshakeState::Ready;
        let mut actions = Vec::new();

        if let Some(text) = &self.settings.greeting {
            actions.push(RelayAction::SendToAudioPeer(AudioPeerCommand::Greeting { text: text.clone() }));
        }

        let queued = self.pending.drain();
        info!(
            relay_id = %self.relay_id,
            flushed_chunks = queued.len(),
            greeting = self.settings.greeting.is_some(),
            "Audio peer ready"
        );

        for pcm in queued {
            self.stats.uplink_chunks += 1;
            actions.push(self.realtime_audio(pcm));
        }

        actions
    }

    fn relay_peer_content(&mut self, content: ServerContent) -> Vec<RelayAction> {
        let mut actions = Vec::new();

        for text in &content.text {
            debug!(relay_id = %self.relay_id, text = %text, "Audio peer text part");
        }

        if content.interrupted {
            self.stats.interruptions += 1;
            self.peer_speaking = false;
            info!(relay_id = %self.relay_id, "Audio peer interrupted, clearing caller playback");

            if let Some(stream_sid) = &self.stream_sid {
                actions.push(RelayAction::SendToTelephony(OutboundTelephonyEvent::Clear {
                    stream_sid: stream_sid.clone(),
                }));
            }
            // Audio in an interrupted frame belongs to the abandoned turn
            return actions;
        }

        for part in content.audio {
            let Some(stream_sid) = self.stream_sid.clone() else {
                debug!(relay_id = %self.relay_id, "Peer audio before stream start dropped");
                self.stats.dropped_chunks += 1;
                continue;
            };

            let rate = part.rate.unwrap_or(self.settings.peer_output_rate);
            match self.transcoder.downlink(&part.pcm, rate) {
                Ok(companded) if companded.is_empty() => {}
                Ok(companded) => {
                    self.peer_speaking = true;
                    self.stats.downlink_chunks += 1;
                    actions.push(RelayAction::SendToTelephony(OutboundTelephonyEvent::Media {
                        stream_sid,
                        media: OutboundMedia {
                            payload: general_purpose::STANDARD.encode(companded),
                        },
                    }));
                }
                Err(e) => {
                    warn!(relay_id = %self.relay_id, error = %e, "Dropping peer audio chunk");
                    self.stats.dropped_chunks += 1;
                }
            }
        }

        if content.turn_complete {
            self.peer_speaking = false;
            debug!(relay_id = %self.relay_id, "Audio peer turn complete");
        }

        actions
    }

    fn realtime_audio(&self, pcm: Vec<u8>) -> RelayAction {
        RelayAction::SendToAudioPeer(AudioPeerCommand::RealtimeAudio {
            pcm,
            rate: self.transcoder.peer_input_rate(),
        })
    }

    fn finish(&mut self, state: HandshakeState) {
        self.state = state;
        if !self.pending.is_empty() {
            debug!(relay_id = %self.relay_id, discarded = self.pending.len(), "Discarding audio queued before ready");
            self.pending.clear();
        }
        self.peer_speaking = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mulaw;
    use crate::audio::pipeline::{bytes_to_samples, samples_to_bytes};
    use crate::audio::resample::ResampleSettings;
    use crate::protocol::audio_peer::AudioPart;

    fn settings() -> SessionSettings {
        SessionSettings::from_config(&AppConfig::default())
    }

    fn session_with(settings: SessionSettings) -> CallSession {
        CallSession::new(settings, Transcoder::new(SampleRate::WIDEBAND_INPUT, ResampleSettings::default()))
    }

    fn session() -> CallSession {
        session_with(settings())
    }

    fn start(sid: &str) -> InboundTelephonyEvent {
        InboundTelephonyEvent::decode(&format!(
            r#"{{"event":"start","start":{{"streamSid":"{}","callSid":"CA123"}}}}"#,
            sid
        ))
        .unwrap()
    }

    fn media(bytes: &[u8]) -> InboundTelephonyEvent {
        InboundTelephonyEvent::Media {
            media: MediaPayload {
                payload: general_purpose::STANDARD.encode(bytes),
                track: Some("inbound".to_string()),
                chunk: None,
                timestamp: None,
            },
        }
    }

    fn peer_audio(samples: &[i16], rate: Option<SampleRate>) -> AudioPeerEvent {
        AudioPeerEvent::ServerContent(ServerContent {
            audio: vec![AudioPart { pcm: samples_to_bytes(samples), rate }],
            ..ServerContent::default()
        })
    }

    fn interrupted() -> AudioPeerEvent {
        AudioPeerEvent::ServerContent(ServerContent {
            interrupted: true,
            ..ServerContent::default()
        })
    }

    fn ready(session: &mut CallSession) -> Vec<RelayAction> {
        session.on_audio_peer_connected();
        session.on_audio_peer_event(AudioPeerEvent::SetupComplete)
    }

    fn realtime_chunks(actions: &[RelayAction]) -> Vec<&Vec<u8>> {
        actions
            .iter()
            .filter_map(|action| match action {
                RelayAction::SendToAudioPeer(AudioPeerCommand::RealtimeAudio { pcm, .. }) => Some(pcm),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_normal_call() {
        let mut s = session();
        assert_eq!(s.state(), HandshakeState::Connecting);

        assert!(s.on_telephony_event(start("CA123")).is_empty());
        assert_eq!(s.stream_sid(), Some("CA123"));

        let setup = s.on_audio_peer_connected();
        assert!(matches!(setup.as_slice(), [RelayAction::SendToAudioPeer(AudioPeerCommand::Setup { .. })]));
        assert_eq!(s.state(), HandshakeState::AwaitingAudioPeerReady);

        let on_ready = s.on_audio_peer_event(AudioPeerEvent::SetupComplete);
        assert_eq!(s.state(), HandshakeState::Ready);
        assert!(matches!(on_ready.as_slice(), [RelayAction::SendToAudioPeer(AudioPeerCommand::Greeting { .. })]));

        // 20ms of caller audio
        let up = s.on_telephony_event(media(&[0x55u8; 160]));
        match up.as_slice() {
            [RelayAction::SendToAudioPeer(AudioPeerCommand::RealtimeAudio { pcm, rate })] => {
                assert_eq!(pcm.len(), 640);
                assert_eq!(*rate, SampleRate::WIDEBAND_INPUT);
            }
            other => panic!("unexpected actions {:?}", other),
        }

        // 20ms of peer audio at 24kHz
        let down = s.on_audio_peer_event(peer_audio(&[2000i16; 480], Some(SampleRate::WIDEBAND_OUTPUT)));
        match down.as_slice() {
            [RelayAction::SendToTelephony(OutboundTelephonyEvent::Media { stream_sid, media })] => {
                assert_eq!(stream_sid, "CA123");
                let bytes = general_purpose::STANDARD.decode(&media.payload).unwrap();
                assert_eq!(bytes.len(), 160);
                assert!(bytes.iter().all(|&b| b == mulaw::encode(2000)));
            }
            other => panic!("unexpected actions {:?}", other),
        }

        assert_eq!(s.stats().uplink_chunks, 1);
        assert_eq!(s.stats().downlink_chunks, 1);
    }

    #[test]
    fn test_no_uplink_before_ready_for_any_interleaving() {
        // Readiness after 0..4 media chunks, with the peer connecting at every possible point
        for chunks_before_ready in 0..4 {
            for connect_after in 0..=chunks_before_ready {
                let mut s = session();
                s.on_telephony_event(start("MZ1"));

                for i in 0..chunks_before_ready {
                    if i == connect_after {
                        let actions = s.on_audio_peer_connected();
                        assert!(realtime_chunks(&actions).is_empty());
                    }
                    let actions = s.on_telephony_event(media(&[i as u8; 160]));
                    assert!(realtime_chunks(&actions).is_empty(), "audio forwarded before ready");
                }
                if connect_after == chunks_before_ready {
                    s.on_audio_peer_connected();
                }

                let flushed = s.on_audio_peer_event(AudioPeerEvent::SetupComplete);
                assert_eq!(realtime_chunks(&flushed).len(), chunks_before_ready);

                let after = s.on_telephony_event(media(&[9u8; 160]));
                assert_eq!(realtime_chunks(&after).len(), 1);
            }
        }
    }

    #[test]
    fn test_queued_audio_is_flushed_in_order_after_greeting() {
        let mut s = session();
        s.on_audio_peer_connected();
        s.on_telephony_event(media(&[0xFF; 160]));
        s.on_telephony_event(media(&[0x80; 160]));
        assert_eq!(s.pending_len(), 2);

        let actions = s.on_audio_peer_event(AudioPeerEvent::SetupComplete);
        assert!(matches!(actions[0], RelayAction::SendToAudioPeer(AudioPeerCommand::Greeting { .. })));

        let chunks = realtime_chunks(&actions);
        assert_eq!(chunks.len(), 2);
        assert_eq!(bytes_to_samples(chunks[0]).unwrap()[0], 0);
        assert_eq!(bytes_to_samples(chunks[1]).unwrap()[0], mulaw::decode(0x80));
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn test_pre_ready_queue_is_bounded() {
        let mut settings = settings();
        settings.max_pending_chunks = 3;
        let mut s = session_with(settings);

        for i in 0..10u8 {
            s.on_telephony_event(media(&[i; 160]));
        }
        assert_eq!(s.pending_len(), 3);
        assert_eq!(s.stats().dropped_chunks, 7);

        let flushed = ready(&mut s);
        let chunks = realtime_chunks(&flushed);
        assert_eq!(chunks.len(), 3);
        // The most recent chunks survive
        assert_eq!(bytes_to_samples(chunks[0]).unwrap()[0], mulaw::decode(7));
    }

    #[test]
    fn test_drop_policy_discards_pre_ready_audio() {
        let mut settings = settings();
        settings.pre_ready_policy = PreReadyAudioPolicy::Drop;
        settings.greeting = None;
        let mut s = session_with(settings);

        s.on_telephony_event(media(&[1; 160]));
        s.on_telephony_event(media(&[2; 160]));
        assert_eq!(s.pending_len(), 0);

        assert!(ready(&mut s).is_empty());
        assert_eq!(s.stats().dropped_chunks, 2);
    }

    #[test]
    fn test_interruption_clears_playback_before_further_media() {
        let mut s = session();
        s.on_telephony_event(start("MZ9"));
        ready(&mut s);

        s.on_audio_peer_event(peer_audio(&[500; 480], None));

        let actions = s.on_audio_peer_event(interrupted());
        assert_eq!(
            actions,
            vec![RelayAction::SendToTelephony(OutboundTelephonyEvent::Clear { stream_sid: "MZ9".to_string() })]
        );
        assert_eq!(s.stats().interruptions, 1);

        // Audio in the same frame as the interruption is discarded
        let mixed = AudioPeerEvent::ServerContent(ServerContent {
            interrupted: true,
            audio: vec![AudioPart { pcm: samples_to_bytes(&[1; 480]), rate: None }],
            ..ServerContent::default()
        });
        let actions = s.on_audio_peer_event(mixed);
        assert!(matches!(actions.as_slice(), [RelayAction::SendToTelephony(OutboundTelephonyEvent::Clear { .. })]));
    }

    #[test]
    fn test_premature_stop_sends_nothing_to_telephony() {
        let mut s = session();
        s.on_audio_peer_connected();

        let actions = s.on_telephony_event(InboundTelephonyEvent::Stop);
        assert_eq!(actions, vec![RelayAction::CloseAudioPeer, RelayAction::CloseTelephony]);
        assert_eq!(s.state(), HandshakeState::Closed);
        assert_eq!(s.stream_sid(), None);

        // Late peer traffic produces nothing
        assert!(s.on_audio_peer_event(peer_audio(&[1; 480], None)).is_empty());
    }

    #[test]
    fn test_no_telephony_frames_without_stream_sid() {
        let mut s = session();
        ready(&mut s);

        assert!(s.on_audio_peer_event(peer_audio(&[100; 480], None)).is_empty());
        assert!(s.on_audio_peer_event(interrupted()).is_empty());
        assert_eq!(s.stats().dropped_chunks, 1);
    }

    #[test]
    fn test_stream_sid_is_bound_once() {
        let mut s = session();
        s.on_telephony_event(start("MZ1"));
        s.on_telephony_event(start("MZ2"));
        assert_eq!(s.stream_sid(), Some("MZ1"));
        assert_eq!(s.call_sid(), Some("CA123"));
    }

    #[test]
    fn test_teardown_symmetry() {
        // stop event
        let mut s = session();
        ready(&mut s);
        let actions = s.on_telephony_event(InboundTelephonyEvent::Stop);
        assert!(actions.contains(&RelayAction::CloseAudioPeer));

        // remote close, either side
        let mut s = session();
        ready(&mut s);
        assert_eq!(s.on_telephony_closed(), vec![RelayAction::CloseAudioPeer]);

        let mut s = session();
        ready(&mut s);
        assert_eq!(s.on_audio_peer_closed(), vec![RelayAction::CloseTelephony]);

        // local transport error, either side
        let err = RelayError::Transport("reset".to_string());
        let mut s = session();
        ready(&mut s);
        assert_eq!(s.on_transport_error(Side::Telephony, &err), vec![RelayAction::CloseAudioPeer]);
        assert_eq!(s.state(), HandshakeState::Error);

        let mut s = session();
        assert_eq!(s.on_transport_error(Side::AudioPeer, &err), vec![RelayAction::CloseTelephony]);
    }

    #[test]
    fn test_closing_is_idempotent() {
        let mut s = session();
        s.on_telephony_event(InboundTelephonyEvent::Stop);

        assert!(s.on_telephony_closed().is_empty());
        assert!(s.on_audio_peer_closed().is_empty());
        assert!(s.on_telephony_event(InboundTelephonyEvent::Stop).is_empty());
        assert!(s.on_handshake_timeout(10).is_empty());

        // A peer connection that completes after teardown is closed straight away
        assert_eq!(s.on_audio_peer_connected(), vec![RelayAction::CloseAudioPeer]);
    }

    #[test]
    fn test_handshake_timeout() {
        let mut s = session();
        s.on_audio_peer_connected();
        s.on_telephony_event(media(&[1; 160]));

        let actions = s.on_handshake_timeout(10_000);
        assert_eq!(actions, vec![RelayAction::CloseAudioPeer, RelayAction::CloseTelephony]);
        assert_eq!(s.state(), HandshakeState::Error);
        assert_eq!(s.pending_len(), 0);

        // Once ready, the timer is harmless
        let mut s = session();
        ready(&mut s);
        assert!(s.on_handshake_timeout(10_000).is_empty());
        assert_eq!(s.state(), HandshakeState::Ready);
    }

    #[test]
    fn test_connect_failure_closes_telephony() {
        let mut s = session();
        let actions = s.on_audio_peer_connect_failed(&RelayError::Transport("refused".to_string()));
        assert_eq!(actions, vec![RelayAction::CloseTelephony]);
        assert_eq!(s.state(), HandshakeState::Error);
    }

    #[test]
    fn test_malformed_payload_does_not_change_state() {
        let mut s = session();
        ready(&mut s);

        let bad = InboundTelephonyEvent::Media {
            media: MediaPayload {
                payload: "%%%".to_string(),
                track: None,
                chunk: None,
                timestamp: None,
            },
        };
        assert!(s.on_telephony_event(bad).is_empty());
        assert_eq!(s.state(), HandshakeState::Ready);
        assert_eq!(s.stats().malformed_frames, 1);
    }

    #[test]
    fn test_misaligned_peer_audio_is_dropped() {
        let mut s = session();
        s.on_telephony_event(start("MZ1"));
        ready(&mut s);

        let odd = AudioPeerEvent::ServerContent(ServerContent {
            audio: vec![AudioPart { pcm: vec![0; 961], rate: None }],
            ..ServerContent::default()
        });
        assert!(s.on_audio_peer_event(odd).is_empty());
        assert_eq!(s.state(), HandshakeState::Ready);
        assert_eq!(s.stats().dropped_chunks, 1);
    }

    #[test]
    fn test_echo_suppression_gates_uplink_while_peer_speaks() {
        let mut settings = settings();
        settings.echo_suppression_enabled = true;
        let mut s = session_with(settings);
        s.on_telephony_event(start("MZ1"));
        ready(&mut s);

        s.on_audio_peer_event(peer_audio(&[300; 480], None));
        assert!(s.on_telephony_event(media(&[1; 160])).is_empty());

        let done = AudioPeerEvent::ServerContent(ServerContent {
            turn_complete: true,
            ..ServerContent::default()
        });
        s.on_audio_peer_event(done);
        assert_eq!(realtime_chunks(&s.on_telephony_event(media(&[1; 160]))).len(), 1);
    }

    #[test]
    fn test_echo_suppression_disabled_by_default() {
        let mut s = session();
        s.on_telephony_event(start("MZ1"));
        ready(&mut s);

        s.on_audio_peer_event(peer_audio(&[300; 480], None));
        assert_eq!(realtime_chunks(&s.on_telephony_event(media(&[1; 160]))).len(), 1);
    }
}
