//! One negotiated peer session: lazy peer-connection construction, offer
//! pairing, ICE plumbing, connection-state handling with a disconnect grace
//! period, data-channel roles, and the telemetry sink.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use hidbridge_common::ws::SignalSender;
use hidbridge_core::config::{
    env_or, AbrSettings, CodecMode, EncoderMode, QualityPreset, RestartPolicy, SourceMode,
};
use hidbridge_core::pairing::Pairing;
use hidbridge_core::pipeline::{resolve_codec, VideoPipelineSpec};
use hidbridge_core::protocol::{kind, SignalKind, SignalMessage};

use crate::stream::{run_video_stream, StreamSettings};

/// Browsers can transiently enter `disconnected` and recover; keep the
/// peer connection and stream alive for this long before tearing down.
const DISCONNECT_GRACE: Duration = Duration::from_secs(25);

/// Session-scoped configuration resolved from the CLI.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub room: String,
    pub stun: String,
    pub source_mode: SourceMode,
    pub quality_preset: QualityPreset,
    pub image_quality: u32,
    pub encoder_mode: EncoderMode,
    pub codec_mode: CodecMode,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub ffmpeg_args: String,
    pub capture_input: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SdpPayload {
    kind: String,
    sdp: RTCSessionDescription,
}

#[derive(Debug, Serialize, Deserialize)]
struct CandidatePayload {
    kind: String,
    candidate: RTCIceCandidateInit,
}

#[derive(Default)]
struct Inner {
    pc: Option<Arc<RTCPeerConnection>>,
    pairing: Pairing,
    disconnect_timer: Option<JoinHandle<()>>,
    stream_task: Option<JoinHandle<()>>,
}

/// Cheap-to-clone handle on one peer session; clones share all state.
#[derive(Clone)]
pub struct PeerSession {
    cfg: Arc<PeerConfig>,
    signal: Arc<SignalSender>,
    telemetry: Telemetry,
    inner: Arc<Mutex<Inner>>,
}

impl PeerSession {
    pub fn new(cfg: PeerConfig, signal: Arc<SignalSender>) -> Self {
        let telemetry = Telemetry::new(&cfg);
        Self {
            cfg: Arc::new(cfg),
            signal,
            telemetry,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Route one `webrtc.signal` payload. Malformed payloads are dropped.
    pub async fn handle_signal(&self, from: &str, data: Value) {
        let Ok(probe) = serde_json::from_value::<SignalKind>(data.clone()) else {
            return;
        };

        match probe.kind.as_str() {
            kind::OFFER => {
                if !self.try_adopt_peer(from).await {
                    warn!(
                        "ignoring offer from {from:?} (active={:?})",
                        self.active_peer_id().await
                    );
                    return;
                }
                let Ok(offer) = serde_json::from_value::<SdpPayload>(data) else {
                    return;
                };
                self.on_offer(offer.sdp).await;
            }
            kind::CANDIDATE => {
                if !self.is_active_peer(from).await {
                    return;
                }
                let Ok(payload) = serde_json::from_value::<CandidatePayload>(data) else {
                    return;
                };
                if payload.candidate.candidate.trim().is_empty() {
                    return;
                }
                self.on_candidate(payload.candidate).await;
            }
            _ => {}
        }
    }

    async fn active_peer_id(&self) -> String {
        self.inner.lock().await.pairing.active().to_string()
    }

    async fn is_active_peer(&self, from: &str) -> bool {
        self.inner.lock().await.pairing.is_active(from)
    }

    async fn try_adopt_peer(&self, from: &str) -> bool {
        self.inner.lock().await.pairing.try_adopt(from)
    }

    async fn on_offer(&self, offer: RTCSessionDescription) {
        let pc = match self.ensure_pc().await {
            Ok(pc) => pc,
            Err(err) => {
                warn!("ensure_pc: {err}");
                return;
            }
        };

        if let Err(err) = pc.set_remote_description(offer).await {
            warn!("set_remote_description: {err}");
            return;
        }
        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!("create_answer: {err}");
                return;
            }
        };
        if let Err(err) = pc.set_local_description(answer).await {
            warn!("set_local_description: {err}");
            return;
        }

        let Some(local) = pc.local_description().await else {
            warn!("local description unavailable after answer");
            return;
        };
        let payload = SdpPayload {
            kind: kind::ANSWER.to_string(),
            sdp: local,
        };
        let Ok(data) = serde_json::to_value(&payload) else {
            return;
        };
        if let Err(err) = self
            .signal
            .send_json(&SignalMessage::signal(&self.cfg.room, data))
            .await
        {
            warn!("send answer: {err}");
        }
    }

    async fn on_candidate(&self, candidate: RTCIceCandidateInit) {
        let pc = match self.ensure_pc().await {
            Ok(pc) => pc,
            Err(_) => return,
        };
        // Candidates can race the remote description; drop them quietly.
        let _ = pc.add_ice_candidate(candidate).await;
    }

    /// Lazily construct the peer connection, the outbound video track, and
    /// the encoder pipeline behind it.
    async fn ensure_pc(&self) -> webrtc::error::Result<Arc<RTCPeerConnection>> {
        let mut inner = self.inner.lock().await;
        if let Some(pc) = &inner.pc {
            return Ok(Arc::clone(pc));
        }

        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.cfg.stun.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let mime_type = match resolve_codec(self.cfg.codec_mode, self.cfg.encoder_mode) {
            CodecMode::H264 => MIME_TYPE_H264,
            _ => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            "hidbridge".to_string(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Keep draining RTCP so the sender stays healthy.
        tokio::spawn(async move {
            while sender.read_rtcp().await.is_ok() {}
        });

        let settings = StreamSettings {
            source_mode: self.cfg.source_mode,
            pipeline: VideoPipelineSpec {
                quality_preset: self.cfg.quality_preset,
                image_quality: self.cfg.image_quality,
                encoder_mode: self.cfg.encoder_mode,
                codec_mode: self.cfg.codec_mode,
                fps: self.cfg.fps,
                custom_pipeline: self.cfg.ffmpeg_args.clone(),
                capture_input: self.cfg.capture_input.clone(),
            },
            ffmpeg_path: env_or("HIDBRIDGE_FFMPEG", "ffmpeg"),
            configured_bitrate_kbps: self.cfg.bitrate_kbps,
            restart: RestartPolicy::from_env(),
            abr: AbrSettings::from_env(),
        };
        let stream_track = Arc::clone(&track);
        let stream_telemetry = self.telemetry.clone();
        // Aborting this task drops the ffmpeg child, which is spawned with
        // kill_on_drop, so teardown always kills the encoder.
        inner.stream_task = Some(tokio::spawn(async move {
            if let Err(err) = run_video_stream(stream_track, settings, stream_telemetry).await {
                warn!("video stream ended: {err:#}");
            }
        }));

        let signal = Arc::clone(&self.signal);
        let room = self.cfg.room.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signal = Arc::clone(&signal);
            let room = room.clone();
            Box::pin(async move {
                // A null candidate signals end-of-candidates.
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                // Some browsers send empty-string candidates; ignore.
                if init.candidate.trim().is_empty() {
                    return;
                }
                let payload = CandidatePayload {
                    kind: kind::CANDIDATE.to_string(),
                    candidate: init,
                };
                let Ok(data) = serde_json::to_value(&payload) else {
                    return;
                };
                let _ = signal.send_json(&SignalMessage::signal(&room, data)).await;
            })
        }));

        let state_session = self.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session = state_session.clone();
            Box::pin(async move {
                info!("pc state: {state}");
                match state {
                    RTCPeerConnectionState::Connected => {
                        session.cancel_disconnect_teardown().await;
                    }
                    RTCPeerConnectionState::Disconnected => {
                        session.schedule_disconnect_teardown(DISCONNECT_GRACE).await;
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        session.teardown().await;
                    }
                    _ => {}
                }
            })
        }));

        let channel_telemetry = self.telemetry.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let telemetry = channel_telemetry.clone();
            Box::pin(async move {
                telemetry.attach_channel(dc).await;
            })
        }));

        inner.pc = Some(Arc::clone(&pc));
        Ok(pc)
    }

    async fn schedule_disconnect_teardown(&self, delay: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(timer) = inner.disconnect_timer.take() {
            timer.abort();
        }
        let session = self.clone();
        inner.disconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.disconnect_grace_expired().await;
        }));
    }

    async fn cancel_disconnect_teardown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(timer) = inner.disconnect_timer.take() {
            timer.abort();
        }
    }

    async fn disconnect_grace_expired(&self) {
        let pc = {
            let mut inner = self.inner.lock().await;
            // Forget our own handle so teardown does not abort this task
            // out from under itself.
            inner.disconnect_timer = None;
            inner.pc.clone()
        };
        let Some(pc) = pc else { return };
        if pc.connection_state() != RTCPeerConnectionState::Disconnected {
            return;
        }
        warn!("pc disconnected timeout: forcing teardown");
        self.teardown().await;
    }

    /// Tear down the peer connection, the grace timer, and the encoder
    /// pipeline. Safe to call repeatedly and from any path.
    pub async fn teardown(&self) {
        let (timer, stream_task, pc) = {
            let mut inner = self.inner.lock().await;
            inner.pairing.clear();
            (
                inner.disconnect_timer.take(),
                inner.stream_task.take(),
                inner.pc.take(),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(task) = stream_task {
            task.abort();
        }
        if let Some(pc) = pc {
            let _ = pc.close().await;
        }
    }
}

struct Channels {
    control: Option<Arc<RTCDataChannel>>,
    telemetry: Option<Arc<RTCDataChannel>>,
    pending_notice: String,
}

/// Sink for `video.status` notices. The last notice is cached and replayed
/// when the telemetry channel opens, so a browser that connects after the
/// pipeline started still learns its state.
#[derive(Clone)]
pub struct Telemetry {
    encoder: &'static str,
    codec: &'static str,
    quality_preset: &'static str,
    bitrate_kbps: u32,
    target_fps: u32,
    channels: Arc<Mutex<Channels>>,
}

impl Telemetry {
    fn new(cfg: &PeerConfig) -> Self {
        Self {
            encoder: cfg.encoder_mode.as_str(),
            codec: cfg.codec_mode.as_str(),
            quality_preset: cfg.quality_preset.as_str(),
            bitrate_kbps: cfg.bitrate_kbps,
            target_fps: cfg.fps,
            channels: Arc::new(Mutex::new(Channels {
                control: None,
                telemetry: None,
                pending_notice: String::new(),
            })),
        }
    }

    /// Categorize an incoming data channel by its label and wire up its
    /// open/close/message handlers.
    async fn attach_channel(&self, dc: Arc<RTCDataChannel>) {
        let label = dc.label().trim().to_ascii_lowercase();
        info!("datachannel: {label}");

        {
            let mut channels = self.channels.lock().await;
            match label.as_str() {
                "telemetry" => channels.telemetry = Some(Arc::clone(&dc)),
                "control" => channels.control = Some(Arc::clone(&dc)),
                _ => {
                    // Legacy single-channel mode carries both roles.
                    channels.control = Some(Arc::clone(&dc));
                    channels.telemetry = Some(Arc::clone(&dc));
                }
            }
        }

        let open_telemetry = self.clone();
        let open_dc = Arc::clone(&dc);
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let telemetry = open_telemetry.clone();
            let dc = Arc::clone(&open_dc);
            let label = open_label.clone();
            Box::pin(async move {
                info!("datachannel open: {label}");
                let (notice, is_sink) = {
                    let channels = telemetry.channels.lock().await;
                    let is_sink = channels
                        .telemetry
                        .as_ref()
                        .map(|t| Arc::ptr_eq(t, &dc))
                        .unwrap_or(false);
                    (channels.pending_notice.clone(), is_sink)
                };
                if !notice.trim().is_empty() && is_sink {
                    let _ = dc.send_text(notice).await;
                }
            })
        }));

        let close_telemetry = self.clone();
        let close_dc = Arc::clone(&dc);
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let telemetry = close_telemetry.clone();
            let dc = Arc::clone(&close_dc);
            let label = close_label.clone();
            Box::pin(async move {
                info!("datachannel close: {label}");
                let mut channels = telemetry.channels.lock().await;
                if channels
                    .control
                    .as_ref()
                    .map(|c| Arc::ptr_eq(c, &dc))
                    .unwrap_or(false)
                {
                    channels.control = None;
                }
                if channels
                    .telemetry
                    .as_ref()
                    .map(|t| Arc::ptr_eq(t, &dc))
                    .unwrap_or(false)
                {
                    channels.telemetry = None;
                }
            })
        }));

        let message_dc = Arc::clone(&dc);
        let message_label = label;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let dc = Arc::clone(&message_dc);
            let label = message_label.clone();
            Box::pin(async move {
                if !msg.is_string {
                    return;
                }
                // Keep the legacy "data" echo behavior for backward
                // compatibility only. The dedicated "control" channel is
                // intentionally non-echo to avoid round-trips under high
                // input rate.
                if label == "data" {
                    let text = String::from_utf8_lossy(&msg.data).into_owned();
                    let _ = dc.send_text(text).await;
                }
            })
        }));
    }

    /// Render and send a `video.status` notice. Event-specific extras may
    /// override base fields (e.g. `bitrateKbps` after an ABR change).
    pub async fn notify(
        &self,
        event: &str,
        mode: SourceMode,
        detail: &str,
        extra: Map<String, Value>,
    ) {
        let mut payload = Map::new();
        payload.insert("type".to_string(), Value::from("video.status"));
        payload.insert("event".to_string(), Value::from(event));
        payload.insert("mode".to_string(), Value::from(mode.as_str()));
        payload.insert("encoder".to_string(), Value::from(self.encoder));
        payload.insert("codec".to_string(), Value::from(self.codec));
        payload.insert("qualityPreset".to_string(), Value::from(self.quality_preset));
        payload.insert("bitrateKbps".to_string(), Value::from(self.bitrate_kbps));
        payload.insert("targetFps".to_string(), Value::from(self.target_fps));
        if !detail.trim().is_empty() {
            payload.insert("detail".to_string(), Value::from(detail));
        }
        payload.extend(extra);
        let message = Value::Object(payload).to_string();

        let dc = {
            let mut channels = self.channels.lock().await;
            channels.pending_notice = message.clone();
            // Older clients may still use a single "data"/control channel.
            channels
                .telemetry
                .clone()
                .or_else(|| channels.control.clone())
        };
        if let Some(dc) = dc {
            let _ = dc.send_text(message).await;
        }
    }
}
