//! WebRTC control peer.
//!
//! Runs next to the HID control server:
//! - joins a signaling room via /ws/webrtc and answers browser offers
//! - accepts a data channel (any label) and forwards its text messages to
//!   the upstream HID WebSocket, returning the replies
//!
//! The control plane stays request/response: one in-flight HID exchange at
//! a time, serialized on the HID socket.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use hidbridge_common::pidfile::PidFile;
use hidbridge_common::ws::{dial_ws, SignalSender, WsStream};
use hidbridge_core::pairing::Pairing;
use hidbridge_core::protocol::{envelope, kind, SignalEnvelope, SignalKind, SignalMessage};

const HID_FORWARD_FAILED: &str = r#"{"ok":false,"error":"hid_forward_failed"}"#;
const BINARY_NOT_SUPPORTED: &str = r#"{"ok":false,"error":"binary_not_supported"}"#;

#[derive(Parser, Debug)]
#[command(name = "hidbridge-control-peer")]
#[command(about = "WebRTC control peer for HidBridge")]
struct Args {
    /// HidControlServer base URL (http://host:port)
    #[arg(long, env = "HIDBRIDGE_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Server token (X-HID-Token)
    #[arg(long, env = "HIDBRIDGE_TOKEN", default_value = "")]
    token: String,

    /// Signaling room name
    #[arg(long, env = "HIDBRIDGE_WEBRTC_ROOM", default_value = "control")]
    room: String,

    /// STUN server URL (stun:host:port)
    #[arg(long, env = "HIDBRIDGE_STUN", default_value = "stun:stun.l.google.com:19302")]
    stun: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    hidbridge_common::init_tracing();
    let args = Args::parse();

    let base = Url::parse(&args.server).context("bad --server")?;
    info!("webrtc control peer starting");
    info!("server={base} room={} stun={}", args.room, args.stun);
    let _pidfile = PidFile::register();

    // Long-running loop: reconnect on transport failures instead of exiting
    // the helper process.
    let mut backoff = Duration::from_secs(1);
    loop {
        match run_session(&base, &args.token, &args.room, &args.stun).await {
            Ok(()) => info!("session ended"),
            Err(err) => warn!("session ended: {err:#}"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
}

async fn run_session(base: &Url, token: &str, room: &str, stun: &str) -> Result<()> {
    let hid_ws = dial_ws(base, "/ws/hid", token).await.context("dial /ws/hid")?;
    let hid = Arc::new(HidForwarder::new(hid_ws));

    let sig_ws = dial_ws(base, "/ws/webrtc", token)
        .await
        .context("dial /ws/webrtc")?;
    let (sink, mut read) = sig_ws.split();
    let signal = Arc::new(SignalSender::new(sink));

    signal
        .send_json(&SignalMessage::join(room))
        .await
        .context("join room")?;

    let peer = ControlPeer::new(room, stun, signal, hid);
    let result = async {
        while let Some(msg) = read.next().await {
            let msg = msg.context("signaling read")?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => bail!("signaling closed"),
                _ => continue,
            };

            let Ok(env) = serde_json::from_str::<SignalEnvelope>(&text) else {
                continue;
            };

            match env.message_type.as_str() {
                envelope::ERROR => return Err(anyhow!("signaling error: {}", env.data)),
                envelope::HELLO | envelope::JOINED | envelope::PEER_JOINED => continue,
                envelope::SIGNAL => peer.handle_signal(&env.from, env.data).await,
                _ => continue,
            }
        }
        bail!("signaling stream ended")
    }
    .await;
    peer.release().await;
    result
}

/// The upstream HID socket. One request/response exchange at a time; the
/// lock spans the write and the matching read.
struct HidForwarder {
    ws: Mutex<WsStream>,
}

impl HidForwarder {
    fn new(ws: WsStream) -> Self {
        Self { ws: Mutex::new(ws) }
    }

    async fn round_trip(&self, request: String) -> Result<String> {
        let mut ws = self.ws.lock().await;
        ws.send(Message::Text(request.into()))
            .await
            .context("hid write")?;
        while let Some(msg) = ws.next().await {
            match msg.context("hid read")? {
                Message::Text(text) => return Ok(text.to_string()),
                Message::Close(_) => bail!("hid socket closed"),
                _ => continue,
            }
        }
        bail!("hid socket ended")
    }
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
}

/// Cheap-to-clone handle on the control peer session state.
#[derive(Clone)]
struct ControlPeer {
    room: String,
    stun: String,
    signal: Arc<SignalSender>,
    hid: Arc<HidForwarder>,
    inner: Arc<Mutex<Inner>>,
}

impl ControlPeer {
    fn new(room: &str, stun: &str, signal: Arc<SignalSender>, hid: Arc<HidForwarder>) -> Self {
        Self {
            room: room.to_string(),
            stun: stun.to_string(),
            signal,
            hid,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    async fn handle_signal(&self, from: &str, data: Value) {
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

    async fn ensure_pc(&self) -> webrtc::error::Result<Arc<RTCPeerConnection>> {
        let mut inner = self.inner.lock().await;
        if let Some(pc) = &inner.pc {
            return Ok(Arc::clone(pc));
        }

        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let signal = Arc::clone(&self.signal);
        let room = self.room.clone();
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

        // Release the session aggressively when the browser goes away so
        // another browser can pair with the room without waiting out
        // WebRTC timeouts.
        let state_peer = self.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = state_peer.clone();
            Box::pin(async move {
                info!("pc state: {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    peer.release().await;
                }
            })
        }));

        let hid = Arc::clone(&self.hid);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let hid = Arc::clone(&hid);
            Box::pin(async move {
                let label = dc.label().to_string();
                info!("datachannel: {label}");

                let open_label = label.clone();
                dc.on_open(Box::new(move || {
                    let label = open_label.clone();
                    Box::pin(async move { info!("datachannel open: {label}") })
                }));
                let close_label = label.clone();
                dc.on_close(Box::new(move || {
                    let label = close_label.clone();
                    Box::pin(async move { info!("datachannel close: {label}") })
                }));

                let message_dc = Arc::clone(&dc);
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let dc = Arc::clone(&message_dc);
                    let hid = Arc::clone(&hid);
                    Box::pin(async move {
                        if !msg.is_string {
                            let _ = dc.send_text(BINARY_NOT_SUPPORTED.to_string()).await;
                            return;
                        }
                        let request = String::from_utf8_lossy(&msg.data).into_owned();
                        match hid.round_trip(request).await {
                            Ok(response) => {
                                let _ = dc.send_text(response).await;
                            }
                            Err(err) => {
                                warn!("hid forward failed: {err:#}");
                                let _ = dc.send_text(HID_FORWARD_FAILED.to_string()).await;
                            }
                        }
                    })
                }));
            })
        }));

        inner.pc = Some(Arc::clone(&pc));
        Ok(pc)
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
            .send_json(&SignalMessage::signal(&self.room, data))
            .await
        {
            warn!("send answer: {err}");
        }
    }

    async fn on_candidate(&self, candidate: RTCIceCandidateInit) {
        let pc = {
            let inner = self.inner.lock().await;
            inner.pc.clone()
        };
        let Some(pc) = pc else { return };
        // Candidates can arrive before the remote description; ignore the
        // racing failures.
        let _ = pc.add_ice_candidate(candidate).await;
    }

    /// Drop the peer connection and pairing so a new browser can connect.
    async fn release(&self) {
        let pc = {
            let mut inner = self.inner.lock().await;
            inner.pairing.clear();
            inner.pc.take()
        };
        if let Some(pc) = pc {
            let _ = pc.close().await;
        }
    }
}
