//! WebRTC video peer.
//!
//! Runs next to the HID control server and publishes a compressed video
//! track into a signaling room:
//! - joins the room via /ws/webrtc and answers browser offers
//! - publishes a VP8 or H.264 track fed by an external ffmpeg process
//! - opens/accepts data channels: "control" for input, "telemetry" for
//!   video status, and the legacy single "data" channel

mod session;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;

use hidbridge_common::pidfile::PidFile;
use hidbridge_common::ws::{dial_ws, SignalSender, WsStream};
use hidbridge_core::config::{
    clamp_bitrate, clamp_fps, normalize_image_quality, CodecMode, EncoderMode, QualityPreset,
    SourceMode,
};
use hidbridge_core::protocol::{envelope, SignalEnvelope, SignalMessage};

use session::{PeerConfig, PeerSession};

#[derive(Parser, Debug)]
#[command(name = "hidbridge-video-peer")]
#[command(about = "WebRTC video peer for HidBridge")]
struct Args {
    /// HidControlServer base URL (http://host:port)
    #[arg(long, env = "HIDBRIDGE_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Server token (X-HID-Token)
    #[arg(long, env = "HIDBRIDGE_TOKEN", default_value = "")]
    token: String,

    /// Signaling room name
    #[arg(long, env = "HIDBRIDGE_WEBRTC_ROOM", default_value = "video")]
    room: String,

    /// STUN server URL (stun:host:port)
    #[arg(long, env = "HIDBRIDGE_STUN", default_value = "stun:stun.l.google.com:19302")]
    stun: String,

    /// Video source mode: testsrc|capture
    #[arg(long, env = "HIDBRIDGE_VIDEO_SOURCE_MODE", default_value = "testsrc")]
    source_mode: SourceMode,

    /// Video quality preset: low|low-latency|balanced|high|optimal
    #[arg(long, env = "HIDBRIDGE_VIDEO_QUALITY_PRESET", default_value = "balanced")]
    quality_preset: QualityPreset,

    /// Image quality level (1-100, higher is better); 0 = auto
    #[arg(long, env = "HIDBRIDGE_VIDEO_IMAGE_QUALITY", default_value_t = 0)]
    image_quality: u32,

    /// Encoder mode: auto|cpu|hw|nvenc|amf|qsv|v4l2m2m|vaapi
    #[arg(long, env = "HIDBRIDGE_VIDEO_ENCODER", default_value = "auto")]
    encoder: EncoderMode,

    /// Codec mode: auto|vp8|h264
    #[arg(long, env = "HIDBRIDGE_VIDEO_CODEC", default_value = "auto")]
    codec: CodecMode,

    /// Target bitrate in kbps
    #[arg(long, env = "HIDBRIDGE_VIDEO_BITRATE_KBPS", default_value_t = 1200)]
    bitrate_kbps: u32,

    /// Target frame rate
    #[arg(long, env = "HIDBRIDGE_VIDEO_FPS", default_value_t = 30)]
    fps: u32,

    /// Optional ffmpeg pipeline args (overrides built-in mode pipeline)
    #[arg(long, env = "HIDBRIDGE_VIDEO_FFMPEG_ARGS", default_value = "")]
    ffmpeg_args: String,

    /// Optional capture input args (used in capture mode)
    #[arg(long, env = "HIDBRIDGE_VIDEO_CAPTURE_INPUT", default_value = "")]
    capture_input: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    hidbridge_common::init_tracing();
    let args = Args::parse();

    let base = Url::parse(&args.server).context("bad --server")?;

    let image_quality = normalize_image_quality(args.image_quality);
    let image_quality_text = if image_quality == 0 {
        "auto".to_string()
    } else {
        image_quality.to_string()
    };
    info!("webrtc video peer starting");
    info!(
        "server={base} room={} stun={} sourceMode={} qualityPreset={} imageQuality={image_quality_text} encoder={} codec={} bitrateKbps={} fps={}",
        args.room,
        args.stun,
        args.source_mode,
        args.quality_preset,
        args.encoder,
        args.codec,
        clamp_bitrate(args.bitrate_kbps),
        clamp_fps(args.fps),
    );
    let _pidfile = PidFile::register();

    let cfg = PeerConfig {
        room: args.room,
        stun: args.stun,
        source_mode: args.source_mode,
        quality_preset: args.quality_preset,
        image_quality,
        encoder_mode: args.encoder,
        codec_mode: args.codec,
        bitrate_kbps: clamp_bitrate(args.bitrate_kbps),
        fps: clamp_fps(args.fps),
        ffmpeg_args: args.ffmpeg_args,
        capture_input: args.capture_input,
    };

    // Long-running loop: reconnect on transport failures instead of exiting.
    let mut backoff = Duration::from_secs(1);
    loop {
        match run_session(&base, &args.token, &cfg).await {
            Ok(()) => info!("session ended"),
            Err(err) => warn!("session ended: {err:#}"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
}

async fn run_session(base: &Url, token: &str, cfg: &PeerConfig) -> Result<()> {
    let ws = dial_ws(base, "/ws/webrtc", token)
        .await
        .context("dial /ws/webrtc")?;
    let (sink, mut read) = ws.split();
    let signal = Arc::new(SignalSender::new(sink));

    signal
        .send_json(&SignalMessage::join(&cfg.room))
        .await
        .context("join room")?;

    let session = PeerSession::new(cfg.clone(), Arc::clone(&signal));
    let result = pump_signaling(&session, &mut read).await;
    // The session owns the encoder subprocess and peer connection; tear it
    // down with the signaling transport so nothing outlives the session.
    session.teardown().await;
    result
}

async fn pump_signaling(session: &PeerSession, read: &mut SplitStream<WsStream>) -> Result<()> {
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
            envelope::SIGNAL => session.handle_signal(&env.from, env.data).await,
            _ => continue,
        }
    }
    bail!("signaling stream ended")
}
