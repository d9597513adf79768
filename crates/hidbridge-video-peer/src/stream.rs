//! Encoder supervision and the RTP relay loop.
//!
//! Binds a loopback UDP socket, points an external ffmpeg process at it,
//! and forwards every RTP packet onto the outbound track. The same loop
//! polls the child for exits (fallback / bounded restart), watches the
//! startup packet probe, publishes periodic stats, and evaluates the
//! adaptive bitrate controller.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{error, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::Unmarshal;

use hidbridge_core::abr::AbrController;
use hidbridge_core::config::{AbrSettings, RestartPolicy, SourceMode};
use hidbridge_core::pipeline::{build_video_pipeline_args, CapturePlatform, VideoPipelineSpec};

use crate::session::Telemetry;

/// UDP read deadline; doubles as the supervisor tick.
const READ_DEADLINE: Duration = Duration::from_secs(1);
/// Cadence of `stats` telemetry events.
const STATS_INTERVAL: Duration = Duration::from_secs(2);
/// Hard cap on the exponential restart delay.
const MAX_RESTART_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub(crate) struct StreamSettings {
    pub source_mode: SourceMode,
    pub pipeline: VideoPipelineSpec,
    pub ffmpeg_path: String,
    pub configured_bitrate_kbps: u32,
    pub restart: RestartPolicy,
    pub abr: AbrSettings,
}

/// Run the encoder pipeline and relay RTP onto `track` until cancelled or
/// the restart budget is exhausted.
pub(crate) async fn run_video_stream(
    track: Arc<TrackLocalStaticRTP>,
    settings: StreamSettings,
    telemetry: Telemetry,
) -> Result<()> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.context("listen udp")?;
    let port = socket.local_addr().context("udp local addr")?.port();
    let out_url = format!("rtp://127.0.0.1:{port}?pkt_size=1200");

    let mode_in_use = settings.source_mode;
    let can_fallback =
        mode_in_use == SourceMode::Capture && !settings.pipeline.has_custom_pipeline();
    let abr = AbrController::new(settings.abr.clone(), settings.configured_bitrate_kbps);
    let now = Instant::now();

    let mut stream = VideoStream {
        settings,
        telemetry,
        track,
        socket,
        out_url,
        mode_in_use,
        can_fallback,
        fallback_used: false,
        restarts: Vec::new(),
        child: None,
        started_at: now,
        first_packet_seen: false,
        pending_reconfigure: None,
        abr,
        total_packets: 0,
        total_bytes: 0,
        total_frames: 0,
        last_report_at: now,
        last_frames: 0,
        last_bytes: 0,
        last_abr_at: now,
        last_abr_bytes: 0,
    };
    stream.run().await
}

struct VideoStream {
    settings: StreamSettings,
    telemetry: Telemetry,
    track: Arc<TrackLocalStaticRTP>,
    socket: UdpSocket,
    out_url: String,

    mode_in_use: SourceMode,
    can_fallback: bool,
    fallback_used: bool,
    restarts: Vec<Instant>,
    child: Option<Child>,
    started_at: Instant,
    first_packet_seen: bool,
    pending_reconfigure: Option<String>,
    abr: AbrController,

    total_packets: u64,
    total_bytes: u64,
    total_frames: u64,
    last_report_at: Instant,
    last_frames: u64,
    last_bytes: u64,
    last_abr_at: Instant,
    last_abr_bytes: u64,
}

impl VideoStream {
    async fn run(&mut self) -> Result<()> {
        self.start_encoder().await?;

        let mut buf = vec![0u8; 2048];
        loop {
            if let Some(status) = self.poll_child_exit()? {
                self.handle_child_exit(status).await?;
                continue;
            }

            match timeout(READ_DEADLINE, self.socket.recv_from(&mut buf)).await {
                Err(_) => {
                    self.check_startup_timeout().await?;
                }
                Ok(Err(err)) => return Err(err).context("udp read"),
                Ok(Ok((n, _))) => {
                    self.on_datagram(&buf[..n]).await?;
                }
            }
        }
    }

    /// Non-blocking probe for an encoder exit.
    fn poll_child_exit(&mut self) -> Result<Option<std::process::ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait().context("wait on encoder")?;
        if status.is_some() {
            self.child = None;
        }
        Ok(status)
    }

    async fn handle_child_exit(&mut self, status: std::process::ExitStatus) -> Result<()> {
        let reconfiguring = self.pending_reconfigure.is_some();
        if !status.success()
            && !reconfiguring
            && self.can_fallback
            && !self.fallback_used
            && self.mode_in_use == SourceMode::Capture
        {
            self.enter_fallback("capture_failed", None).await?;
            return Ok(());
        }

        let reason = self
            .pending_reconfigure
            .take()
            .unwrap_or_else(|| "ffmpeg_exit".to_string());
        if self.restart_pipeline(&reason, Some(status)).await? {
            return Ok(());
        }
        bail!("ffmpeg exited: {status}")
    }

    /// One-shot capture -> testsrc substitution within this session.
    async fn enter_fallback(&mut self, reason: &str, timeout_ms: Option<u64>) -> Result<()> {
        self.fallback_used = true;
        self.mode_in_use = SourceMode::Testsrc;
        warn!(
            "capture pipeline failed, switching to fallback source mode={}: {reason}",
            self.mode_in_use
        );
        let mut extra = extras(json!({ "fallbackUsed": true }));
        if let Some(ms) = timeout_ms {
            extra.insert("timeoutMs".to_string(), Value::from(ms));
        }
        self.telemetry
            .notify("fallback", self.mode_in_use, reason, extra)
            .await;
        self.start_encoder().await.context("fallback start failed")
    }

    /// Bounded exponential-backoff restart. Returns false when the budget
    /// is exhausted or the replacement failed to start.
    async fn restart_pipeline(
        &mut self,
        reason: &str,
        prev: Option<std::process::ExitStatus>,
    ) -> Result<bool> {
        let now = Instant::now();
        let window = self.settings.restart.window;
        self.restarts.retain(|ts| now.duration_since(*ts) < window);

        if self.restarts.len() >= self.settings.restart.max_restarts {
            warn!(
                "video pipeline restart limit reached mode={} restarts={} windowSec={} reason={reason}",
                self.mode_in_use,
                self.restarts.len(),
                window.as_secs(),
            );
            self.telemetry
                .notify(
                    "restart_limit",
                    self.mode_in_use,
                    reason,
                    extras(json!({
                        "fallbackUsed": self.fallback_used,
                        "restarts": self.restarts.len(),
                        "windowSec": window.as_secs(),
                    })),
                )
                .await;
            return Ok(false);
        }

        self.restarts.push(now);
        let attempt = self.restarts.len();
        let base_ms = self.settings.restart.base_delay.as_millis() as u64;
        let delay_ms = (base_ms << (attempt - 1).min(4)).min(MAX_RESTART_DELAY_MS);
        warn!(
            "video pipeline restarting mode={} attempt={attempt}/{} delayMs={delay_ms} reason={reason} status={prev:?}",
            self.mode_in_use, self.settings.restart.max_restarts,
        );
        self.telemetry
            .notify(
                "recovering",
                self.mode_in_use,
                reason,
                extras(json!({
                    "fallbackUsed": self.fallback_used,
                    "restarts": attempt,
                    "delayMs": delay_ms,
                })),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        match self.start_encoder().await {
            Ok(()) => Ok(true),
            Err(err) => {
                error!(
                    "video pipeline restart failed mode={}: {err:#}",
                    self.mode_in_use
                );
                Ok(false)
            }
        }
    }

    /// Fail fast if the encoder started but produced no RTP packets during
    /// the startup window.
    async fn check_startup_timeout(&mut self) -> Result<()> {
        if self.first_packet_seen {
            return Ok(());
        }
        let budget = self.settings.restart.startup_packet_timeout;
        if self.started_at.elapsed() < budget {
            return Ok(());
        }

        let timeout_ms = budget.as_millis() as u64;
        let detail = format!("no video RTP packets within {timeout_ms}ms");
        self.telemetry
            .notify(
                "startup_timeout",
                self.mode_in_use,
                &detail,
                extras(json!({
                    "fallbackUsed": self.fallback_used,
                    "timeoutMs": timeout_ms,
                })),
            )
            .await;
        self.kill_child();

        if self.can_fallback && !self.fallback_used && self.mode_in_use == SourceMode::Capture {
            self.enter_fallback("startup_timeout", Some(timeout_ms)).await?;
            return Ok(());
        }
        if self.restart_pipeline("startup_timeout", None).await? {
            return Ok(());
        }
        bail!(detail)
    }

    /// One relayed datagram: parse, count, report, evaluate ABR, forward.
    async fn on_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        let mut raw = Bytes::copy_from_slice(datagram);
        let Ok(packet) = Packet::unmarshal(&mut raw) else {
            // Malformed packets are dropped, never buffered.
            return Ok(());
        };

        self.first_packet_seen = true;
        self.total_packets += 1;
        self.total_bytes += datagram.len() as u64;
        if packet.header.marker {
            self.total_frames += 1;
        }

        let now = Instant::now();
        self.report_stats(now).await;
        self.evaluate_abr(now).await;

        if let Err(err) = self.track.write_rtp(&packet).await {
            // During teardown the stream task is aborted before this
            // surfaces; any other write failure ends the stream.
            return Err(err).context("track write");
        }
        Ok(())
    }

    async fn report_stats(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_report_at);
        if elapsed < STATS_INTERVAL {
            return;
        }
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let measured_fps = (self.total_frames - self.last_frames) as f64 / secs;
        let measured_kbps =
            (((self.total_bytes - self.last_bytes) * 8) as f64 / secs / 1000.0) as u64;
        self.telemetry
            .notify(
                "stats",
                self.mode_in_use,
                "",
                extras(json!({
                    "fallbackUsed": self.fallback_used,
                    "measuredFps": round2(measured_fps),
                    "measuredKbps": measured_kbps,
                    "frames": self.total_frames,
                    "packets": self.total_packets,
                })),
            )
            .await;
        self.last_report_at = now;
        self.last_frames = self.total_frames;
        self.last_bytes = self.total_bytes;
    }

    async fn evaluate_abr(&mut self, now: Instant) {
        if !self.settings.abr.enabled {
            return;
        }
        if now.duration_since(self.last_abr_at) < self.settings.abr.interval {
            return;
        }
        let mut secs = now.duration_since(self.last_abr_at).as_secs_f64();
        if secs <= 0.0 {
            secs = self.settings.abr.interval.as_secs_f64();
        }
        let measured_kbps =
            (((self.total_bytes - self.last_abr_bytes) * 8) as f64 / secs / 1000.0) as u32;
        self.last_abr_at = now;
        self.last_abr_bytes = self.total_bytes;

        let Some(change) = self.abr.on_sample(measured_kbps, now) else {
            return;
        };
        info!(
            "abr target change {} -> {} kbps reason={} measured={} smoothed={}",
            change.prev_kbps,
            change.next_kbps,
            change.reason.as_str(),
            change.measured_kbps,
            change.smoothed_kbps,
        );
        self.pending_reconfigure = Some(format!("abr_{}", change.reason.as_str()));
        self.telemetry
            .notify(
                "abr_update",
                self.mode_in_use,
                change.reason.as_str(),
                extras(json!({
                    "bitrateKbps": change.next_kbps,
                    "bitratePrevKbps": change.prev_kbps,
                    "measuredKbps": change.measured_kbps,
                    "smoothedKbps": change.smoothed_kbps,
                    "fallbackUsed": self.fallback_used,
                })),
            )
            .await;
        // The supervisor restarts at the new bitrate on the next exit poll.
        self.kill_child();
    }

    async fn start_encoder(&mut self) -> Result<()> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
        ];
        // Keep synthetic sources real-time; live capture devices pace
        // themselves.
        if self.mode_in_use == SourceMode::Testsrc {
            args.push("-re".to_string());
        }
        let pipeline = build_video_pipeline_args(
            self.mode_in_use,
            &self.settings.pipeline,
            self.abr.current_kbps(),
            CapturePlatform::host(),
        )?;
        args.extend(pipeline);
        args.extend([
            "-f".to_string(),
            "rtp".to_string(),
            "-payload_type".to_string(),
            "96".to_string(),
            self.out_url.clone(),
        ]);

        info!(
            "video pipeline mode={} ffmpeg={}",
            self.mode_in_use, self.settings.ffmpeg_path
        );
        info!("video ffmpeg args: {}", args.join(" "));

        let child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("start ffmpeg ({})", self.settings.ffmpeg_path))?;
        self.child = Some(child);
        self.started_at = Instant::now();
        self.first_packet_seen = false;

        self.telemetry
            .notify(
                "pipeline_started",
                self.mode_in_use,
                "",
                extras(json!({
                    "fallbackUsed": self.fallback_used,
                    "bitrateKbps": self.abr.current_kbps(),
                })),
            )
            .await;
        Ok(())
    }

    fn kill_child(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn extras(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Round to two decimals; negative rates are reported as zero.
fn round2(v: f64) -> f64 {
    if v < 0.0 {
        return 0.0;
    }
    ((v * 100.0 + 0.5) as u64) as f64 / 100.0
}
