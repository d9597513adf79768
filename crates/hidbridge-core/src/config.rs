//! Configuration: environment parsing with defaults and clamping, mode
//! enums, and the tuning knobs for encoder restart and adaptive bitrate.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Target bitrate bounds in kbps.
pub const BITRATE_MIN_KBPS: u32 = 200;
pub const BITRATE_MAX_KBPS: u32 = 12_000;
/// Absolute ceiling the ABR max may be raised to.
pub const ABR_CEILING_KBPS: u32 = 20_000;
/// Frame-rate bounds.
pub const FPS_MIN: u32 = 5;
pub const FPS_MAX: u32 = 60;
/// CPU capture is capped here for stability on common 1080p cards.
pub const CPU_CAPTURE_FPS_CAP: u32 = 30;

pub fn clamp_bitrate(kbps: u32) -> u32 {
    kbps.clamp(BITRATE_MIN_KBPS, BITRATE_MAX_KBPS)
}

pub fn clamp_fps(fps: u32) -> u32 {
    fps.clamp(FPS_MIN, FPS_MAX)
}

/// Image quality outside 1..=100 means "auto" (0).
pub fn normalize_image_quality(q: u32) -> u32 {
    if (1..=100).contains(&q) {
        q
    } else {
        0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized {what}: {value}")]
pub struct ParseModeError {
    what: &'static str,
    value: String,
}

impl ParseModeError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Where the video frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Testsrc,
    Capture,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Testsrc => "testsrc",
            SourceMode::Capture => "capture",
        }
    }
}

impl FromStr for SourceMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "testsrc" => Ok(SourceMode::Testsrc),
            "capture" => Ok(SourceMode::Capture),
            other => Err(ParseModeError::new("source mode", other)),
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder tuning envelope. Controls the speed knob, GOP, and rate control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreset {
    Low,
    LowLatency,
    Balanced,
    High,
    Optimal,
}

impl QualityPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::LowLatency => "low-latency",
            QualityPreset::Balanced => "balanced",
            QualityPreset::High => "high",
            QualityPreset::Optimal => "optimal",
        }
    }
}

impl FromStr for QualityPreset {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(QualityPreset::Low),
            "low-latency" => Ok(QualityPreset::LowLatency),
            "" | "balanced" => Ok(QualityPreset::Balanced),
            "high" => Ok(QualityPreset::High),
            "optimal" => Ok(QualityPreset::Optimal),
            other => Err(ParseModeError::new("quality preset", other)),
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which encoder backend ffmpeg should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMode {
    Auto,
    Cpu,
    Hw,
    Nvenc,
    Amf,
    Qsv,
    V4l2m2m,
    Vaapi,
}

impl EncoderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EncoderMode::Auto => "auto",
            EncoderMode::Cpu => "cpu",
            EncoderMode::Hw => "hw",
            EncoderMode::Nvenc => "nvenc",
            EncoderMode::Amf => "amf",
            EncoderMode::Qsv => "qsv",
            EncoderMode::V4l2m2m => "v4l2m2m",
            EncoderMode::Vaapi => "vaapi",
        }
    }

    /// Hardware backends negotiate H.264; everything else defaults to VP8.
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            EncoderMode::Nvenc
                | EncoderMode::Amf
                | EncoderMode::Qsv
                | EncoderMode::V4l2m2m
                | EncoderMode::Vaapi
        )
    }
}

impl FromStr for EncoderMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(EncoderMode::Auto),
            "cpu" => Ok(EncoderMode::Cpu),
            "hw" => Ok(EncoderMode::Hw),
            "nvenc" => Ok(EncoderMode::Nvenc),
            "amf" => Ok(EncoderMode::Amf),
            "qsv" => Ok(EncoderMode::Qsv),
            "v4l2m2m" => Ok(EncoderMode::V4l2m2m),
            "vaapi" => Ok(EncoderMode::Vaapi),
            other => Err(ParseModeError::new("encoder mode", other)),
        }
    }
}

impl fmt::Display for EncoderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    Auto,
    Vp8,
    H264,
}

impl CodecMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecMode::Auto => "auto",
            CodecMode::Vp8 => "vp8",
            CodecMode::H264 => "h264",
        }
    }
}

impl FromStr for CodecMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(CodecMode::Auto),
            "vp8" => Ok(CodecMode::Vp8),
            "h264" => Ok(CodecMode::H264),
            other => Err(ParseModeError::new("codec mode", other)),
        }
    }
}

impl fmt::Display for CodecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

pub fn env_bool(name: &str, default: bool) -> bool {
    let raw = std::env::var(name).unwrap_or_default();
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Parse an integer env var; unset or unparsable falls back to the default.
/// The result is always clamped into `[min, max]`.
pub fn env_int_in_range(name: &str, default: u32, min: u32, max: u32) -> u32 {
    let raw = std::env::var(name).unwrap_or_default();
    let value = raw.trim().parse::<u32>().unwrap_or(default);
    value.clamp(min, max)
}

/// Parse an optional integer env var; unset, unparsable, or out-of-range
/// yields 0 ("auto").
pub fn env_optional_int_in_range(name: &str, min: u32, max: u32) -> u32 {
    let raw = std::env::var(name).unwrap_or_default();
    match raw.trim().parse::<u32>() {
        Ok(n) if (min..=max).contains(&n) => n,
        _ => 0,
    }
}

/// Encoder restart budget and the startup RTP probe window.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: usize,
    pub window: Duration,
    pub base_delay: Duration,
    pub startup_packet_timeout: Duration,
}

impl RestartPolicy {
    pub fn from_env() -> Self {
        Self {
            max_restarts: env_int_in_range("HIDBRIDGE_VIDEO_PIPELINE_MAX_RESTARTS", 8, 0, 100)
                as usize,
            window: Duration::from_secs(env_int_in_range(
                "HIDBRIDGE_VIDEO_PIPELINE_RESTART_WINDOW_SEC",
                60,
                5,
                600,
            ) as u64),
            base_delay: Duration::from_millis(env_int_in_range(
                "HIDBRIDGE_VIDEO_PIPELINE_RESTART_DELAY_MS",
                500,
                50,
                10_000,
            ) as u64),
            startup_packet_timeout: Duration::from_millis(env_int_in_range(
                "HIDBRIDGE_VIDEO_STARTUP_PACKET_TIMEOUT_MS",
                15_000,
                2_000,
                120_000,
            ) as u64),
        }
    }
}

/// Adaptive bitrate tuning. Disabled by default: a bitrate change restarts
/// the encoder, which freezes the stream for a moment.
#[derive(Debug, Clone)]
pub struct AbrSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub min_kbps: u32,
    pub max_kbps: u32,
    pub consecutive_required: u32,
    pub min_change_interval: Duration,
}

impl AbrSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("HIDBRIDGE_VIDEO_ABR_ENABLED", false),
            interval: Duration::from_secs(env_int_in_range(
                "HIDBRIDGE_VIDEO_ABR_INTERVAL_SEC",
                6,
                2,
                30,
            ) as u64),
            min_kbps: env_int_in_range("HIDBRIDGE_VIDEO_ABR_MIN_KBPS", 400, 200, 12_000),
            max_kbps: env_int_in_range("HIDBRIDGE_VIDEO_ABR_MAX_KBPS", 6_000, 200, 20_000),
            consecutive_required: env_int_in_range(
                "HIDBRIDGE_VIDEO_ABR_CONSECUTIVE_REQUIRED",
                3,
                1,
                8,
            ),
            min_change_interval: Duration::from_secs(env_int_in_range(
                "HIDBRIDGE_VIDEO_ABR_MIN_CHANGE_INTERVAL_SEC",
                20,
                2,
                120,
            ) as u64),
        }
    }
}

impl Default for AbrSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(6),
            min_kbps: 400,
            max_kbps: 6_000,
            consecutive_required: 3,
            min_change_interval: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_is_case_and_space_tolerant() {
        assert_eq!(" Capture ".parse::<SourceMode>().unwrap(), SourceMode::Capture);
        assert_eq!("LOW-LATENCY".parse::<QualityPreset>().unwrap(), QualityPreset::LowLatency);
        assert_eq!("NVENC".parse::<EncoderMode>().unwrap(), EncoderMode::Nvenc);
        assert_eq!("H264".parse::<CodecMode>().unwrap(), CodecMode::H264);
    }

    #[test]
    fn empty_mode_strings_fall_back_to_defaults() {
        assert_eq!("".parse::<SourceMode>().unwrap(), SourceMode::Testsrc);
        assert_eq!("".parse::<QualityPreset>().unwrap(), QualityPreset::Balanced);
        assert_eq!("".parse::<EncoderMode>().unwrap(), EncoderMode::Auto);
        assert_eq!("".parse::<CodecMode>().unwrap(), CodecMode::Auto);
    }

    #[test]
    fn unknown_mode_strings_are_rejected() {
        assert!("webcam".parse::<SourceMode>().is_err());
        assert!("ultra".parse::<QualityPreset>().is_err());
        assert!("cuda".parse::<EncoderMode>().is_err());
        assert!("av1".parse::<CodecMode>().is_err());
    }

    #[test]
    fn bitrate_and_fps_are_clamped() {
        assert_eq!(clamp_bitrate(100), 200);
        assert_eq!(clamp_bitrate(1200), 1200);
        assert_eq!(clamp_bitrate(50_000), 12_000);
        assert_eq!(clamp_fps(1), 5);
        assert_eq!(clamp_fps(144), 60);
    }

    #[test]
    fn image_quality_normalizes_out_of_range_to_auto() {
        assert_eq!(normalize_image_quality(0), 0);
        assert_eq!(normalize_image_quality(1), 1);
        assert_eq!(normalize_image_quality(100), 100);
        assert_eq!(normalize_image_quality(101), 0);
    }

    #[test]
    fn hardware_encoders_are_classified() {
        for enc in [
            EncoderMode::Nvenc,
            EncoderMode::Amf,
            EncoderMode::Qsv,
            EncoderMode::V4l2m2m,
            EncoderMode::Vaapi,
        ] {
            assert!(enc.is_hardware(), "{enc} should be hardware");
        }
        for enc in [EncoderMode::Auto, EncoderMode::Cpu, EncoderMode::Hw] {
            assert!(!enc.is_hardware(), "{enc} should not be hardware");
        }
    }
}
