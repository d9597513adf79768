//! Encoder pipeline argument matrix.
//!
//! Builds the argv handed to the external ffmpeg process from the
//! source/encoder/codec/preset/quality configuration. The supervisor wraps
//! the result with the fixed prefix (`-hide_banner -loglevel warning`,
//! plus `-re` for synthetic sources) and the RTP output stage.

use crate::cmdline::{
    normalize_dshow_input_args, split_command_line, upsert_dshow_capture_arg, uses_dshow_input,
    CmdlineError,
};
use crate::config::{
    clamp_bitrate, clamp_fps, normalize_image_quality, CodecMode, EncoderMode, QualityPreset,
    SourceMode, CPU_CAPTURE_FPS_CAP,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("parse custom pipeline args: {0}")]
    CustomPipeline(CmdlineError),
    #[error("empty custom pipeline args")]
    EmptyCustomPipeline,
    #[error("parse capture input args: {0}")]
    CaptureInput(CmdlineError),
    #[error("empty capture input args")]
    EmptyCaptureInput,
    #[error("capture mode is unsupported on this platform without capture input args")]
    UnsupportedCapturePlatform,
}

/// The platform the capture defaults are selected for. Parameterized so the
/// Windows-only DirectShow paths stay testable everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePlatform {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl CapturePlatform {
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            CapturePlatform::Windows
        } else if cfg!(target_os = "linux") {
            CapturePlatform::Linux
        } else if cfg!(target_os = "macos") {
            CapturePlatform::MacOs
        } else {
            CapturePlatform::Other
        }
    }
}

/// The static portion of the pipeline configuration. Bitrate is passed
/// separately because the ABR controller changes it between restarts.
#[derive(Debug, Clone)]
pub struct VideoPipelineSpec {
    pub quality_preset: QualityPreset,
    pub image_quality: u32,
    pub encoder_mode: EncoderMode,
    pub codec_mode: CodecMode,
    pub fps: u32,
    pub custom_pipeline: String,
    pub capture_input: String,
}

impl VideoPipelineSpec {
    pub fn has_custom_pipeline(&self) -> bool {
        !self.custom_pipeline.trim().is_empty()
    }
}

/// Resolve `auto` codec selection: hardware encoders negotiate H.264,
/// everything else VP8. Never returns `Auto`.
pub fn resolve_codec(codec: CodecMode, encoder: EncoderMode) -> CodecMode {
    match codec {
        CodecMode::Vp8 | CodecMode::H264 => codec,
        CodecMode::Auto => {
            if encoder.is_hardware() {
                CodecMode::H264
            } else {
                CodecMode::Vp8
            }
        }
    }
}

/// CPU capture caps the frame rate for stability.
pub fn effective_capture_fps(fps: u32, encoder: EncoderMode) -> u32 {
    let target = clamp_fps(fps);
    if encoder == EncoderMode::Cpu && target > CPU_CAPTURE_FPS_CAP {
        CPU_CAPTURE_FPS_CAP
    } else {
        target
    }
}

/// Image quality nudges the bitrate gently: 1..=100 maps to 0.85x..1.15x.
pub fn apply_image_quality_to_bitrate(bitrate_kbps: u32, image_quality: u32) -> u32 {
    let bitrate = clamp_bitrate(bitrate_kbps);
    let q = normalize_image_quality(image_quality);
    if q == 0 {
        return bitrate;
    }
    let scale = 0.85 + 0.30 * (q - 1) as f64 / 99.0;
    clamp_bitrate((bitrate as f64 * scale) as u32)
}

/// VP8 CRF from image quality: ~50 (worst) down to ~10 (best). `None` at 0.
pub fn image_quality_to_vp8_crf(image_quality: u32) -> Option<u32> {
    let q = normalize_image_quality(image_quality);
    if q == 0 {
        return None;
    }
    Some((50.0 - (q - 1) as f64 * 40.0 / 99.0) as u32)
}

/// x264 CRF from image quality: ~35 down to ~18. `None` at 0.
pub fn image_quality_to_x264_crf(image_quality: u32) -> Option<u32> {
    let q = normalize_image_quality(image_quality);
    if q == 0 {
        return None;
    }
    Some((35.0 - (q - 1) as f64 * 17.0 / 99.0) as u32)
}

/// Per-preset GOP and rate-control envelope, shared across every encoder
/// backend so presets stay comparable between CPU and hardware paths.
pub fn quality_rate_control(preset: QualityPreset, bitrate: u32, fps: u32) -> (u32, u32, u32) {
    let b = clamp_bitrate(bitrate);
    let f = clamp_fps(fps);
    match preset {
        QualityPreset::Low => ((f * 3).clamp(30, 180), (b as f64 * 1.15) as u32, b * 3),
        QualityPreset::LowLatency => (f.clamp(15, 60), (b as f64 * 1.10) as u32, b * 2),
        QualityPreset::High => ((f * 3 / 2).clamp(20, 90), (b as f64 * 1.2) as u32, b * 2),
        QualityPreset::Optimal => (f.clamp(20, 60), (b as f64 * 1.08) as u32, b * 2),
        QualityPreset::Balanced => ((f * 3 / 2).clamp(20, 90), (b as f64 * 1.2) as u32, b * 2),
    }
}

/// Capture ring buffer size per preset.
pub fn capture_rtbufsize_for_preset(preset: QualityPreset) -> &'static str {
    match preset {
        QualityPreset::LowLatency => "64M",
        QualityPreset::Low => "96M",
        QualityPreset::Optimal => "256M",
        QualityPreset::Balanced | QualityPreset::High => "192M",
    }
}

/// Build the full pipeline argv for the given source mode and target
/// bitrate. A non-empty custom pipeline overrides everything.
pub fn build_video_pipeline_args(
    mode: SourceMode,
    spec: &VideoPipelineSpec,
    bitrate_kbps: u32,
    platform: CapturePlatform,
) -> Result<Vec<String>, PipelineError> {
    let custom = spec.custom_pipeline.trim();
    if !custom.is_empty() {
        let mut parsed = split_command_line(custom).map_err(PipelineError::CustomPipeline)?;
        if parsed.is_empty() {
            return Err(PipelineError::EmptyCustomPipeline);
        }
        if platform == CapturePlatform::Windows {
            parsed = normalize_dshow_input_args(&parsed);
        }
        return Ok(parsed);
    }

    match mode {
        SourceMode::Capture => {
            let fps = effective_capture_fps(spec.fps, spec.encoder_mode);
            let mut args = build_capture_input_args(
                &spec.capture_input,
                fps,
                spec.quality_preset,
                spec.encoder_mode,
                platform,
            )?;
            args.push("-an".to_string());
            args.extend(default_encoder_args(spec, bitrate_kbps, fps));
            Ok(args)
        }
        SourceMode::Testsrc => {
            let fps = clamp_fps(spec.fps);
            let mut args = vec![
                "-f".to_string(),
                "lavfi".to_string(),
                "-i".to_string(),
                format!("testsrc=size=1280x720:rate={fps}"),
                "-an".to_string(),
            ];
            args.extend(default_encoder_args(spec, bitrate_kbps, spec.fps));
            Ok(args)
        }
    }
}

/// Build the input stage for capture mode: the configured capture input if
/// provided (with DirectShow repair and framerate/rtbufsize upsert on
/// Windows), else the platform default device.
pub fn build_capture_input_args(
    raw: &str,
    fps: u32,
    preset: QualityPreset,
    encoder: EncoderMode,
    platform: CapturePlatform,
) -> Result<Vec<String>, PipelineError> {
    let fps = clamp_fps(effective_capture_fps(fps, encoder));
    let rtbufsize = capture_rtbufsize_for_preset(preset);

    if !raw.trim().is_empty() {
        let mut parsed = split_command_line(raw.trim()).map_err(PipelineError::CaptureInput)?;
        if parsed.is_empty() {
            return Err(PipelineError::EmptyCaptureInput);
        }
        if platform == CapturePlatform::Windows {
            parsed = normalize_dshow_input_args(&parsed);
            if uses_dshow_input(&parsed) {
                parsed = upsert_dshow_capture_arg(&parsed, "-framerate", &fps.to_string());
                parsed = upsert_dshow_capture_arg(&parsed, "-rtbufsize", rtbufsize);
            }
        }
        return Ok(parsed);
    }

    let args = match platform {
        CapturePlatform::Windows => vec![
            "-f".to_string(),
            "dshow".to_string(),
            "-rtbufsize".to_string(),
            rtbufsize.to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-i".to_string(),
            "video=USB3.0 Video".to_string(),
        ],
        CapturePlatform::Linux => vec![
            "-f".to_string(),
            "v4l2".to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-video_size".to_string(),
            "1280x720".to_string(),
            "-i".to_string(),
            "/dev/video0".to_string(),
        ],
        CapturePlatform::MacOs => vec![
            "-f".to_string(),
            "avfoundation".to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-i".to_string(),
            "0:none".to_string(),
        ],
        CapturePlatform::Other => return Err(PipelineError::UnsupportedCapturePlatform),
    };
    Ok(args)
}

/// Encoder stage for the selected codec, with the image-quality bitrate
/// adjustment applied.
pub fn default_encoder_args(spec: &VideoPipelineSpec, bitrate_kbps: u32, fps: u32) -> Vec<String> {
    let iq = normalize_image_quality(spec.image_quality);
    let fps = clamp_fps(fps);
    let adjusted = apply_image_quality_to_bitrate(bitrate_kbps, iq);
    match resolve_codec(spec.codec_mode, spec.encoder_mode) {
        CodecMode::H264 => {
            default_h264_by_encoder_args(spec.quality_preset, iq, spec.encoder_mode, adjusted, fps)
        }
        _ => default_vp8_encoder_args(spec.quality_preset, iq, adjusted, fps),
    }
}

fn default_h264_by_encoder_args(
    preset: QualityPreset,
    image_quality: u32,
    encoder: EncoderMode,
    bitrate_kbps: u32,
    fps: u32,
) -> Vec<String> {
    match encoder {
        EncoderMode::Nvenc => {
            let mut args = default_h264_encoder_args("h264_nvenc", "yuv420p", preset, bitrate_kbps, fps);
            args.extend(["-tune".to_string(), "ll".to_string()]);
            args
        }
        EncoderMode::Amf => {
            let mut args = default_h264_encoder_args("h264_amf", "nv12", preset, bitrate_kbps, fps);
            args.extend(["-usage".to_string(), "lowlatency".to_string()]);
            args
        }
        EncoderMode::Qsv => {
            let mut args = vec!["-look_ahead".to_string(), "0".to_string()];
            args.extend(default_h264_encoder_args("h264_qsv", "nv12", preset, bitrate_kbps, fps));
            args
        }
        EncoderMode::V4l2m2m => {
            default_h264_encoder_args("h264_v4l2m2m", "yuv420p", preset, bitrate_kbps, fps)
        }
        EncoderMode::Vaapi => {
            // Works only when host ffmpeg + driver expose VAAPI; the caller
            // is expected to have probed for it.
            let bitrate = clamp_bitrate(bitrate_kbps);
            let (gop, maxrate, bufsize) = quality_rate_control(preset, bitrate, fps);
            vec![
                "-vaapi_device".to_string(),
                "/dev/dri/renderD128".to_string(),
                "-vf".to_string(),
                "format=nv12,hwupload".to_string(),
                "-c:v".to_string(),
                "h264_vaapi".to_string(),
                "-g".to_string(),
                gop.to_string(),
                "-b:v".to_string(),
                format!("{bitrate}k"),
                "-maxrate".to_string(),
                format!("{maxrate}k"),
                "-bufsize".to_string(),
                format!("{bufsize}k"),
            ]
        }
        // Legacy generic hw mode keeps behavior stable by using CPU H.264.
        EncoderMode::Hw | EncoderMode::Cpu | EncoderMode::Auto => {
            default_h264_cpu_args(preset, image_quality, bitrate_kbps, fps)
        }
    }
}

fn default_h264_cpu_args(
    preset: QualityPreset,
    image_quality: u32,
    bitrate_kbps: u32,
    fps: u32,
) -> Vec<String> {
    let bitrate = clamp_bitrate(bitrate_kbps);
    let (gop, maxrate, bufsize) = quality_rate_control(preset, bitrate, fps);
    let x_preset = match preset {
        QualityPreset::Low => "superfast",
        QualityPreset::LowLatency => "ultrafast",
        QualityPreset::High => "faster",
        QualityPreset::Optimal => "fast",
        QualityPreset::Balanced => "veryfast",
    };
    let mut args = vec![
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        x_preset.to_string(),
        "-tune".to_string(),
        "zerolatency".to_string(),
        "-profile:v".to_string(),
        "main".to_string(),
        "-vf".to_string(),
        "format=yuv420p".to_string(),
        "-g".to_string(),
        gop.to_string(),
        "-bf".to_string(),
        "0".to_string(),
        "-keyint_min".to_string(),
        gop.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-b:v".to_string(),
        format!("{bitrate}k"),
        "-maxrate".to_string(),
        format!("{maxrate}k"),
        "-bufsize".to_string(),
        format!("{bufsize}k"),
        // Loss recovery on unstable links: repeat SPS/PPS in keyframes and
        // keep NAL units below MTU-ish size.
        "-x264-params".to_string(),
        "repeat-headers=1:slice-max-size=1100".to_string(),
    ];
    if let Some(crf) = image_quality_to_x264_crf(image_quality) {
        args.extend(["-crf".to_string(), crf.to_string()]);
    }
    args
}

fn default_vp8_encoder_args(
    preset: QualityPreset,
    image_quality: u32,
    bitrate_kbps: u32,
    fps: u32,
) -> Vec<String> {
    let bitrate = clamp_bitrate(bitrate_kbps);
    let (gop, maxrate, bufsize) = quality_rate_control(preset, bitrate, fps);

    let cpu_used = match preset {
        QualityPreset::Low => "10",
        QualityPreset::LowLatency => "12",
        QualityPreset::High => "6",
        QualityPreset::Optimal => "4",
        QualityPreset::Balanced => "8",
    };

    let mut args = vec![
        "-c:v".to_string(),
        "libvpx".to_string(),
        "-deadline".to_string(),
        "realtime".to_string(),
        "-cpu-used".to_string(),
        cpu_used.to_string(),
    ];
    if preset == QualityPreset::LowLatency {
        args.extend([
            "-lag-in-frames".to_string(),
            "0".to_string(),
            "-error-resilient".to_string(),
            "1".to_string(),
            "-auto-alt-ref".to_string(),
            "0".to_string(),
        ]);
    }
    args.extend([
        "-vf".to_string(),
        "format=yuv420p".to_string(),
        "-g".to_string(),
        gop.to_string(),
        "-b:v".to_string(),
        format!("{bitrate}k"),
        "-maxrate".to_string(),
        format!("{maxrate}k"),
        "-bufsize".to_string(),
        format!("{bufsize}k"),
    ]);
    if let Some(crf) = image_quality_to_vp8_crf(image_quality) {
        args.extend(["-crf".to_string(), crf.to_string()]);
    }
    args
}

fn default_h264_encoder_args(
    encoder: &str,
    pix_fmt: &str,
    preset: QualityPreset,
    bitrate_kbps: u32,
    fps: u32,
) -> Vec<String> {
    let bitrate = clamp_bitrate(bitrate_kbps);
    let (gop, maxrate, bufsize) = quality_rate_control(preset, bitrate, fps);
    vec![
        "-c:v".to_string(),
        encoder.to_string(),
        "-g".to_string(),
        gop.to_string(),
        "-bf".to_string(),
        "0".to_string(),
        "-b:v".to_string(),
        format!("{bitrate}k"),
        "-maxrate".to_string(),
        format!("{maxrate}k"),
        "-bufsize".to_string(),
        format!("{bufsize}k"),
        "-pix_fmt".to_string(),
        pix_fmt.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(preset: QualityPreset, iq: u32, encoder: EncoderMode, codec: CodecMode) -> VideoPipelineSpec {
        VideoPipelineSpec {
            quality_preset: preset,
            image_quality: iq,
            encoder_mode: encoder,
            codec_mode: codec,
            fps: 30,
            custom_pipeline: String::new(),
            capture_input: String::new(),
        }
    }

    fn arg_value<'a>(args: &'a [String], key: &str) -> &'a str {
        args.windows(2)
            .find(|w| w[0] == key)
            .map(|w| w[1].as_str())
            .unwrap_or("")
    }

    #[test]
    fn auto_codec_selects_h264_for_hardware_encoders() {
        for enc in [
            EncoderMode::Nvenc,
            EncoderMode::Amf,
            EncoderMode::Qsv,
            EncoderMode::V4l2m2m,
            EncoderMode::Vaapi,
        ] {
            assert_eq!(resolve_codec(CodecMode::Auto, enc), CodecMode::H264);
        }
        for enc in [EncoderMode::Auto, EncoderMode::Cpu, EncoderMode::Hw] {
            assert_eq!(resolve_codec(CodecMode::Auto, enc), CodecMode::Vp8);
        }
        assert_eq!(resolve_codec(CodecMode::Vp8, EncoderMode::Nvenc), CodecMode::Vp8);
    }

    #[test]
    fn vp8_low_latency_differs_from_low() {
        let low = default_vp8_encoder_args(QualityPreset::Low, 70, 1200, 30);
        let lat = default_vp8_encoder_args(QualityPreset::LowLatency, 70, 1200, 30);
        assert_eq!(arg_value(&low, "-cpu-used"), "10");
        assert_eq!(arg_value(&lat, "-cpu-used"), "12");
        assert_eq!(arg_value(&low, "-g"), "90");
        assert_eq!(arg_value(&lat, "-g"), "30");
    }

    #[test]
    fn vp8_low_latency_adds_realtime_flags() {
        let args = default_vp8_encoder_args(QualityPreset::LowLatency, 70, 1200, 30);
        assert_eq!(arg_value(&args, "-lag-in-frames"), "0");
        assert_eq!(arg_value(&args, "-error-resilient"), "1");
        assert_eq!(arg_value(&args, "-auto-alt-ref"), "0");
    }

    #[test]
    fn h264_cpu_low_latency_differs_from_low() {
        let low = default_h264_cpu_args(QualityPreset::Low, 70, 1200, 30);
        let lat = default_h264_cpu_args(QualityPreset::LowLatency, 70, 1200, 30);
        assert_eq!(arg_value(&low, "-preset"), "superfast");
        assert_eq!(arg_value(&lat, "-preset"), "ultrafast");
        assert_eq!(arg_value(&low, "-g"), "90");
        assert_eq!(arg_value(&lat, "-g"), "30");
    }

    #[test]
    fn h264_base_low_latency_rate_control() {
        let args = default_h264_encoder_args("h264_nvenc", "yuv420p", QualityPreset::LowLatency, 1200, 30);
        assert_eq!(arg_value(&args, "-g"), "30");
        assert_eq!(arg_value(&args, "-maxrate"), "1320k"); // 1.10 * 1200
        assert_eq!(arg_value(&args, "-bufsize"), "2400k"); // 2 * 1200
        assert_eq!(arg_value(&args, "-pix_fmt"), "yuv420p");
    }

    #[test]
    fn rate_control_table_matches_presets() {
        // (preset, gop, maxrate, bufsize) at 30 fps / 1200 kbps
        let cases = [
            (QualityPreset::Low, 90, 1379, 3600),
            (QualityPreset::LowLatency, 30, 1320, 2400),
            (QualityPreset::Balanced, 45, 1439, 2400),
            (QualityPreset::High, 45, 1439, 2400),
            (QualityPreset::Optimal, 30, 1296, 2400),
        ];
        for (preset, gop, maxrate, bufsize) in cases {
            assert_eq!(
                quality_rate_control(preset, 1200, 30),
                (gop, maxrate, bufsize),
                "{preset} mismatch"
            );
        }
    }

    #[test]
    fn low_latency_gop_scales_with_fps() {
        assert_eq!(quality_rate_control(QualityPreset::LowLatency, 1200, 30).0, 30);
        assert_eq!(quality_rate_control(QualityPreset::LowLatency, 1200, 60).0, 60);
    }

    #[test]
    fn image_quality_adds_crf_and_is_monotonic() {
        let low_q = default_vp8_encoder_args(QualityPreset::Balanced, 20, 1200, 30);
        let high_q = default_vp8_encoder_args(QualityPreset::Balanced, 90, 1200, 30);
        let low_crf: u32 = arg_value(&low_q, "-crf").parse().unwrap();
        let high_crf: u32 = arg_value(&high_q, "-crf").parse().unwrap();
        assert!(low_crf > high_crf, "higher quality must lower CRF");

        let mut prev_vp8 = u32::MAX;
        let mut prev_x264 = u32::MAX;
        for q in (1..=100).step_by(11) {
            let vp8 = image_quality_to_vp8_crf(q).unwrap();
            let x264 = image_quality_to_x264_crf(q).unwrap();
            assert!(vp8 < prev_vp8 || q == 1);
            assert!(x264 < prev_x264 || q == 1);
            prev_vp8 = vp8;
            prev_x264 = x264;
        }
        assert_eq!(image_quality_to_vp8_crf(1), Some(50));
        assert_eq!(image_quality_to_vp8_crf(100), Some(10));
        assert_eq!(image_quality_to_x264_crf(1), Some(35));
        assert_eq!(image_quality_to_x264_crf(100), Some(18));
    }

    #[test]
    fn image_quality_auto_omits_crf() {
        let args = default_vp8_encoder_args(QualityPreset::Balanced, 0, 1200, 30);
        assert_eq!(arg_value(&args, "-crf"), "");
        let args = default_h264_cpu_args(QualityPreset::Balanced, 0, 1200, 30);
        assert_eq!(arg_value(&args, "-crf"), "");
    }

    #[test]
    fn image_quality_scales_bitrate_gently() {
        assert_eq!(apply_image_quality_to_bitrate(1200, 0), 1200);
        let floor = apply_image_quality_to_bitrate(1200, 1);
        let ceil = apply_image_quality_to_bitrate(1200, 100);
        assert!(floor < 1100, "0.85x floor, got {floor}");
        assert!(ceil > 1300 && ceil < 1400, "1.15x ceiling, got {ceil}");
        // Stays inside the global bitrate bounds.
        assert_eq!(apply_image_quality_to_bitrate(12_000, 100), 12_000);
        assert_eq!(apply_image_quality_to_bitrate(200, 1), 200);
    }

    #[test]
    fn rtbufsize_per_preset() {
        assert_eq!(capture_rtbufsize_for_preset(QualityPreset::LowLatency), "64M");
        assert_eq!(capture_rtbufsize_for_preset(QualityPreset::Low), "96M");
        assert_eq!(capture_rtbufsize_for_preset(QualityPreset::Balanced), "192M");
        assert_eq!(capture_rtbufsize_for_preset(QualityPreset::High), "192M");
        assert_eq!(capture_rtbufsize_for_preset(QualityPreset::Optimal), "256M");
    }

    #[test]
    fn cpu_capture_caps_fps() {
        assert_eq!(effective_capture_fps(60, EncoderMode::Cpu), 30);
        assert_eq!(effective_capture_fps(25, EncoderMode::Cpu), 25);
        assert_eq!(effective_capture_fps(60, EncoderMode::Nvenc), 60);
    }

    #[test]
    fn testsrc_pipeline_shape() {
        let spec = spec(QualityPreset::Balanced, 0, EncoderMode::Auto, CodecMode::Auto);
        let args =
            build_video_pipeline_args(SourceMode::Testsrc, &spec, 1200, CapturePlatform::Linux)
                .unwrap();
        assert_eq!(args[0], "-f");
        assert_eq!(args[1], "lavfi");
        assert_eq!(arg_value(&args, "-i"), "testsrc=size=1280x720:rate=30");
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(arg_value(&args, "-c:v"), "libvpx");
        assert_eq!(arg_value(&args, "-b:v"), "1200k");
    }

    #[test]
    fn linux_capture_default_device() {
        let spec = spec(QualityPreset::Balanced, 0, EncoderMode::Auto, CodecMode::Auto);
        let args =
            build_video_pipeline_args(SourceMode::Capture, &spec, 1200, CapturePlatform::Linux)
                .unwrap();
        assert_eq!(arg_value(&args, "-f"), "v4l2");
        assert_eq!(arg_value(&args, "-i"), "/dev/video0");
        assert_eq!(arg_value(&args, "-video_size"), "1280x720");
        assert_eq!(arg_value(&args, "-framerate"), "30");
    }

    #[test]
    fn windows_capture_default_device() {
        let args = build_capture_input_args(
            "",
            30,
            QualityPreset::Balanced,
            EncoderMode::Auto,
            CapturePlatform::Windows,
        )
        .unwrap();
        assert_eq!(arg_value(&args, "-f"), "dshow");
        assert_eq!(arg_value(&args, "-i"), "video=USB3.0 Video");
        assert_eq!(arg_value(&args, "-rtbufsize"), "192M");
    }

    #[test]
    fn windows_custom_capture_input_is_normalized_and_upserted() {
        let args = build_capture_input_args(
            "-f dshow -i video=USB3.0 Video",
            60,
            QualityPreset::LowLatency,
            EncoderMode::Auto,
            CapturePlatform::Windows,
        )
        .unwrap();
        assert_eq!(arg_value(&args, "-i"), "video=USB3.0 Video");
        assert_eq!(arg_value(&args, "-framerate"), "60");
        assert_eq!(arg_value(&args, "-rtbufsize"), "64M");
    }

    #[test]
    fn custom_pipeline_overrides_everything() {
        let mut s = spec(QualityPreset::Balanced, 50, EncoderMode::Nvenc, CodecMode::H264);
        s.custom_pipeline = "-f lavfi -i testsrc -c:v libvpx".to_string();
        let args =
            build_video_pipeline_args(SourceMode::Capture, &s, 1200, CapturePlatform::Linux)
                .unwrap();
        let want: Vec<String> = ["-f", "lavfi", "-i", "testsrc", "-c:v", "libvpx"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(args, want);
    }

    #[test]
    fn blank_custom_pipeline_pieces_are_rejected() {
        let mut s = spec(QualityPreset::Balanced, 0, EncoderMode::Auto, CodecMode::Auto);
        s.custom_pipeline = "\"".to_string();
        assert!(matches!(
            build_video_pipeline_args(SourceMode::Testsrc, &s, 1200, CapturePlatform::Linux),
            Err(PipelineError::CustomPipeline(_))
        ));
        s.custom_pipeline = "''".to_string();
        assert!(matches!(
            build_video_pipeline_args(SourceMode::Testsrc, &s, 1200, CapturePlatform::Linux),
            Err(PipelineError::EmptyCustomPipeline)
        ));
    }

    #[test]
    fn unsupported_platform_requires_capture_input() {
        assert!(matches!(
            build_capture_input_args(
                "",
                30,
                QualityPreset::Balanced,
                EncoderMode::Auto,
                CapturePlatform::Other,
            ),
            Err(PipelineError::UnsupportedCapturePlatform)
        ));
    }

    #[test]
    fn qsv_prepends_lookahead_and_nvenc_appends_tune() {
        let qsv = default_h264_by_encoder_args(QualityPreset::Balanced, 0, EncoderMode::Qsv, 1200, 30);
        assert_eq!(qsv[0], "-look_ahead");
        assert_eq!(qsv[1], "0");
        assert_eq!(arg_value(&qsv, "-c:v"), "h264_qsv");

        let nvenc = default_h264_by_encoder_args(QualityPreset::Balanced, 0, EncoderMode::Nvenc, 1200, 30);
        assert_eq!(arg_value(&nvenc, "-tune"), "ll");

        let amf = default_h264_by_encoder_args(QualityPreset::Balanced, 0, EncoderMode::Amf, 1200, 30);
        assert_eq!(arg_value(&amf, "-usage"), "lowlatency");
        assert_eq!(arg_value(&amf, "-pix_fmt"), "nv12");
    }

    #[test]
    fn vaapi_uses_device_and_hwupload() {
        let args = default_h264_by_encoder_args(QualityPreset::Balanced, 0, EncoderMode::Vaapi, 1200, 30);
        assert_eq!(arg_value(&args, "-vaapi_device"), "/dev/dri/renderD128");
        assert_eq!(arg_value(&args, "-vf"), "format=nv12,hwupload");
        assert_eq!(arg_value(&args, "-c:v"), "h264_vaapi");
        // No B-frame or pix_fmt flags on the vaapi path.
        assert_eq!(arg_value(&args, "-pix_fmt"), "");
    }

    #[test]
    fn hw_mode_falls_back_to_cpu_h264() {
        let args = default_h264_by_encoder_args(QualityPreset::Balanced, 0, EncoderMode::Hw, 1200, 30);
        assert_eq!(arg_value(&args, "-c:v"), "libx264");
    }

    #[test]
    fn image_quality_scales_b_v_in_full_pipeline() {
        let s = spec(QualityPreset::Balanced, 1, EncoderMode::Auto, CodecMode::Auto);
        let args =
            build_video_pipeline_args(SourceMode::Testsrc, &s, 1200, CapturePlatform::Linux)
                .unwrap();
        let adjusted = apply_image_quality_to_bitrate(1200, 1);
        assert!(adjusted < 1200);
        assert_eq!(arg_value(&args, "-b:v"), format!("{adjusted}k"));
        // maxrate/bufsize follow the adjusted bitrate
        assert_eq!(arg_value(&args, "-bufsize"), format!("{}k", adjusted * 2));
    }
}
