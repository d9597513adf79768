//! Adaptive bitrate control.
//!
//! The controller compares EMA-smoothed measured throughput against the
//! current target and proposes a new target. Two hysteresis gates filter
//! oscillation: the same trend must hold for a consecutive number of
//! evaluations, and applied changes are separated by a minimum interval.
//! A violated gate resets the trend counter.

use std::time::Instant;

use tracing::debug;

use crate::config::{AbrSettings, ABR_CEILING_KBPS, BITRATE_MAX_KBPS, BITRATE_MIN_KBPS};

/// EMA weight kept from the previous estimate.
const EMA_KEEP: f64 = 0.75;
/// EMA weight of the new sample.
const EMA_SAMPLE: f64 = 0.25;

/// Why a bitrate change was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrReason {
    Down,
    Up,
    BackToTarget,
}

impl AbrReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbrReason::Down => "down",
            AbrReason::Up => "up",
            AbrReason::BackToTarget => "back_to_target",
        }
    }
}

/// An applied bitrate change.
#[derive(Debug, Clone, Copy)]
pub struct AbrChange {
    pub prev_kbps: u32,
    pub next_kbps: u32,
    pub reason: AbrReason,
    pub measured_kbps: u32,
    pub smoothed_kbps: u32,
}

/// Propose the next target bitrate from a smoothed measurement.
///
/// Thresholds are deliberately conservative: every applied change restarts
/// the encoder, so small deltas are not worth acting on.
pub fn adaptive_bitrate_next(
    current: u32,
    configured: u32,
    measured: u32,
    min_kbps: u32,
    max_kbps: u32,
) -> Option<(u32, AbrReason)> {
    let cfg = configured.clamp(BITRATE_MIN_KBPS, BITRATE_MAX_KBPS);
    let min_v = min_kbps.clamp(BITRATE_MIN_KBPS, ABR_CEILING_KBPS);
    let max_v = max_kbps.clamp(min_v, ABR_CEILING_KBPS);
    let cur = current
        .clamp(BITRATE_MIN_KBPS, BITRATE_MAX_KBPS)
        .clamp(min_v, max_v);
    if measured == 0 {
        return None;
    }

    let min_delta_down = 80.max((cur as f64 * 0.05) as u32);
    let min_delta_up = 40.max((cur as f64 * 0.03) as u32);

    let down_threshold = (cur as f64 * 0.65) as u32;
    if measured < down_threshold {
        let proposed = ((measured as f64 * 1.18) as u32).clamp(min_v, max_v);
        if proposed < cur - min_delta_down {
            return Some((proposed, AbrReason::Down));
        }
    }

    let up_threshold = (cur as f64 * 1.45) as u32;
    if measured > up_threshold && cur < cfg {
        let proposed = ((cur as f64 * 1.06) as u32).clamp(min_v, max_v.min(cfg));
        if proposed > cur + min_delta_up {
            return Some((proposed, AbrReason::Up));
        }
    }

    if cur > cfg {
        let proposed = cfg.clamp(min_v, max_v);
        if proposed < cur - min_delta_down {
            return Some((proposed, AbrReason::BackToTarget));
        }
    }

    None
}

/// Tracks the smoothed throughput estimate and the hysteresis state for one
/// encoder pipeline.
pub struct AbrController {
    settings: AbrSettings,
    configured_kbps: u32,
    current_kbps: u32,
    ema_kbps: f64,
    trend: Option<AbrReason>,
    trend_count: u32,
    last_change_at: Option<Instant>,
}

impl AbrController {
    pub fn new(settings: AbrSettings, configured_kbps: u32) -> Self {
        let configured_kbps = configured_kbps.clamp(BITRATE_MIN_KBPS, BITRATE_MAX_KBPS);
        Self {
            settings,
            configured_kbps,
            current_kbps: configured_kbps,
            ema_kbps: configured_kbps as f64,
            trend: None,
            trend_count: 0,
            last_change_at: None,
        }
    }

    pub fn current_kbps(&self) -> u32 {
        self.current_kbps
    }

    /// Feed one throughput measurement. Returns the change to apply, if the
    /// proposal survived both hysteresis gates.
    pub fn on_sample(&mut self, measured_kbps: u32, now: Instant) -> Option<AbrChange> {
        self.ema_kbps = self.ema_kbps * EMA_KEEP + measured_kbps as f64 * EMA_SAMPLE;
        let smoothed_kbps = self.ema_kbps as u32;

        let Some((next, reason)) = adaptive_bitrate_next(
            self.current_kbps,
            self.configured_kbps,
            smoothed_kbps,
            self.settings.min_kbps,
            self.settings.max_kbps,
        ) else {
            self.reset_trend();
            return None;
        };

        if self.trend == Some(reason) {
            self.trend_count += 1;
        } else {
            self.trend = Some(reason);
            self.trend_count = 1;
        }
        if self.trend_count < self.settings.consecutive_required {
            return None;
        }
        if let Some(last) = self.last_change_at {
            if now.duration_since(last) < self.settings.min_change_interval {
                debug!(
                    "abr change {} held by min-change interval",
                    reason.as_str()
                );
                self.reset_trend();
                return None;
            }
        }

        let prev_kbps = self.current_kbps;
        self.current_kbps = next;
        self.last_change_at = Some(now);
        self.reset_trend();
        Some(AbrChange {
            prev_kbps,
            next_kbps: next,
            reason,
            measured_kbps,
            smoothed_kbps,
        })
    }

    fn reset_trend(&mut self) {
        self.trend = None;
        self.trend_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(consecutive: u32) -> AbrSettings {
        AbrSettings {
            enabled: true,
            consecutive_required: consecutive,
            ..AbrSettings::default()
        }
    }

    #[test]
    fn proposes_down_when_throughput_collapses() {
        let (next, reason) = adaptive_bitrate_next(1200, 1200, 600, 400, 6000).unwrap();
        assert_eq!(reason, AbrReason::Down);
        assert!(next < 1200);
        assert_eq!(next, (600.0f64 * 1.18) as u32);
    }

    #[test]
    fn proposes_up_below_ceiling() {
        let (next, reason) = adaptive_bitrate_next(900, 1200, 1400, 400, 6000).unwrap();
        assert_eq!(reason, AbrReason::Up);
        assert!(next > 900 && next <= 1200);
    }

    #[test]
    fn holds_within_hysteresis_band() {
        assert!(adaptive_bitrate_next(1200, 1200, 1100, 400, 6000).is_none());
    }

    #[test]
    fn never_raises_past_configured_target() {
        let (next, reason) = adaptive_bitrate_next(1000, 1200, 2000, 400, 6000).unwrap();
        assert_eq!(reason, AbrReason::Up);
        assert_eq!(next, 1060); // 1000 * 1.06
        // A proposal past the configured target clamps to it.
        let (next, reason) = adaptive_bitrate_next(1150, 1200, 2000, 400, 6000).unwrap();
        assert_eq!(reason, AbrReason::Up);
        assert_eq!(next, 1200);
    }

    #[test]
    fn back_to_target_returns_to_configured() {
        let (next, reason) = adaptive_bitrate_next(2000, 1200, 1900, 400, 6000).unwrap();
        assert_eq!(reason, AbrReason::BackToTarget);
        assert_eq!(next, 1200);
    }

    #[test]
    fn result_respects_bounds_and_never_exceeds_max_of_current_and_configured() {
        for (cur, cfg, m) in [
            (1200u32, 1200u32, 300u32),
            (2000, 1200, 1900),
            (800, 1200, 2000),
            (6000, 6000, 100),
        ] {
            if let Some((next, reason)) = adaptive_bitrate_next(cur, cfg, m, 400, 6000) {
                assert!((400..=6000).contains(&next));
                if matches!(reason, AbrReason::Down | AbrReason::BackToTarget) {
                    assert!(next <= cur.max(cfg));
                }
            }
        }
    }

    #[test]
    fn zero_measurement_never_changes() {
        assert!(adaptive_bitrate_next(1200, 1200, 0, 400, 6000).is_none());
    }

    #[test]
    fn single_sample_never_triggers_with_consecutive_required() {
        let mut ctl = AbrController::new(settings(3), 1200);
        let now = Instant::now();
        assert!(ctl.on_sample(100, now).is_none());
        assert_eq!(ctl.current_kbps(), 1200);
    }

    #[test]
    fn consecutive_confirmations_apply_the_change() {
        let mut ctl = AbrController::new(settings(3), 1200);
        let t0 = Instant::now();
        // EMA trace for constant 100 kbps samples, seeded at 1200:
        // 925, 718, 564, 448. The first sample stays above the down
        // threshold, the next three confirm the trend.
        assert!(ctl.on_sample(100, t0).is_none());
        assert!(ctl.on_sample(100, t0 + Duration::from_secs(6)).is_none());
        assert!(ctl.on_sample(100, t0 + Duration::from_secs(12)).is_none());
        let change = ctl
            .on_sample(100, t0 + Duration::from_secs(18))
            .expect("third confirmation applies");
        assert_eq!(change.reason, AbrReason::Down);
        assert_eq!(change.prev_kbps, 1200);
        assert_eq!(change.smoothed_kbps, 448);
        assert_eq!(change.next_kbps, 528); // 448 * 1.18
        assert_eq!(ctl.current_kbps(), 528);
    }

    #[test]
    fn trend_reset_when_no_candidate_between_confirmations() {
        let mut ctl = AbrController::new(settings(2), 1200);
        let t0 = Instant::now();
        let at = |secs: u64| t0 + Duration::from_secs(secs);
        assert!(ctl.on_sample(100, at(0)).is_none()); // ema 925, no candidate
        assert!(ctl.on_sample(100, at(6)).is_none()); // ema 718, down x1
        // A throughput burst drags the EMA back above the down threshold
        // and resets the trend.
        assert!(ctl.on_sample(2000, at(12)).is_none()); // ema 1039
        assert!(ctl.on_sample(100, at(18)).is_none()); // ema 804, no candidate
        // One qualifying sample after the reset is not enough again.
        assert!(ctl.on_sample(100, at(24)).is_none()); // ema 628, down x1
        assert!(ctl.on_sample(100, at(30)).is_some()); // down x2, applied
    }

    #[test]
    fn min_change_interval_gates_and_resets_trend() {
        let mut ctl = AbrController::new(settings(1), 1200);
        let t0 = Instant::now();
        assert!(ctl.on_sample(100, t0).is_none()); // ema 925, no candidate
        let first = ctl
            .on_sample(100, t0 + Duration::from_secs(6))
            .expect("qualifying sample applies with consecutive=1");
        assert_eq!(first.reason, AbrReason::Down);
        assert_eq!(first.next_kbps, 847); // 718 * 1.18
        // Qualifying again inside the 20 s cooldown: held.
        assert!(ctl.on_sample(0, t0 + Duration::from_secs(12)).is_none());
        // After the cooldown the change applies.
        assert!(ctl.on_sample(0, t0 + Duration::from_secs(30)).is_some());
    }

    #[test]
    fn ema_is_seeded_at_configured() {
        let mut ctl = AbrController::new(settings(1), 1200);
        // One low sample only moves the EMA a quarter of the way:
        // 1200 * 0.75 + 0 * 0.25 = 900, which is above 0.65 * 1200 = 780.
        assert!(ctl.on_sample(0, Instant::now()).is_none());
        assert_eq!(ctl.current_kbps(), 1200);
    }
}
