/// GPU load governor
///
/// Measures the cost of one dispatch every `measure_interval` frames with
/// a timestamp pair, reads the result back `readback_delay` frames later and
/// combines it with the system-wide GPU utilization. Two consecutive
/// expensive measurements taken while the GPU is busy throttle the engine;
/// it stays throttled until utilization falls to the recovery threshold.
///
/// Frame cadence:
/// - frames `0..=warmup_frames`: no measurement
/// - every `measure_interval`-th frame after that: begin/end a timestamp pair
/// - `readback_delay` frames later: read the pair back (retried until ready)
pub mod utilization;

use std::time::Duration;

use crate::backend::{GpuDevice, TimingReadback};
use crate::config::GovernorSettings;

pub use utilization::{CounterOpener, SysfsGpuCounter, UtilizationCounter, UtilizationSampler};

/// Governor diagnostics, for display
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize)]
pub struct GovernorStats {
    pub frame: u64,
    /// Milliseconds of GPU time of the last measured dispatch
    pub last_cost_ms: f64,
    pub latest_utilization: Option<f64>,
    pub peak_utilization: f64,
    pub recovery_threshold: f64,
    pub excess_streak: u32,
    pub throttled: bool,
}

pub struct LoadGovernor {
    settings: GovernorSettings,
    sampler: UtilizationSampler,
    frame: u64,
    frame_end: u64,
    measuring: bool,
    read_pending: bool,
    last_cost: Duration,
    excess_streak: u32,
    throttled: bool,
    latest: Option<f64>,
    peak: f64,
    recovery: f64,
}

impl LoadGovernor {
    pub fn new(settings: GovernorSettings, sampler: UtilizationSampler) -> Self {
        Self {
            settings,
            sampler,
            frame: 0,
            frame_end: 0,
            measuring: false,
            read_pending: false,
            last_cost: Duration::ZERO,
            excess_streak: 0,
            throttled: false,
            latest: None,
            peak: 0.0,
            recovery: 0.0,
        }
    }

    /// Governor over the system utilization counter
    pub fn with_system_counter(settings: GovernorSettings) -> Self {
        let sampler = UtilizationSampler::system(Duration::from_millis(settings.prime_interval_ms));
        Self::new(settings, sampler)
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Replace the utilization source, e.g. with a fixed counter
    pub fn set_sampler(&mut self, sampler: UtilizationSampler) {
        self.sampler = sampler;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn last_cost(&self) -> Duration {
        self.last_cost
    }

    pub fn latest_utilization(&self) -> Option<f64> {
        self.latest
    }

    pub fn peak_utilization(&self) -> f64 {
        self.peak
    }

    pub fn recovery_threshold(&self) -> f64 {
        self.recovery
    }

    pub fn excess_streak(&self) -> u32 {
        self.excess_streak
    }

    pub fn is_read_pending(&self) -> bool {
        self.read_pending
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            frame: self.frame,
            last_cost_ms: self.last_cost.as_secs_f64() * 1000.0,
            latest_utilization: self.latest,
            peak_utilization: self.peak,
            recovery_threshold: self.recovery,
            excess_streak: self.excess_streak,
            throttled: self.throttled,
        }
    }

    fn on_interval(&self) -> bool {
        self.frame % self.settings.measure_interval.max(1) == 0
    }

    /// Consume a frame while throttled. Returns true when the dispatch must
    /// be skipped; utilization is still sampled every interval.
    pub fn veto(&mut self) -> bool {
        if !self.throttled {
            return false;
        }
        if self.on_interval() {
            self.monitor();
        }
        self.frame += 1;
        true
    }

    /// Begin a timestamp pair if this frame is a measurement frame
    pub fn start_timing(&mut self, device: &mut dyn GpuDevice) {
        if !self.settings.enabled
            || self.read_pending
            || self.frame <= self.settings.warmup_frames
            || !self.on_interval()
        {
            return;
        }
        match device.begin_timing() {
            Ok(()) => self.measuring = true,
            Err(e) => log::debug!("Could not start GPU timing: {}", e),
        }
    }

    pub fn end_timing(&mut self, device: &mut dyn GpuDevice) {
        if !self.measuring {
            return;
        }
        self.measuring = false;
        match device.end_timing() {
            Ok(()) => {
                self.read_pending = true;
                self.frame_end = self.frame;
            }
            Err(e) => log::debug!("Could not end GPU timing: {}", e),
        }
    }

    /// Close the pair around a dispatch that failed; it is never read back
    pub fn abandon_timing(&mut self, device: &mut dyn GpuDevice) {
        if !self.measuring {
            return;
        }
        self.measuring = false;
        if let Err(e) = device.end_timing() {
            log::debug!("Could not end GPU timing: {}", e);
        }
    }

    /// Read back a pending timestamp pair once the delay has passed
    pub fn read_timing(&mut self, device: &mut dyn GpuDevice) {
        if !self.read_pending || self.frame.saturating_sub(self.frame_end) < self.settings.readback_delay {
            return;
        }
        match device.read_timing() {
            TimingReadback::NotReady => {}
            TimingReadback::Disjoint => {
                log::debug!("GPU timestamps disjoint; measurement dropped");
                self.read_pending = false;
            }
            TimingReadback::Elapsed(cost) => {
                self.observe_cost(cost);
                self.read_pending = false;
            }
        }
    }

    /// Count the frame of a dispatch that went through
    pub fn advance_frame(&mut self) {
        self.frame += 1;
    }

    /// Feed one trusted dispatch measurement into the throttle state machine
    pub fn observe_cost(&mut self, cost: Duration) {
        self.last_cost = cost;
        self.monitor();

        let threshold = Duration::from_secs_f64(self.settings.cost_threshold_ms / 1000.0);
        if cost > threshold {
            // Without a live utilization sample the streak is left alone
            if self.latest.is_some_and(|u| u > 0.0) {
                self.excess_streak += 1;
            }
        } else {
            self.excess_streak = 0;
        }

        if self.excess_streak >= self.settings.excess_observations.max(1) {
            self.peak = self.latest.unwrap_or(0.0);
            self.recovery = (self.peak - self.settings.recovery_drop).max(self.settings.recovery_floor);
            self.throttled = true;
            self.excess_streak = 0;
            log::info!(
                "GPU overloaded ({:.2} ms per dispatch at {:.0}% utilization); throttling until {:.0}%",
                cost.as_secs_f64() * 1000.0,
                self.peak,
                self.recovery
            );
        }
    }

    /// Sample utilization and leave the throttled state on recovery
    pub fn monitor(&mut self) {
        let Some(utilization) = self.sampler.sample() else {
            // A counter that stopped reporting says nothing about the GPU now
            self.latest = None;
            return;
        };
        self.latest = Some(utilization);

        if self.recovery > 0.0 && utilization <= self.recovery {
            log::info!(
                "GPU utilization {:.0}% at or below {:.0}%; throttle released",
                utilization,
                self.recovery
            );
            self.recovery = 0.0;
            self.throttled = false;
        }
    }
}

impl std::fmt::Debug for LoadGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGovernor")
            .field("stats", &self.stats())
            .field("read_pending", &self.read_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Counter whose value the test can change
    struct Dial(Arc<AtomicU64>);

    impl UtilizationCounter for Dial {
        fn collect(&mut self) -> Option<f64> {
            Some(self.0.load(Ordering::SeqCst) as f64)
        }
    }

    fn governor(utilization: u64) -> (LoadGovernor, Arc<AtomicU64>) {
        let dial = Arc::new(AtomicU64::new(utilization));
        let sampler = UtilizationSampler::ready(Box::new(Dial(dial.clone())));
        (LoadGovernor::new(GovernorSettings::default(), sampler), dial)
    }

    const HEAVY: Duration = Duration::from_millis(6);
    const LIGHT: Duration = Duration::from_millis(1);

    #[test]
    fn test_single_excess_does_not_throttle() {
        let (mut governor, _) = governor(90);
        governor.observe_cost(HEAVY);
        assert!(!governor.is_throttled());
        assert_eq!(governor.excess_streak(), 1);
    }

    #[test]
    fn test_two_consecutive_excesses_throttle() {
        let (mut governor, _) = governor(90);
        governor.observe_cost(HEAVY);
        governor.observe_cost(HEAVY);
        assert!(governor.is_throttled());
        assert_eq!(governor.peak_utilization(), 90.0);
        assert_eq!(governor.recovery_threshold(), 70.0);
        assert_eq!(governor.excess_streak(), 0);
    }

    #[test]
    fn test_light_measurement_breaks_streak() {
        let (mut governor, _) = governor(90);
        governor.observe_cost(HEAVY);
        governor.observe_cost(LIGHT);
        governor.observe_cost(HEAVY);
        assert!(!governor.is_throttled());
    }

    #[test]
    fn test_recovery_floor() {
        let (mut governor, _) = governor(55);
        governor.observe_cost(HEAVY);
        governor.observe_cost(HEAVY);
        assert_eq!(governor.recovery_threshold(), 50.0);
    }

    #[test]
    fn test_idle_gpu_never_throttles() {
        let (mut governor, _) = governor(0);
        for _ in 0..4 {
            governor.observe_cost(HEAVY);
        }
        assert!(!governor.is_throttled());
    }

    #[test]
    fn test_unavailable_utilization_never_throttles() {
        let mut governor = LoadGovernor::new(GovernorSettings::default(), UtilizationSampler::unavailable());
        for _ in 0..4 {
            governor.observe_cost(HEAVY);
        }
        assert!(!governor.is_throttled());
        assert_eq!(governor.latest_utilization(), None);
    }

    /// Counter that can stop reporting
    struct Flaky(Arc<std::sync::Mutex<Option<f64>>>);

    impl UtilizationCounter for Flaky {
        fn collect(&mut self) -> Option<f64> {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn test_silent_counter_clears_utilization() {
        let value = Arc::new(std::sync::Mutex::new(Some(90.0)));
        let sampler = UtilizationSampler::ready(Box::new(Flaky(value.clone())));
        let mut governor = LoadGovernor::new(GovernorSettings::default(), sampler);

        governor.observe_cost(HEAVY);
        assert_eq!(governor.latest_utilization(), Some(90.0));
        assert_eq!(governor.excess_streak(), 1);

        // The stale 90% must not complete the streak
        *value.lock().unwrap() = None;
        governor.observe_cost(HEAVY);
        assert_eq!(governor.latest_utilization(), None);
        assert_eq!(governor.excess_streak(), 1);
        assert!(!governor.is_throttled());
    }

    #[test]
    fn test_veto_until_recovery() {
        let (mut governor, dial) = governor(95);
        governor.observe_cost(HEAVY);
        governor.observe_cost(HEAVY);
        assert!(governor.is_throttled());

        // Still busy: every frame is vetoed
        for _ in 0..240 {
            assert!(governor.veto());
        }
        assert!(governor.is_throttled());

        dial.store(75, Ordering::SeqCst);
        let mut vetoed = 0;
        while governor.is_throttled() {
            assert!(governor.veto());
            vetoed += 1;
            assert!(vetoed <= 120);
        }
        assert_eq!(governor.recovery_threshold(), 0.0);
        assert!(!governor.veto());
    }
}
