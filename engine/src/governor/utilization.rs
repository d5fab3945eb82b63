/// System-wide GPU utilization sampling
///
/// The performance counter is opened and primed once, on a detached
/// background thread. Until priming finishes every sample is reported as
/// unavailable; callers never block on the priming sequence.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

/// A system performance counter reporting GPU utilization in percent.
pub trait UtilizationCounter: Send {
    /// Current utilization, or `None` when the counter cannot be read.
    fn collect(&mut self) -> Option<f64>;
}

/// Opens the counter on the priming thread
pub type CounterOpener = Box<dyn FnOnce() -> Option<Box<dyn UtilizationCounter>> + Send>;

/// Sums `gpu_busy_percent` over every DRM card that exposes it
#[derive(Debug)]
pub struct SysfsGpuCounter {
    paths: Vec<PathBuf>,
}

impl SysfsGpuCounter {
    pub const PATTERN: &'static str = "/sys/class/drm/card*/device/gpu_busy_percent";

    /// Open the counter; `None` if no card reports its busy percentage.
    pub fn open() -> Option<Self> {
        Self::open_pattern(Self::PATTERN)
    }

    pub fn open_pattern(pattern: &str) -> Option<Self> {
        let paths: Vec<PathBuf> = glob::glob(pattern)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();

        if paths.is_empty() {
            log::debug!("No GPU utilization counter matches {}", pattern);
            return None;
        }
        log::debug!("GPU utilization counter opened over {} card(s)", paths.len());
        Some(Self { paths })
    }
}

impl UtilizationCounter for SysfsGpuCounter {
    fn collect(&mut self) -> Option<f64> {
        let mut total = 0.0;
        let mut read_any = false;
        for path in &self.paths {
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            if let Ok(value) = contents.trim().parse::<f64>() {
                total += value;
                read_any = true;
            }
        }
        read_any.then_some(total)
    }
}

struct SamplerShared {
    ready: AtomicBool,
    counter: Mutex<Option<Box<dyn UtilizationCounter>>>,
}

/// One-time primed utilization sampler
pub struct UtilizationSampler {
    shared: Arc<SamplerShared>,
    init: Once,
    opener: Mutex<Option<CounterOpener>>,
    prime_interval: Duration,
    /// The first reading after priming is thrown away
    has_primed_sample: bool,
}

impl UtilizationSampler {
    /// Sampler over a counter opened lazily by `opener`
    pub fn new(opener: CounterOpener, prime_interval: Duration) -> Self {
        Self {
            shared: Arc::new(SamplerShared {
                ready: AtomicBool::new(false),
                counter: Mutex::new(None),
            }),
            init: Once::new(),
            opener: Mutex::new(Some(opener)),
            prime_interval,
            has_primed_sample: false,
        }
    }

    /// Sampler over the system's DRM busy counters
    pub fn system(prime_interval: Duration) -> Self {
        Self::new(
            Box::new(|| {
                SysfsGpuCounter::open().map(|c| Box::new(c) as Box<dyn UtilizationCounter>)
            }),
            prime_interval,
        )
    }

    /// Sampler over a counter that needs no priming
    pub fn ready(counter: Box<dyn UtilizationCounter>) -> Self {
        let sampler = Self::new(Box::new(|| None), Duration::ZERO);
        // Consume the Once so the opener never runs
        sampler.init.call_once(|| {});
        *sampler.shared.counter.lock().unwrap_or_else(PoisonError::into_inner) = Some(counter);
        sampler.shared.ready.store(true, Ordering::Release);
        Self {
            has_primed_sample: true,
            ..sampler
        }
    }

    /// Sampler that never becomes available
    pub fn unavailable() -> Self {
        Self::new(Box::new(|| None), Duration::ZERO)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Start priming if nothing has started it yet; returns immediately.
    pub fn start(&self) {
        self.init.call_once(|| {
            let Some(opener) = self
                .opener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            else {
                return;
            };
            let shared = self.shared.clone();
            let interval = self.prime_interval;
            let spawned = std::thread::Builder::new()
                .name("gpu-utilization".to_string())
                .spawn(move || prime(shared, opener, interval));
            if let Err(e) = spawned {
                log::warn!("Failed to start GPU utilization sampling: {}", e);
            }
        });
    }

    /// Latest utilization in percent, `None` while unavailable.
    pub fn sample(&mut self) -> Option<f64> {
        self.start();
        if !self.is_ready() {
            return None;
        }
        let value = {
            let mut counter = self.shared.counter.lock().unwrap_or_else(PoisonError::into_inner);
            counter.as_mut()?.collect()
        };
        if !self.has_primed_sample {
            self.has_primed_sample = true;
            return None;
        }
        value
    }
}

/// Open the counter and take the two spaced priming samples
fn prime(shared: Arc<SamplerShared>, opener: CounterOpener, interval: Duration) {
    let Some(mut counter) = opener() else {
        log::info!("GPU utilization counter unavailable; load governor will not throttle");
        return;
    };
    let _ = counter.collect();
    std::thread::sleep(interval);
    let _ = counter.collect();

    *shared.counter.lock().unwrap_or_else(PoisonError::into_inner) = Some(counter);
    shared.ready.store(true, Ordering::Release);
    log::debug!("GPU utilization counter primed");
}

impl std::fmt::Debug for UtilizationSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilizationSampler")
            .field("ready", &self.is_ready())
            .field("prime_interval", &self.prime_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Fixed(f64);

    impl UtilizationCounter for Fixed {
        fn collect(&mut self) -> Option<f64> {
            Some(self.0)
        }
    }

    fn wait_ready(sampler: &UtilizationSampler) {
        let start = Instant::now();
        while !sampler.is_ready() {
            assert!(start.elapsed() < Duration::from_secs(5), "sampler never primed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_unavailable_before_priming() {
        let mut sampler = UtilizationSampler::new(
            Box::new(|| Some(Box::new(Fixed(30.0)) as Box<dyn UtilizationCounter>)),
            Duration::from_millis(200),
        );
        assert_eq!(sampler.sample(), None);
        wait_ready(&sampler);
        // First reading after priming is discarded
        assert_eq!(sampler.sample(), None);
        assert_eq!(sampler.sample(), Some(30.0));
    }

    #[test]
    fn test_priming_runs_once() {
        let opened = Arc::new(AtomicUsize::new(0));
        let count = opened.clone();
        let sampler = UtilizationSampler::new(
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(Fixed(10.0)) as Box<dyn UtilizationCounter>)
            }),
            Duration::ZERO,
        );
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| sampler.start());
            }
        });
        wait_ready(&sampler);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_counter_stays_unavailable() {
        let mut sampler = UtilizationSampler::unavailable();
        sampler.start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!sampler.is_ready());
        assert_eq!(sampler.sample(), None);
    }

    #[test]
    fn test_ready_counter_samples_immediately() {
        let mut sampler = UtilizationSampler::ready(Box::new(Fixed(75.0)));
        assert_eq!(sampler.sample(), Some(75.0));
    }

    #[test]
    fn test_sysfs_counter_sums_cards() {
        let dir = tempfile::tempdir().unwrap();
        for (card, busy) in [("card0", "12\n"), ("card1", "30")] {
            let device = dir.path().join(card).join("device");
            std::fs::create_dir_all(&device).unwrap();
            std::fs::write(device.join("gpu_busy_percent"), busy).unwrap();
        }
        let pattern = format!("{}/card*/device/gpu_busy_percent", dir.path().display());
        let mut counter = SysfsGpuCounter::open_pattern(&pattern).unwrap();
        assert_eq!(counter.collect(), Some(42.0));

        let empty = format!("{}/none*/gpu_busy_percent", dir.path().display());
        assert!(SysfsGpuCounter::open_pattern(&empty).is_none());
    }
}
