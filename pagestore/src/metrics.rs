use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Metric {
    /// Counter of total page acquisitions
    PageRequests,
    /// Counter of page acquisitions that had to read from a partition file
    PageCacheMisses,
    /// Counter of pages removed from the buffer pools by idle sweeps
    PagesEvicted,
    /// Counter of before-images appended to the recovery logs
    BeforeImagesLogged,
    /// Counter of dirty pages written to partition files
    PagesFlushed,
    /// Timer used to record average page read time on a cache miss
    PageFetchTime,
    /// Timer used to record average global commit time
    CommitTime,
}

struct ActiveMetrics {
    page_requests: AtomicU64,
    page_cache_misses: AtomicU64,
    pages_evicted: AtomicU64,
    before_images_logged: AtomicU64,
    pages_flushed: AtomicU64,
    page_fetch_time: Timer,
    commit_time: Timer,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    page_requests: AtomicU64::new(0),
                    page_cache_misses: AtomicU64::new(0),
                    pages_evicted: AtomicU64::new(0),
                    before_images_logged: AtomicU64::new(0),
                    pages_flushed: AtomicU64::new(0),
                    page_fetch_time: Timer::new(),
                    commit_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    fn counter(metrics: &ActiveMetrics, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::PageRequests => &metrics.page_requests,
            Metric::PageCacheMisses => &metrics.page_cache_misses,
            Metric::PagesEvicted => &metrics.pages_evicted,
            Metric::BeforeImagesLogged => &metrics.before_images_logged,
            Metric::PagesFlushed => &metrics.pages_flushed,
            _ => panic!("Specified metric is not a Counter"),
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        self.count_n(metric, 1);
    }

    /// Increase the Counter specified by the input by `n`
    pub fn count_n(&self, metric: Metric, n: u64) {
        if let Some(ref metrics) = self.metrics {
            Self::counter(metrics, metric).fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value of a Counter. `None` if metrics are not active.
    pub fn get(&self, metric: Metric) -> Option<u64> {
        self.metrics
            .as_ref()
            .map(|metrics| Self::counter(metrics, metric).load(Ordering::Relaxed))
    }

    /// Returns a guard that, when dropped, will record the time passed since creation
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record<'a>(&'a self, metric: Metric) -> Option<impl Drop + 'a> {
        self.metrics.as_ref().map(|metrics| {
            let timer = match metric {
                Metric::PageFetchTime => &metrics.page_fetch_time,
                Metric::CommitTime => &metrics.commit_time,
                _ => panic!("Specified metric is not a Timer"),
            };

            timer.record()
        })
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let tot_page_requests = metrics.page_requests.load(Ordering::Relaxed);
            println!("  page requests         {}", tot_page_requests);

            if tot_page_requests != 0 {
                let cache_misses = metrics.page_cache_misses.load(Ordering::Relaxed);
                let percentage_cache_misses =
                    (cache_misses as f64 / tot_page_requests as f64) * 100.0;

                println!(
                    "  page cache misses     {} - {:.2}% of page requests",
                    cache_misses, percentage_cache_misses
                );
            }

            let evicted = metrics.pages_evicted.load(Ordering::Relaxed);
            println!("  pages evicted         {}", evicted);

            let logged = metrics.before_images_logged.load(Ordering::Relaxed);
            println!("  before-images logged  {}", logged);

            let flushed = metrics.pages_flushed.load(Ordering::Relaxed);
            println!("  pages flushed         {}", flushed);

            if let Some(mean) = metrics.page_fetch_time.mean() {
                println!("  page fetch mean       {}", pretty_display_ns(mean));
            }

            if let Some(mean) = metrics.commit_time.mean() {
                println!("  commit mean           {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record<'a>(&'a self) -> impl Drop + 'a {
        struct TimerGuard<'a> {
            start: std::time::Instant,
            n: &'a AtomicU64,
            sum: &'a AtomicU64,
        }

        impl Drop for TimerGuard<'_> {
            fn drop(&mut self) {
                let elapsed = self.start.elapsed().as_nanos() as u64;
                self.n.fetch_add(1, Ordering::Relaxed);
                self.sum.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        TimerGuard {
            start: std::time::Instant::now(),
            n: &self.number_of_records,
            sum: &self.sum,
        }
    }
}
