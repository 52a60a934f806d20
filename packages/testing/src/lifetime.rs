use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts how many [`LifetimeProbe`] values were created and dropped.
///
/// Clones share the same counters, so a test can keep one copy while probes move into the code
/// under test.
///
/// ```rust
/// use testing::LifetimeCounters;
///
/// let counters = LifetimeCounters::new();
///
/// let probe = counters.probe();
/// assert_eq!(counters.alive(), 1);
///
/// drop(probe);
/// assert_eq!(counters.alive(), 0);
/// assert_eq!(counters.dropped(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct LifetimeCounters {
    inner: Arc<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    constructed: AtomicUsize,
    dropped: AtomicUsize,
}

impl LifetimeCounters {
    /// Creates counters with nothing constructed or dropped yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a new probe that reports to these counters.
    #[must_use]
    pub fn probe(&self) -> LifetimeProbe {
        self.inner.constructed.fetch_add(1, Ordering::Relaxed);

        LifetimeProbe {
            counters: self.clone(),
        }
    }

    /// How many probes have been constructed (including clones).
    #[must_use]
    pub fn constructed(&self) -> usize {
        self.inner.constructed.load(Ordering::Relaxed)
    }

    /// How many probes have been dropped.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// How many probes are currently alive.
    ///
    /// # Panics
    ///
    /// Panics if more probes were dropped than constructed, which means something was
    /// dropped twice.
    #[must_use]
    pub fn alive(&self) -> usize {
        self.constructed()
            .checked_sub(self.dropped())
            .expect("more probes dropped than constructed - double drop detected")
    }
}

/// A value that records its construction and destruction in [`LifetimeCounters`].
#[derive(Debug)]
pub struct LifetimeProbe {
    counters: LifetimeCounters,
}

impl Clone for LifetimeProbe {
    fn clone(&self) -> Self {
        self.counters.probe()
    }
}

impl Drop for LifetimeProbe {
    fn drop(&mut self) {
        self.counters.inner.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
