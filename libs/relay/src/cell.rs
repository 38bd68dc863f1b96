use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::sample::TelemetrySample;

/// Holds the single most recent sample.
///
/// Replacement is an atomic pointer swap, so readers get either the previous
/// sample or the new one in full. Samples are replaced wholesale, never merged.
pub struct LatestSample {
    inner: ArcSwapOption<TelemetrySample>,
}

impl Default for LatestSample {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestSample {
    pub fn new() -> Self {
        LatestSample {
            inner: ArcSwapOption::empty(),
        }
    }

    /// Publishes `sample`, returning the one it replaced.
    pub fn replace(&self, sample: Arc<TelemetrySample>) -> Option<Arc<TelemetrySample>> {
        self.inner.swap(Some(sample))
    }

    pub fn load(&self) -> Option<Arc<TelemetrySample>> {
        self.inner.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_none()
    }
}
