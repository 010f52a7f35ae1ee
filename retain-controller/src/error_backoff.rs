use ::backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use kube::ResourceExt;
use kube_runtime::watcher::Event;
use retain_controller_apis::Retainer;
use std::{collections::HashMap, sync::Mutex, time::Duration};

/// Retries of a key spread over `interval * (1 ± RANDOMIZATION_FACTOR)`.
const RANDOMIZATION_FACTOR: f64 = 0.5;

struct KeyBackoff {
    failures: u32,
    backoff: ExponentialBackoff,
}

/// Per-key exponential backoff for failed reconciles.
///
/// The n-th consecutive failure of a key is retried after roughly
/// `base * 2^(n-1)`, jittered and never longer than `max`. A successful
/// reconcile or the deletion of the Retainer resets the key.
pub(crate) struct ErrorBackoff {
    base: Duration,
    max: Duration,
    keys: Mutex<HashMap<String, KeyBackoff>>,
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            keys: Default::default(),
        }
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_randomization_factor(RANDOMIZATION_FACTOR)
            .with_multiplier(2.0)
            .with_max_interval(self.max)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Record a failure of `key`. Returns how many failures in a row it had
    /// and how long to wait before the next attempt.
    pub fn failure(&self, key: &str) -> (u32, Duration) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let state = keys.entry(key.to_string()).or_insert_with(|| KeyBackoff {
            failures: 0,
            backoff: self.schedule(),
        });
        state.failures = state.failures.saturating_add(1);
        let delay = state
            .backoff
            .next_backoff()
            .unwrap_or(self.max)
            .min(self.max);
        (state.failures, delay)
    }

    pub fn reset(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(key);
    }

    /// Forget Retainers as soon as the watch reports them deleted; the
    /// controller does not reconcile keys which left the cache.
    pub fn observe(&self, event: &Event<Retainer>) {
        if let Event::Delete(retainer) = event {
            self.reset(retainer.name_any().as_str());
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}
