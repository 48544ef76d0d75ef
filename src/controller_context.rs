// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Controller context - state shared by every reconcile call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;
use crate::reconciler::Reconciler;
use crate::store::{ObjectKey, Store};

/// Shared context for the Dummy controller.
///
/// Handed to every reconcile and error-policy invocation by the runtime.
#[derive(Clone)]
pub struct ControllerContext {
    /// Reconciler driving the Dummy/pod pair.
    pub reconciler: Reconciler,

    /// Per-object retry backoff.
    pub backoff: Arc<Backoff>,
}

impl ControllerContext {
    /// Creates a new controller context.
    pub fn new(reconciler: Reconciler, backoff: Backoff) -> Self {
        Self {
            reconciler,
            backoff: Arc::new(backoff),
        }
    }

    /// Creates a context with a default reconciler over `store`.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self::new(Reconciler::new(store), Backoff::default())
    }
}

/// Exponential backoff tracked per object.
///
/// Each consecutive failure of the same object doubles the delay, capped at
/// `max_delay`, plus up to 10% jitter so failing objects do not retry in
/// lockstep. A successful pass resets the object.
#[derive(Debug)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl Backoff {
    /// Creates a backoff with the given bounds.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a backoff from configuration.
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }

    /// Records a failure of `key` and returns the delay before the retry.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let failures = {
            let mut map = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = map.entry(key.clone()).or_insert(0);
            let failures = *count;
            *count = count.saturating_add(1);
            failures
        };

        let delay = self.delay_for(failures);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        delay
            .saturating_add(delay.mul_f64(jitter))
            .min(self.max_delay)
    }

    /// Forgets the failures of `key`.
    pub fn reset(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Delay without jitter after `failures` earlier failures.
    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
