// Copyright 2025 SlateFS Team
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

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A reader-writer mutex with per-acquire timeout and cancellation.
///
/// One instance guards one namespace resource; its lifetime equals the
/// lifetime of its registry entry. Acquisition polls with a jittered
/// backoff, so a pending writer is granted as soon as a probe finds the
/// readers drained. The operation ID and source of the latest grant are
/// retained for introspection only; they never affect scheduling.
#[derive(Debug, Default)]
pub struct LRWMutex {
    state: Mutex<LRWState>,
}

#[derive(Debug, Default)]
struct LRWState {
    id: String,
    source: String,
    is_write: bool,
    reference: usize,
}

impl LRWMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the calling task until the write lock is granted.
    pub async fn lock(&self, id: &str, source: &str) {
        let never = CancellationToken::new();
        // Effectively infinite patience.
        self.lock_loop(&never, id, source, Duration::from_secs(10_000), true).await;
    }

    /// Tries to take the write lock within `timeout`. Returns false on
    /// timeout or when `cancel` fires.
    pub async fn get_lock(&self, cancel: &CancellationToken, id: &str, source: &str, timeout: Duration) -> bool {
        self.lock_loop(cancel, id, source, timeout, true).await
    }

    /// Holds the calling task until a read lock is granted.
    pub async fn r_lock(&self, id: &str, source: &str) {
        let never = CancellationToken::new();
        self.lock_loop(&never, id, source, Duration::from_secs(10_000), false).await;
    }

    /// Tries to take a read lock within `timeout`. Returns false on
    /// timeout or when `cancel` fires.
    pub async fn get_r_lock(&self, cancel: &CancellationToken, id: &str, source: &str, timeout: Duration) -> bool {
        self.lock_loop(cancel, id, source, timeout, false).await
    }

    fn try_acquire(&self, id: &str, source: &str, is_write: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let granted = if is_write {
            if state.reference == 0 && !state.is_write {
                state.reference = 1;
                state.is_write = true;
                true
            } else {
                false
            }
        } else if !state.is_write {
            state.reference += 1;
            true
        } else {
            false
        };

        if granted {
            state.id = id.to_string();
            state.source = source.to_string();
        }
        granted
    }

    async fn lock_loop(&self, cancel: &CancellationToken, id: &str, source: &str, timeout: Duration, is_write: bool) -> bool {
        let start = Instant::now();
        loop {
            if self.try_acquire(id, source, is_write) {
                return true;
            }
            if cancel.is_cancelled() || start.elapsed() > timeout {
                return false;
            }
            let backoff = {
                let mut rng = rand::rng();
                rng.random_range(10..=50)
            };
            tokio::select! {
                _ = sleep(Duration::from_millis(backoff)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Releases the write lock. A release with no matching hold is
    /// logged and otherwise ignored.
    pub fn un_lock(&self) {
        if !self.release(true) {
            warn!("un_lock() called while no write lock is active");
        }
    }

    /// Releases one read lock. A release with no matching hold is
    /// logged and otherwise ignored.
    pub fn un_r_lock(&self) {
        if !self.release(false) {
            warn!("un_r_lock() called while no read lock is active");
        }
    }

    fn release(&self, is_write: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if is_write {
            if state.is_write && state.reference == 1 {
                state.reference = 0;
                state.is_write = false;
                true
            } else {
                false
            }
        } else if !state.is_write && state.reference > 0 {
            state.reference -= 1;
            true
        } else {
            false
        }
    }

    /// Drops all holds unconditionally. Administrative use only.
    pub fn force_un_lock(&self) {
        let mut state = self.state.lock().unwrap();
        state.reference = 0;
        state.is_write = false;
    }

    /// Operation ID and source of the most recent grant.
    pub fn last_granted(&self) -> (String, String) {
        let state = self.state.lock().unwrap();
        (state.id.clone(), state.source.clone())
    }
}
