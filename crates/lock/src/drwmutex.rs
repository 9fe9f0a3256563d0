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

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lock_args::LockArgs;
use crate::{LockClient, LockersFactory};

const LOCK_RETRY_MIN_INTERVAL: Duration = Duration::from_millis(250);
const RELEASE_RETRY_BOUND: Duration = Duration::from_secs(30);

/// A reader-writer mutex held across a quorum of lock peers.
///
/// The lock is held iff a strict majority of the current peer set
/// granted it; write locks demand one extra grant when the peer count
/// is even, so two halves of a partitioned cluster cannot both hold
/// the lock. Peers that granted a below-quorum round are released
/// before the next attempt.
pub struct DRWMutex {
    names: Vec<String>,
    /// Per-peer grant UIDs; an empty slot means that peer holds nothing.
    write_locks: Vec<String>,
    read_locks: Vec<String>,
    lockers: LockersFactory,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

fn is_locked(uid: &str) -> bool {
    !uid.is_empty()
}

impl DRWMutex {
    /// Binds a mutex to a set of resource names and a peer-set factory.
    /// Names are sorted so all holders contend in the same order.
    pub fn new(lockers: LockersFactory, names: Vec<String>) -> Self {
        let mut names = names;
        names.sort();
        Self {
            names,
            write_locks: Vec::new(),
            read_locks: Vec::new(),
            lockers,
        }
    }

    fn is_locked(&self) -> bool {
        self.write_locks.iter().any(|uid| is_locked(uid))
    }

    fn is_r_locked(&self) -> bool {
        self.read_locks.iter().any(|uid| is_locked(uid))
    }

    /// Tries to take the write lock within `opts.timeout`.
    pub async fn get_lock(&mut self, cancel: &CancellationToken, id: &str, source: &str, opts: &Options) -> bool {
        self.lock_blocking(cancel, id, source, false, opts).await
    }

    /// Tries to take a read lock within `opts.timeout`.
    pub async fn get_r_lock(&mut self, cancel: &CancellationToken, id: &str, source: &str, opts: &Options) -> bool {
        self.lock_blocking(cancel, id, source, true, opts).await
    }

    async fn lock_blocking(
        &mut self,
        cancel: &CancellationToken,
        id: &str,
        source: &str,
        is_read_lock: bool,
        opts: &Options,
    ) -> bool {
        let (lockers, owner) = (self.lockers)();
        let locker_len = lockers.len();
        if locker_len == 0 {
            warn!("no lock peers available for {:?}", self.names);
            return false;
        }

        let mut tolerance = locker_len / 2;
        let mut quorum = locker_len - tolerance;
        if !is_read_lock && quorum == tolerance {
            // Write locks take quorum + 1 when tolerance is exactly
            // half, so a split cluster cannot grant both halves.
            quorum += 1;
        }
        tolerance = locker_len - quorum;

        info!(
            "lock_blocking {}/{} for {:?}: read({}), quorum: {}, tolerance: {}, peers: {}",
            id, source, self.names, is_read_lock, quorum, tolerance, locker_len
        );

        let start = Instant::now();
        let mut locks = vec![String::new(); locker_len];
        loop {
            if self
                .inner_lock(&lockers, &owner, &mut locks, id, source, is_read_lock, tolerance, quorum)
                .await
            {
                if is_read_lock {
                    self.read_locks = locks;
                } else {
                    self.write_locks = locks;
                }
                info!("lock_blocking {}/{} for {:?}: granted", id, source, self.names);
                return true;
            }

            if cancel.is_cancelled() || start.elapsed() > opts.timeout {
                return false;
            }
            // Jittered so contenders on the same names do not retry in
            // lock-step.
            let backoff = {
                let mut rng = rand::rng();
                let base = opts.retry_interval.as_millis() as u64;
                rng.random_range(base / 2..=base.max(1))
            };
            tokio::select! {
                _ = sleep(Duration::from_millis(backoff)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// One grant round: ask every peer, count grants, unwind when the
    /// round stays below quorum.
    #[allow(clippy::too_many_arguments)]
    async fn inner_lock(
        &self,
        lockers: &[LockClient],
        owner: &str,
        locks: &mut [String],
        id: &str,
        source: &str,
        is_read_lock: bool,
        tolerance: usize,
        quorum: usize,
    ) -> bool {
        for lock in locks.iter_mut() {
            lock.clear();
        }

        let args = LockArgs {
            uid: id.to_string(),
            resources: self.names.clone(),
            owner: owner.to_string(),
            source: source.to_string(),
            quorum,
        };

        for (index, locker) in lockers.iter().enumerate() {
            let granted = if is_read_lock {
                locker.write().await.rlock(&args).await
            } else {
                locker.write().await.lock(&args).await
            };
            match granted {
                Ok(true) => locks[index] = id.to_string(),
                Ok(false) => {}
                Err(err) => {
                    warn!("grant call failed with {} for {} at peer {}", err, args, index);
                }
            }
        }

        let quorum_locked = check_quorum_locked(locks, quorum);
        if !quorum_locked {
            info!("unable to acquire lock in quorum, {}", args);
            if !release_all(lockers, owner, &self.names, tolerance, locks, is_read_lock).await {
                info!("unable to release acquired locks, these will expire on the peers, {}", args);
            }
        }

        quorum_locked
    }

    /// Releases the write lock on every peer that granted it. Panics if
    /// no write lock is active.
    pub async fn un_lock(&mut self) {
        if self.write_locks.is_empty() || !self.is_locked() {
            panic!("un_lock() called while no lock() is active, write_locks: {:?}", self.write_locks);
        }
        let mut locks = std::mem::take(&mut self.write_locks);
        self.release_with_retry(&mut locks, false).await;
    }

    /// Releases the read lock on every peer that granted it. Panics if
    /// no read lock is active.
    pub async fn un_r_lock(&mut self) {
        if self.read_locks.is_empty() || !self.is_r_locked() {
            panic!("un_r_lock() called while no r_lock() is active, read_locks: {:?}", self.read_locks);
        }
        let mut locks = std::mem::take(&mut self.read_locks);
        self.release_with_retry(&mut locks, true).await;
    }

    async fn release_with_retry(&mut self, locks: &mut [String], is_read_lock: bool) {
        let (lockers, owner) = (self.lockers)();
        let tolerance = lockers.len() / 2;
        let start = Instant::now();
        loop {
            if release_all(&lockers, &owner, &self.names, tolerance, locks, is_read_lock).await {
                return;
            }
            sleep(LOCK_RETRY_MIN_INTERVAL).await;
            if start.elapsed() > RELEASE_RETRY_BOUND {
                // Remaining grants expire through the peers' lease
                // machinery.
                warn!("giving up releasing {:?} after {:?}", self.names, RELEASE_RETRY_BOUND);
                return;
            }
        }
    }
}

async fn release_all(
    lockers: &[LockClient],
    owner: &str,
    names: &[String],
    tolerance: usize,
    locks: &mut [String],
    is_read_lock: bool,
) -> bool {
    for (index, locker) in lockers.iter().enumerate() {
        if index >= locks.len() {
            break;
        }
        if send_release(locker, &locks[index], owner, names, is_read_lock).await {
            locks[index].clear();
        }
    }

    !check_failed_unlocks(locks, tolerance)
}

async fn send_release(locker: &LockClient, uid: &str, owner: &str, names: &[String], is_read_lock: bool) -> bool {
    if uid.is_empty() {
        return false;
    }

    let args = LockArgs {
        uid: uid.to_string(),
        owner: owner.to_string(),
        resources: names.to_vec(),
        ..Default::default()
    };

    let released = if is_read_lock {
        locker.write().await.runlock(&args).await
    } else {
        locker.write().await.unlock(&args).await
    };

    match released {
        Ok(true) => true,
        Ok(false) => {
            warn!("peer refused to release lock, args: {}", args);
            false
        }
        Err(err) => {
            warn!("release call failed with {} for {}", err, args);
            false
        }
    }
}

fn check_quorum_locked(locks: &[String], quorum: usize) -> bool {
    locks.iter().filter(|uid| is_locked(uid)).count() >= quorum
}

fn check_failed_unlocks(locks: &[String], tolerance: usize) -> bool {
    let failed = locks.iter().filter(|uid| is_locked(uid)).count();
    if locks.len() == 2 * tolerance {
        return failed >= tolerance;
    }
    failed > tolerance
}
