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

use std::collections::HashMap;
use std::panic::Location;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::drwmutex::{DRWMutex, Options};
use crate::dynamic_timeout::DynamicTimeout;
use crate::error::{LockError, Result};
use crate::lrwmutex::LRWMutex;
use crate::utils::path_join;
use crate::LockersFactory;

pub type RWLockerImpl = Box<dyn RWLocker + Send + Sync>;

/// Locker interface handed to request handlers: timed shared and
/// exclusive acquisition over one lock instance's resource set.
///
/// An instance is created per operation, consumed by one acquire plus
/// one release pair, then discarded. Success hands back the
/// cancel-scoped token the critical section should observe; the only
/// failure is [`LockError::OperationTimedOut`].
#[async_trait]
pub trait RWLocker {
    async fn get_lock(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout) -> Result<CancellationToken>;
    async fn un_lock(&mut self);
    async fn get_r_lock(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout) -> Result<CancellationToken>;
    async fn un_r_lock(&mut self);
}

#[derive(Debug)]
struct NsLock {
    /// Outstanding acquire attempts, waiting or granted.
    reference: usize,
    lock: Arc<LRWMutex>,
}

/// Registry mapping resource names to reference-counted local mutexes.
///
/// An entry exists iff its reference count is positive: insertion with
/// the first acquirer and removal with the last release (or last failed
/// acquire) happen under the registry mutex, so no acquirer ever
/// observes an entry at zero. The registry mutex guards map and count
/// transitions only; it is never held across a blocking acquire.
#[derive(Debug)]
pub struct NsLockMap {
    is_dist_erasure: bool,
    retry_interval: Duration,
    lock_map: Mutex<HashMap<String, NsLock>>,
}

impl NsLockMap {
    pub fn new(is_dist_erasure: bool) -> Self {
        Self {
            is_dist_erasure,
            retry_interval: LockConfig::default().retry_interval,
            lock_map: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            is_dist_erasure: config.distributed,
            retry_interval: config.retry_interval,
            lock_map: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn lock(
        &self,
        cancel: &CancellationToken,
        volume: &str,
        path: &str,
        lock_source: &str,
        ops_id: &str,
        read_lock: bool,
        timeout: Duration,
    ) -> bool {
        let resource = path_join(volume, path);

        // Insert-or-bump and the handle clone form one critical
        // section, so a parallel release cannot reclaim the entry
        // between our increment and the acquire below.
        let nslk = {
            let mut lock_map = self.lock_map.lock().unwrap();
            let entry = lock_map.entry(resource.clone()).or_insert_with(|| NsLock {
                reference: 0,
                lock: Arc::new(LRWMutex::new()),
            });
            entry.reference += 1;
            Arc::clone(&entry.lock)
        };

        // Blocks until granted, timed out, or canceled; the registry
        // mutex is not held here.
        let locked = if read_lock {
            nslk.get_r_lock(cancel, ops_id, lock_source, timeout).await
        } else {
            nslk.get_lock(cancel, ops_id, lock_source, timeout).await
        };

        if !locked {
            let mut lock_map = self.lock_map.lock().unwrap();
            match lock_map.get_mut(&resource) {
                Some(entry) => {
                    if entry.reference == 0 {
                        error!("resource reference count underflow for {resource}");
                        panic!("resource reference count underflow for {resource}");
                    }
                    entry.reference -= 1;
                    if entry.reference == 0 {
                        lock_map.remove(&resource);
                    }
                }
                None => {
                    // Our own increment was still outstanding.
                    error!("lock registry entry vanished while referenced: {resource}");
                    panic!("lock registry entry vanished while referenced: {resource}");
                }
            }
        }

        locked
    }

    fn unlock(&self, volume: &str, path: &str, read_lock: bool) {
        let resource = path_join(volume, path);
        let mut lock_map = self.lock_map.lock().unwrap();
        let Some(entry) = lock_map.get_mut(&resource) else {
            warn!("unlock of unknown resource {resource}");
            return;
        };

        if read_lock {
            entry.lock.un_r_lock();
        } else {
            entry.lock.un_lock();
        }

        if entry.reference == 0 {
            error!("resource reference count underflow for {resource}");
            panic!("resource reference count underflow for {resource}");
        }
        entry.reference -= 1;
        if entry.reference == 0 {
            lock_map.remove(&resource);
        }
    }

    /// Returns a lock instance for a volume and one or more paths.
    ///
    /// Distributed deployments get a quorum-backed instance over the
    /// peer set; otherwise the instance carries references into this
    /// registry. Paths are sorted so every holder contends in the same
    /// order, which keeps the waits-for graph acyclic across
    /// multi-resource acquirers.
    #[track_caller]
    pub fn new_nslock(self: &Arc<Self>, lockers: Option<LockersFactory>, volume: &str, paths: Vec<String>) -> RWLockerImpl {
        let ops_id = Uuid::new_v4().to_string();
        let caller = Location::caller();
        let lock_source = format!("[{}:{}]", caller.file(), caller.line());

        if self.is_dist_erasure {
            let lockers = lockers.expect("distributed mode requires a lock peer factory");
            let names = paths.iter().map(|path| path_join(volume, path)).collect();
            return Box::new(DistLockInstance::new(lockers, names, ops_id, lock_source, self.retry_interval));
        }

        let mut paths = paths;
        paths.sort();
        Box::new(LocalLockInstance {
            ns: Arc::clone(self),
            volume: volume.to_string(),
            paths,
            ops_id,
            lock_source,
        })
    }
}

/// Lock instance backed by the peer quorum.
struct DistLockInstance {
    lock: DRWMutex,
    ops_id: String,
    lock_source: String,
    retry_interval: Duration,
}

impl DistLockInstance {
    fn new(lockers: LockersFactory, names: Vec<String>, ops_id: String, lock_source: String, retry_interval: Duration) -> Self {
        Self {
            lock: DRWMutex::new(lockers, names),
            ops_id,
            lock_source,
            retry_interval,
        }
    }

    async fn acquire(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout, read_lock: bool) -> Result<CancellationToken> {
        let start = Instant::now();
        let child = cancel.child_token();
        let opts = Options {
            timeout: timeout.timeout(),
            retry_interval: self.retry_interval,
        };

        let locked = if read_lock {
            self.lock.get_r_lock(&child, &self.ops_id, &self.lock_source, &opts).await
        } else {
            self.lock.get_lock(&child, &self.ops_id, &self.lock_source, &opts).await
        };

        if !locked {
            timeout.log_failure();
            return Err(LockError::OperationTimedOut);
        }
        timeout.log_success(start.elapsed());
        Ok(child)
    }
}

#[async_trait]
impl RWLocker for DistLockInstance {
    async fn get_lock(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout) -> Result<CancellationToken> {
        self.acquire(cancel, timeout, false).await
    }

    async fn un_lock(&mut self) {
        self.lock.un_lock().await;
    }

    async fn get_r_lock(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout) -> Result<CancellationToken> {
        self.acquire(cancel, timeout, true).await
    }

    async fn un_r_lock(&mut self) {
        self.lock.un_r_lock().await;
    }
}

/// Lock instance backed by the in-process registry.
struct LocalLockInstance {
    ns: Arc<NsLockMap>,
    volume: String,
    /// Sorted at construction.
    paths: Vec<String>,
    ops_id: String,
    lock_source: String,
}

impl LocalLockInstance {
    async fn acquire(&self, cancel: &CancellationToken, timeout: &DynamicTimeout, read_lock: bool) -> Result<CancellationToken> {
        let start = Instant::now();
        let deadline = timeout.timeout();
        let child = cancel.child_token();

        for (idx, path) in self.paths.iter().enumerate() {
            let locked = self
                .ns
                .lock(&child, &self.volume, path, &self.lock_source, &self.ops_id, read_lock, deadline)
                .await;
            if !locked {
                timeout.log_failure();
                // Back out the prefix so no partial hold survives.
                for acquired in &self.paths[..idx] {
                    self.ns.unlock(&self.volume, acquired, read_lock);
                }
                return Err(LockError::OperationTimedOut);
            }
        }

        timeout.log_success(start.elapsed());
        Ok(child)
    }

    fn release(&self, read_lock: bool) {
        for path in self.paths.iter() {
            self.ns.unlock(&self.volume, path, read_lock);
        }
    }
}

#[async_trait]
impl RWLocker for LocalLockInstance {
    async fn get_lock(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout) -> Result<CancellationToken> {
        self.acquire(cancel, timeout, false).await
    }

    async fn un_lock(&mut self) {
        self.release(false);
    }

    async fn get_r_lock(&mut self, cancel: &CancellationToken, timeout: &DynamicTimeout) -> Result<CancellationToken> {
        self.acquire(cancel, timeout, true).await
    }

    async fn un_r_lock(&mut self) {
        self.release(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::RwLock;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::local_locker::LocalLocker;
    use crate::LockClient;

    fn new_map() -> Arc<NsLockMap> {
        Arc::new(NsLockMap::new(false))
    }

    fn generous_timeout() -> DynamicTimeout {
        DynamicTimeout::new(Duration::from_secs(5), Duration::from_millis(10))
    }

    fn short_timeout(ms: u64) -> DynamicTimeout {
        DynamicTimeout::new(Duration::from_millis(ms), Duration::from_millis(1))
    }

    fn reference_count(ns: &NsLockMap, resource: &str) -> Option<usize> {
        ns.lock_map.lock().unwrap().get(resource).map(|entry| entry.reference)
    }

    fn map_len(ns: &NsLockMap) -> usize {
        ns.lock_map.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_lock_unlock_round_trip() {
        let ns = new_map();
        let cancel = CancellationToken::new();
        let timeout = generous_timeout();

        let mut handle = ns.new_nslock(None, "test", vec!["foo".to_string()]);
        handle.get_lock(&cancel, &timeout).await.unwrap();
        assert_eq!(reference_count(&ns, "test/foo"), Some(1));

        handle.un_lock().await;
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_writer_excludes_writer() {
        let ns = new_map();
        let cancel = CancellationToken::new();
        let timeout = generous_timeout();

        let mut first = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        first.get_lock(&cancel, &timeout).await.unwrap();

        let mut second = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        let denied = second.get_lock(&cancel, &short_timeout(100)).await;
        assert!(matches!(denied, Err(LockError::OperationTimedOut)));

        // Only the holder's reference remains after the failed acquire.
        assert_eq!(reference_count(&ns, "bucket/obj1"), Some(1));

        first.un_lock().await;
        assert_eq!(map_len(&ns), 0);

        let mut third = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        third.get_lock(&cancel, &timeout).await.unwrap();
        third.un_lock().await;
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_reader_parallelism() {
        let ns = new_map();
        let cancel = CancellationToken::new();
        let timeout = generous_timeout();

        let mut readers = Vec::new();
        for _ in 0..10 {
            let mut handle = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
            handle.get_r_lock(&cancel, &timeout).await.unwrap();
            readers.push(handle);
        }
        assert_eq!(reference_count(&ns, "bucket/obj1"), Some(10));

        let writer = {
            let ns = Arc::clone(&ns);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut handle = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
                handle
                    .get_lock(&cancel, &DynamicTimeout::new(Duration::from_secs(10), Duration::from_millis(10)))
                    .await
                    .unwrap();
                handle.un_lock().await;
            })
        };

        // Wait until the writer's pending acquire shows up in the count.
        let mut waited = Duration::ZERO;
        while reference_count(&ns, "bucket/obj1") != Some(11) {
            assert!(waited < Duration::from_secs(5), "writer never queued");
            sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        for mut handle in readers {
            handle.un_r_lock().await;
        }

        writer.await.unwrap();
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_multi_resource_unwind() {
        let ns = new_map();
        let cancel = CancellationToken::new();
        let timeout = generous_timeout();

        let mut holder = ns.new_nslock(None, "b", vec!["a".to_string()]);
        holder.get_lock(&cancel, &timeout).await.unwrap();

        let mut acquirer = ns.new_nslock(None, "b", vec!["a".to_string(), "z".to_string()]);
        let denied = acquirer.get_lock(&cancel, &short_timeout(20)).await;
        assert!(matches!(denied, Err(LockError::OperationTimedOut)));

        // The first path timed out, so the second was never touched.
        assert_eq!(reference_count(&ns, "b/z"), None);
        assert_eq!(reference_count(&ns, "b/a"), Some(1));

        holder.un_lock().await;
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_unwind_releases_acquired_prefix() {
        let ns = new_map();
        let cancel = CancellationToken::new();
        let timeout = generous_timeout();

        // Block only the lexicographically later path.
        let mut holder = ns.new_nslock(None, "b", vec!["z".to_string()]);
        holder.get_lock(&cancel, &timeout).await.unwrap();

        let mut acquirer = ns.new_nslock(None, "b", vec!["z".to_string(), "a".to_string()]);
        let denied = acquirer.get_lock(&cancel, &short_timeout(50)).await;
        assert!(matches!(denied, Err(LockError::OperationTimedOut)));

        // "b/a" was granted first, then released during unwind.
        assert_eq!(reference_count(&ns, "b/a"), None);
        assert_eq!(reference_count(&ns, "b/z"), Some(1));

        holder.un_lock().await;
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_uniform_order_makes_progress() {
        let ns = new_map();
        let cancel = CancellationToken::new();

        let contender = |ns: Arc<NsLockMap>, cancel: CancellationToken| async move {
            let mut handle = ns.new_nslock(None, "b", vec!["x".to_string(), "y".to_string()]);
            handle
                .get_lock(&cancel, &DynamicTimeout::new(Duration::from_secs(10), Duration::from_millis(10)))
                .await
                .unwrap();
            sleep(Duration::from_millis(20)).await;
            handle.un_lock().await;
        };

        let first = tokio::spawn(contender(Arc::clone(&ns), cancel.clone()));
        let second = tokio::spawn(contender(Arc::clone(&ns), cancel.clone()));
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_cancellation_unwinds_like_timeout() {
        let ns = new_map();
        let cancel = CancellationToken::new();
        let timeout = generous_timeout();

        let mut holder = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        holder.get_lock(&cancel, &timeout).await.unwrap();

        let caller = CancellationToken::new();
        let pending = {
            let ns = Arc::clone(&ns);
            let caller = caller.clone();
            tokio::spawn(async move {
                let mut handle = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
                handle
                    .get_lock(&caller, &DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1)))
                    .await
            })
        };

        sleep(Duration::from_millis(50)).await;
        caller.cancel();

        let denied = pending.await.unwrap();
        assert!(matches!(denied, Err(LockError::OperationTimedOut)));
        assert_eq!(reference_count(&ns, "bucket/obj1"), Some(1));

        holder.un_lock().await;
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_unlock_of_unknown_resource_is_lenient() {
        let ns = new_map();
        ns.unlock("bucket", "ghost", false);
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_timeout_feedback_reaches_controller() {
        let ns = new_map();
        let cancel = CancellationToken::new();

        let mut holder = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        holder.get_lock(&cancel, &generous_timeout()).await.unwrap();

        // Close a window whose last failure arrives through the real
        // acquire path; the controller must double.
        let timeout = DynamicTimeout::new(Duration::from_millis(20), Duration::from_millis(1));
        for _ in 0..crate::dynamic_timeout::DYNAMIC_TIMEOUT_LOG_SIZE - 1 {
            timeout.log_failure();
        }
        let mut contender = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        assert!(contender.get_lock(&cancel, &timeout).await.is_err());
        assert_eq!(timeout.timeout(), Duration::from_millis(40));

        holder.un_lock().await;
    }

    #[tokio::test]
    async fn test_from_config_local_mode() {
        let ns = Arc::new(NsLockMap::from_config(&crate::config::LockConfig::default()));
        let cancel = CancellationToken::new();

        let mut handle = ns.new_nslock(None, "bucket", vec!["obj1".to_string()]);
        handle.get_lock(&cancel, &generous_timeout()).await.unwrap();
        assert_eq!(reference_count(&ns, "bucket/obj1"), Some(1));
        handle.un_lock().await;
        assert_eq!(map_len(&ns), 0);
    }

    #[tokio::test]
    async fn test_distributed_instance_smoke() {
        let ns = Arc::new(NsLockMap::new(true));
        let cancel = CancellationToken::new();

        let peers: Vec<LockClient> = (0..3)
            .map(|_| Arc::new(RwLock::new(LocalLocker::new())) as LockClient)
            .collect();
        let factory: LockersFactory = Arc::new(move || (peers.clone(), "node1".to_string()));

        let mut handle = ns.new_nslock(Some(factory.clone()), "bucket", vec!["obj1".to_string()]);
        handle.get_lock(&cancel, &generous_timeout()).await.unwrap();

        let mut contender = ns.new_nslock(Some(factory.clone()), "bucket", vec!["obj1".to_string()]);
        let denied = contender.get_lock(&cancel, &short_timeout(100)).await;
        assert!(matches!(denied, Err(LockError::OperationTimedOut)));

        handle.un_lock().await;

        let mut reader1 = ns.new_nslock(Some(factory.clone()), "bucket", vec!["obj1".to_string()]);
        let mut reader2 = ns.new_nslock(Some(factory), "bucket", vec!["obj1".to_string()]);
        reader1.get_r_lock(&cancel, &generous_timeout()).await.unwrap();
        reader2.get_r_lock(&cancel, &generous_timeout()).await.unwrap();
        reader1.un_r_lock().await;
        reader2.un_r_lock().await;

        // The local registry stays untouched in distributed mode.
        assert_eq!(map_len(&ns), 0);
    }
}
