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

//! Namespace locking for the SlateFS object gateway.
//!
//! Every S3-style operation serializes on the logical resources it
//! touches through a [`namespace_lock::RWLocker`] instance obtained
//! from [`namespace_lock::NsLockMap`]. Single-node deployments resolve
//! contention through an in-process reference-counted registry of
//! [`lrwmutex::LRWMutex`]es; distributed deployments hold locks across
//! a quorum of peers through [`drwmutex::DRWMutex`]. Acquire timeouts
//! are tuned online by [`dynamic_timeout::DynamicTimeout`] from
//! observed grant latencies and failures.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::local_locker::LocalLocker;
use crate::lock_args::LockArgs;

pub mod config;
pub mod drwmutex;
pub mod dynamic_timeout;
pub mod error;
pub mod local_locker;
pub mod lock_args;
pub mod lrwmutex;
pub mod namespace_lock;
pub mod utils;

/// The lock server this process exposes to its peers.
pub static GLOBAL_LOCAL_SERVER: LazyLock<Arc<RwLock<LocalLocker>>> =
    LazyLock::new(|| Arc::new(RwLock::new(LocalLocker::new())));

/// Grant/release contract every lock peer implements.
///
/// The network transport behind remote peers lives outside this crate;
/// its client adapter implements this trait and joins the peer set the
/// same way the in-process [`LocalLocker`] does.
#[async_trait]
pub trait Locker {
    async fn lock(&mut self, args: &LockArgs) -> Result<bool>;
    async fn unlock(&mut self, args: &LockArgs) -> Result<bool>;
    async fn rlock(&mut self, args: &LockArgs) -> Result<bool>;
    async fn runlock(&mut self, args: &LockArgs) -> Result<bool>;
    async fn refresh(&mut self, args: &LockArgs) -> Result<bool>;
    async fn force_unlock(&mut self, args: &LockArgs) -> Result<bool>;
    async fn close(&self);
    async fn is_online(&self) -> bool;
    async fn is_local(&self) -> bool;
}

/// Shared handle to one lock peer.
pub type LockClient = Arc<RwLock<dyn Locker + Send + Sync>>;

/// Resolves the current peer set and this node's identity. Re-resolved
/// on every acquisition so topology changes take effect immediately.
pub type LockersFactory = Arc<dyn Fn() -> (Vec<LockClient>, String) + Send + Sync>;

/// A peer handle backed by this process's own lock server.
pub fn new_local_client() -> LockClient {
    Arc::new(RwLock::new(LocalLocker::new()))
}
