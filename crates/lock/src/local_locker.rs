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
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{LockError, Result};
use crate::lock_args::LockArgs;
use crate::Locker;

const MAX_RESOURCES_PER_REQUEST: usize = 1000;

/// One holder's bookkeeping on a peer.
#[derive(Clone, Debug)]
pub struct LockRequesterInfo {
    pub name: String,
    pub writer: bool,
    pub uid: String,
    pub time_stamp: Instant,
    pub time_last_refresh: Instant,
    pub source: String,
    /// Part of a multi-resource grant.
    pub group: bool,
    pub owner: String,
    pub quorum: usize,
    pub idx: usize,
}

impl Default for LockRequesterInfo {
    fn default() -> Self {
        Self {
            name: Default::default(),
            writer: Default::default(),
            uid: Default::default(),
            time_stamp: Instant::now(),
            time_last_refresh: Instant::now(),
            source: Default::default(),
            group: Default::default(),
            owner: Default::default(),
            quorum: Default::default(),
            idx: Default::default(),
        }
    }
}

fn is_write_lock(lri: &[LockRequesterInfo]) -> bool {
    lri.len() == 1 && lri[0].writer
}

fn format_uuid(uid: &str, idx: usize) -> String {
    format!("{uid}#{idx}")
}

/// Point-in-time counters over a peer's lock table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub total: usize,
    pub writes: usize,
    pub reads: usize,
}

/// In-process lock server.
///
/// This is the peer every gateway node exposes to the cluster: the
/// authoritative grant table the distributed mutex quorum is counted
/// over. Write grants cover a whole resource group atomically; read
/// grants are per-resource and shared.
#[derive(Debug, Default)]
pub struct LocalLocker {
    lock_map: HashMap<String, Vec<LockRequesterInfo>>,
    /// uid#idx -> resource, for uid-keyed release and refresh.
    lock_uid: HashMap<String, String>,
}

impl LocalLocker {
    pub fn new() -> Self {
        LocalLocker::default()
    }

    fn can_take_lock(&self, resources: &[String]) -> bool {
        resources.iter().all(|resource| !self.lock_map.contains_key(resource))
    }

    /// Removes `args.uid`'s hold on `resource`, dropping the map entry
    /// when the last holder leaves.
    fn remove_entry(&mut self, resource: &str, args: &LockArgs) -> bool {
        let Some(lris) = self.lock_map.get_mut(resource) else {
            return false;
        };
        let Some(pos) = lris
            .iter()
            .position(|lri| lri.uid == args.uid && (args.owner.is_empty() || lri.owner == args.owner))
        else {
            return false;
        };

        let removed = lris.remove(pos);
        let empty = lris.is_empty();
        if empty {
            self.lock_map.remove(resource);
        }
        self.lock_uid.remove(&format_uuid(&removed.uid, removed.idx));
        true
    }

    pub fn stats(&self) -> LockStats {
        let mut stats = LockStats::default();
        for lris in self.lock_map.values() {
            stats.total += 1;
            if is_write_lock(lris) {
                stats.writes += 1;
            } else {
                stats.reads += lris.len();
            }
        }
        stats
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.lock_map.contains_key(resource)
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn lock(&mut self, args: &LockArgs) -> Result<bool> {
        if args.resources.len() > MAX_RESOURCES_PER_REQUEST {
            return Err(LockError::internal(format!(
                "LocalLocker.lock called with more than {MAX_RESOURCES_PER_REQUEST} resources"
            )));
        }

        // All-or-nothing over the whole group.
        if !self.can_take_lock(&args.resources) {
            return Ok(false);
        }

        for (idx, resource) in args.resources.iter().enumerate() {
            self.lock_map.insert(
                resource.clone(),
                vec![LockRequesterInfo {
                    name: resource.clone(),
                    writer: true,
                    uid: args.uid.clone(),
                    source: args.source.clone(),
                    group: args.resources.len() > 1,
                    owner: args.owner.clone(),
                    quorum: args.quorum,
                    idx,
                    ..Default::default()
                }],
            );
            self.lock_uid.insert(format_uuid(&args.uid, idx), resource.clone());
        }

        Ok(true)
    }

    async fn unlock(&mut self, args: &LockArgs) -> Result<bool> {
        if args.resources.len() > MAX_RESOURCES_PER_REQUEST {
            return Err(LockError::internal(format!(
                "LocalLocker.unlock called with more than {MAX_RESOURCES_PER_REQUEST} resources"
            )));
        }

        let mut reply = false;
        let mut read_locked = Vec::new();
        for resource in args.resources.iter() {
            match self.lock_map.get(resource) {
                Some(lris) if !is_write_lock(lris) => read_locked.push(resource.clone()),
                Some(_) => reply = self.remove_entry(resource, args) || reply,
                None => {}
            }
        }

        if !read_locked.is_empty() {
            return Err(LockError::internal(format!(
                "unlock attempted on read locked entities: {}",
                read_locked.join(", ")
            )));
        }
        Ok(reply)
    }

    async fn rlock(&mut self, args: &LockArgs) -> Result<bool> {
        if args.resources.len() != 1 {
            return Err(LockError::internal("LocalLocker.rlock called with more than one resource"));
        }

        let resource = &args.resources[0];
        if let Some(lris) = self.lock_map.get_mut(resource) {
            if is_write_lock(lris) {
                return Ok(false);
            }
            lris.push(LockRequesterInfo {
                name: resource.clone(),
                writer: false,
                uid: args.uid.clone(),
                source: args.source.clone(),
                owner: args.owner.clone(),
                quorum: args.quorum,
                ..Default::default()
            });
        } else {
            self.lock_map.insert(
                resource.clone(),
                vec![LockRequesterInfo {
                    name: resource.clone(),
                    writer: false,
                    uid: args.uid.clone(),
                    source: args.source.clone(),
                    owner: args.owner.clone(),
                    quorum: args.quorum,
                    ..Default::default()
                }],
            );
        }
        self.lock_uid.insert(format_uuid(&args.uid, 0), resource.clone());
        Ok(true)
    }

    async fn runlock(&mut self, args: &LockArgs) -> Result<bool> {
        if args.resources.len() != 1 {
            return Err(LockError::internal("LocalLocker.runlock called with more than one resource"));
        }

        let resource = &args.resources[0];
        match self.lock_map.get(resource) {
            Some(lris) if is_write_lock(lris) => Err(LockError::internal(format!(
                "runlock attempted on a write locked entity: {resource}"
            ))),
            Some(_) => Ok(self.remove_entry(resource, args)),
            None => Ok(false),
        }
    }

    async fn refresh(&mut self, args: &LockArgs) -> Result<bool> {
        let mut refreshed = false;
        for lris in self.lock_map.values_mut() {
            for lri in lris.iter_mut().filter(|lri| lri.uid == args.uid) {
                lri.time_last_refresh = Instant::now();
                refreshed = true;
            }
        }
        Ok(refreshed)
    }

    async fn force_unlock(&mut self, args: &LockArgs) -> Result<bool> {
        if args.resources.len() > MAX_RESOURCES_PER_REQUEST {
            return Err(LockError::internal(format!(
                "LocalLocker.force_unlock called with more than {MAX_RESOURCES_PER_REQUEST} resources"
            )));
        }

        let mut reply = false;
        if args.resources.is_empty() {
            // No resources named: purge every hold belonging to the uid.
            let mut emptied = Vec::new();
            for (resource, lris) in self.lock_map.iter_mut() {
                let before = lris.len();
                lris.retain(|lri| lri.uid != args.uid);
                reply = reply || lris.len() != before;
                if lris.is_empty() {
                    emptied.push(resource.clone());
                }
            }
            for resource in emptied {
                self.lock_map.remove(&resource);
            }
            self.lock_uid
                .retain(|key, _| key.split('#').next() != Some(args.uid.as_str()));
        } else {
            for resource in args.resources.iter() {
                if let Some(lris) = self.lock_map.remove(resource) {
                    for lri in &lris {
                        self.lock_uid.remove(&format_uuid(&lri.uid, lri.idx));
                    }
                    reply = true;
                }
            }
        }
        Ok(reply)
    }

    async fn close(&self) {}

    async fn is_online(&self) -> bool {
        true
    }

    async fn is_local(&self) -> bool {
        true
    }
}
