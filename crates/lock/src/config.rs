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

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dynamic_timeout::DynamicTimeout;

/// Lock subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Whether this namespace is part of a distributed deployment.
    pub distributed: bool,
    /// Seed value for dynamic acquire timeouts.
    pub acquire_timeout: Duration,
    /// Floor below which a dynamic timeout never drops.
    pub minimum_timeout: Duration,
    /// Base interval between quorum retry rounds.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            distributed: false,
            acquire_timeout: Duration::from_secs(30),
            minimum_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    /// Builds the timeout controller for one operation category, seeded
    /// from this configuration.
    pub fn new_dynamic_timeout(&self) -> DynamicTimeout {
        DynamicTimeout::new(self.acquire_timeout, self.minimum_timeout)
    }
}
