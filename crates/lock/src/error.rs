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

use thiserror::Error;

/// Lock operation error types.
///
/// `OperationTimedOut` is the only failure a lock caller is expected to
/// handle; cancellation and below-quorum grants surface through it as
/// well. Everything else is either internal to a peer call or fatal.
#[derive(Debug, Error)]
pub enum LockError {
    /// The acquire did not complete before the timeout elapsed or the
    /// caller's cancellation fired.
    #[error("lock acquisition timed out")]
    OperationTimedOut,

    /// Peer-side request validation failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LockError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Timeouts are retryable at the caller's discretion; nothing is
    /// retried inside this crate.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::OperationTimedOut)
    }
}

/// Lock operation Result type.
pub type Result<T> = std::result::Result<T, LockError>;
