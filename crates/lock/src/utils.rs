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

pub const SLASH_SEPARATOR: &str = "/";

/// Joins a volume and a path into a canonical resource name.
///
/// Resource names are compared bytewise; this is a namespace key, not
/// an OS path.
pub fn path_join(volume: &str, path: &str) -> String {
    let volume = volume.trim_end_matches(SLASH_SEPARATOR);
    let path = path.trim_start_matches(SLASH_SEPARATOR);
    if path.is_empty() {
        return volume.to_string();
    }
    format!("{volume}{SLASH_SEPARATOR}{path}")
}
