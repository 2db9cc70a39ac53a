// Copyright 2025 ribd Authors
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

//! Logging facade. Modules log through the `tracing` macros re-exported here
//! so call sites read `use crate::log::{debug, error, info, warn}`.

pub use tracing::{debug, error, info, trace, warn};

use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

/// Wall-clock stamp for the few lines printed before the subscriber exists.
pub fn get_timestamp() -> String {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => format!("{}.{:03}", duration.as_secs(), duration.subsec_millis()),
        Err(_) => "unknown".to_string(),
    }
}

/// Log a condition that must never happen in a healthy process, such as a
/// task that could not be joined before its deadline.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        ::tracing::error!(fatal = true, $($arg)+)
    };
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
/// Returns an error string if a subscriber was already installed.
pub fn init(level: &str, json: bool) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("ribd={}", level)))
        .map_err(|e| format!("invalid log level '{}': {}", level, e))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| e.to_string())
}
