// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Logging utilities
//!
//! Thin layer over the `log` facade; binaries and tests pick the sink with
//! `env_logger` (configured through `RUST_LOG`).

/// Initialize logging with default configuration
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

/// Initialize logging with specific level
pub fn init_logging_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

#[macro_export]
macro_rules! xccl_info {
    ($($arg:tt)*) => {
        log::info!(target: "cylon_xccl", $($arg)*)
    };
}

#[macro_export]
macro_rules! xccl_debug {
    ($($arg:tt)*) => {
        log::debug!(target: "cylon_xccl", $($arg)*)
    };
}

#[macro_export]
macro_rules! xccl_warn {
    ($($arg:tt)*) => {
        log::warn!(target: "cylon_xccl", $($arg)*)
    };
}

#[macro_export]
macro_rules! xccl_error {
    ($($arg:tt)*) => {
        log::error!(target: "cylon_xccl", $($arg)*)
    };
}

#[macro_export]
macro_rules! xccl_trace {
    ($($arg:tt)*) => {
        log::trace!(target: "cylon_xccl", $($arg)*)
    };
}
