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

//! cylon-xccl: collective-communication bootstrap for Cylon
//!
//! Brings up a communicator on an external collective engine (XCCL) using a
//! point-to-point transport the host already has. While the engine forms
//! its team it exchanges per-rank information through a resumable ring
//! allgather; once the team exists, all-to-all, all-to-all-v and all-reduce
//! run as non-blocking requests sharing one begin/progress/test/free
//! lifecycle.

pub mod data_types;
pub mod error;
pub mod net;
pub mod util;

// Re-export commonly used types
pub use crate::data_types::Type;
pub use crate::error::{Code, XcclError, XcclResult};
pub use crate::net::comm_operations::ReduceOp;
pub use crate::net::oob::{OobCollectives, OobRequest, RankRange, RingOob};
pub use crate::net::request::{CollRequest, RequestStatus, WorkList};
pub use crate::net::xccl::{XcclCommunicator, XcclConfig, XcclRequest};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
