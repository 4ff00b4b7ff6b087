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

//! Networking and communication components
//!
//! - `transport`: the point-to-point interface everything else runs on
//! - `oob`: the ring allgather used while a team is being formed
//! - `request`: the shared asynchronous request lifecycle
//! - `xccl`: communicator bootstrap and collectives on a collective engine
//! - `local`: in-process transport and engine

pub mod comm_config;
pub mod comm_operations;
pub mod communicator;
pub mod local;
pub mod oob;
pub mod request;
pub mod transport;
pub mod xccl;

// Re-exports for convenience
pub use comm_config::CommConfig;
pub use communicator::Communicator;
pub use request::{CollRequest, Completion, RequestId, RequestStatus, WorkList};
pub use transport::{OpId, P2PTransport, Tag, TestStatus};

/// Communication backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    Xccl,
}
