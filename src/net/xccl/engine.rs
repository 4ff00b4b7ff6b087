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

//! Collective engine interface
//!
//! The engine owns the library, context and team objects and runs the
//! collective algorithms. Handles are owned wrappers: they are released by
//! passing them back by value, so a handle cannot be destroyed twice.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::XcclResult;
use crate::net::oob::{OobParams, RankRange};
use crate::net::request::RequestStatus;

macro_rules! engine_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wrap an engine-side identifier
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn id(&self) -> u64 {
                self.0
            }
        }
    };
}

engine_handle!(
    /// Library instance
    LibHandle
);
engine_handle!(
    /// Context configuration read from the environment
    ContextConfig
);
engine_handle!(
    /// Communication context
    ContextHandle
);
engine_handle!(
    /// Team of ranks able to run collectives
    TeamHandle
);
engine_handle!(
    /// One initialized collective
    EngineRequest
);

/// How the library intends to use teams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamUsage(u32);

impl TeamUsage {
    pub const SW_COLLECTIVES: TeamUsage = TeamUsage(1 << 0);
    pub const HW_COLLECTIVES: TeamUsage = TeamUsage(1 << 1);

    pub fn contains(&self, other: TeamUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for TeamUsage {
    type Output = TeamUsage;

    fn bitor(self, rhs: Self) -> Self {
        TeamUsage(self.0 | rhs.0)
    }
}

/// Collective capabilities requested from the library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollCaps(u32);

impl CollCaps {
    pub const BCAST: CollCaps = CollCaps(1 << 0);
    pub const ALLREDUCE: CollCaps = CollCaps(1 << 1);
    pub const ALLTOALL: CollCaps = CollCaps(1 << 2);
    pub const ALLTOALLV: CollCaps = CollCaps(1 << 3);

    pub fn contains(&self, other: CollCaps) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for CollCaps {
    type Output = CollCaps;

    fn bitor(self, rhs: Self) -> Self {
        CollCaps(self.0 | rhs.0)
    }
}

/// Threading guarantees the caller asks of the context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadMode {
    Single,
    Funneled,
    Multiple,
}

/// Whether team creation may complete asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionType {
    Blocking,
    NonBlocking,
}

/// Transport layer the engine should run its collectives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportLayer {
    Ucx,
    Sharp,
    Vmc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibParams {
    pub team_usage: TeamUsage,
    pub coll_types: CollCaps,
}

#[derive(Debug, Clone)]
pub struct ContextParams {
    pub thread_mode: ThreadMode,
    pub completion_type: CompletionType,
    pub tls: TransportLayer,
    pub oob: OobParams,
}

#[derive(Debug, Clone)]
pub struct TeamParams {
    pub range: RankRange,
    pub oob: OobParams,
}

/// Element types the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineDataType {
    Uint8,
    Int8,
    Float16,
    Float32,
    Float64,
    Int32,
    Int64,
}

impl EngineDataType {
    pub fn size(&self) -> usize {
        match self {
            EngineDataType::Uint8 | EngineDataType::Int8 => 1,
            EngineDataType::Float16 => 2,
            EngineDataType::Float32 | EngineDataType::Int32 => 4,
            EngineDataType::Float64 | EngineDataType::Int64 => 8,
        }
    }
}

/// Reduction operators the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Min,
    Max,
    Sum,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollType {
    AllToAll,
    AllToAllV,
    AllReduce,
}

/// Source and destination description of a collective
#[derive(Debug, Clone, Default)]
pub struct BufferInfo {
    pub src_buffer: Vec<u8>,
    /// Size of the destination buffer in bytes
    pub dst_len: usize,
    /// Bytes per peer for all-to-all, total bytes for all-reduce
    pub len: usize,
    pub src_counts: Vec<u32>,
    pub src_displacements: Vec<u32>,
    pub src_datatype: Option<EngineDataType>,
    pub dst_counts: Vec<u32>,
    pub dst_displacements: Vec<u32>,
    pub dst_datatype: Option<EngineDataType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceInfo {
    pub dt: EngineDataType,
    pub op: EngineOp,
    pub count: usize,
}

/// Arguments of one collective
#[derive(Debug, Clone)]
pub struct CollArgs {
    pub coll_type: CollType,
    pub buffer_info: BufferInfo,
    pub reduce_info: Option<ReduceInfo>,
    /// Let the caller pick the algorithm; always false for now
    pub alg_set_by_user: bool,
}

/// Library, context, team and collective entry points of an engine
pub trait CollectiveEngine: Send + Sync {
    fn lib_init(&self, params: &LibParams) -> XcclResult<LibHandle>;
    fn lib_cleanup(&self, lib: LibHandle) -> XcclResult<()>;

    fn context_config_read(&self, lib: &LibHandle, prefix: &str) -> XcclResult<ContextConfig>;
    fn context_config_release(&self, config: ContextConfig);
    fn context_create(
        &self,
        lib: &LibHandle,
        params: ContextParams,
        config: &ContextConfig,
    ) -> XcclResult<ContextHandle>;
    fn context_destroy(&self, ctx: ContextHandle) -> XcclResult<()>;

    /// Start team formation; completion is reported by `team_create_test`
    fn team_create_post(&self, ctx: &ContextHandle, params: TeamParams) -> XcclResult<TeamHandle>;
    fn team_create_test(&self, team: &TeamHandle) -> XcclResult<RequestStatus>;
    fn team_destroy(&self, team: TeamHandle) -> XcclResult<()>;

    fn collective_init(&self, args: CollArgs, team: &TeamHandle) -> XcclResult<EngineRequest>;
    fn collective_post(&self, req: &EngineRequest) -> XcclResult<()>;
    fn collective_test(&self, req: &EngineRequest) -> XcclResult<RequestStatus>;
    /// Release a collective and hand back its destination buffer
    fn collective_finalize(&self, req: EngineRequest) -> XcclResult<Vec<u8>>;
}
