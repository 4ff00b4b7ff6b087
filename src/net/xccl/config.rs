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

//! XCCL configuration
//!
//! Defaults reproduce the fixed bootstrap policy: software and hardware
//! team usage, broadcast/all-reduce/all-to-all/all-to-all-v capabilities,
//! `Multiple` thread mode, `Blocking` team completion and the UCX transport
//! layer.
//!
//! Environment overrides (read by [`XcclConfig::from_env`]):
//! - `CYLON_XCCL_CONFIG_PREFIX` - prefix used to read the context config
//! - `CYLON_XCCL_THREAD_MODE` - `single`, `funneled` or `multiple`
//! - `CYLON_XCCL_COMPLETION_TYPE` - `blocking` or `non_blocking`

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Code, XcclError, XcclResult};
use crate::net::transport::P2PTransport;
use crate::net::{CommConfig, CommType, Communicator};

use super::communicator::XcclCommunicator;
use super::engine::{
    CollCaps, CollectiveEngine, CompletionType, LibParams, TeamUsage, ThreadMode, TransportLayer,
};

/// Default prefix for reading the engine context configuration
pub const DEFAULT_CONFIG_PREFIX: &str = "TORCH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XcclConfig {
    /// Prefix passed to the engine when reading its context configuration
    pub config_prefix: String,
    pub team_usage: TeamUsage,
    pub coll_types: CollCaps,
    pub thread_mode: ThreadMode,
    pub completion_type: CompletionType,
    pub tls: TransportLayer,
}

impl Default for XcclConfig {
    fn default() -> Self {
        Self {
            config_prefix: DEFAULT_CONFIG_PREFIX.to_string(),
            team_usage: TeamUsage::SW_COLLECTIVES | TeamUsage::HW_COLLECTIVES,
            coll_types: CollCaps::BCAST
                | CollCaps::ALLREDUCE
                | CollCaps::ALLTOALL
                | CollCaps::ALLTOALLV,
            thread_mode: ThreadMode::Multiple,
            completion_type: CompletionType::Blocking,
            tls: TransportLayer::Ucx,
        }
    }
}

impl XcclConfig {
    /// Defaults overridden by the `CYLON_XCCL_*` environment variables
    pub fn from_env() -> XcclResult<Self> {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("CYLON_XCCL_CONFIG_PREFIX") {
            config.config_prefix = prefix;
        }

        if let Ok(mode) = std::env::var("CYLON_XCCL_THREAD_MODE") {
            config.thread_mode = match mode.to_ascii_lowercase().as_str() {
                "single" => ThreadMode::Single,
                "funneled" => ThreadMode::Funneled,
                "multiple" => ThreadMode::Multiple,
                other => {
                    return Err(XcclError::new(
                        Code::Invalid,
                        format!("Invalid CYLON_XCCL_THREAD_MODE: {}", other),
                    ))
                }
            };
        }

        if let Ok(completion) = std::env::var("CYLON_XCCL_COMPLETION_TYPE") {
            config.completion_type = match completion.to_ascii_lowercase().as_str() {
                "blocking" => CompletionType::Blocking,
                "non_blocking" | "nonblocking" => CompletionType::NonBlocking,
                other => {
                    return Err(XcclError::new(
                        Code::Invalid,
                        format!("Invalid CYLON_XCCL_COMPLETION_TYPE: {}", other),
                    ))
                }
            };
        }

        Ok(config)
    }

    /// Capability declaration for `lib_init`
    pub fn lib_params(&self) -> LibParams {
        LibParams {
            team_usage: self.team_usage,
            coll_types: self.coll_types,
        }
    }

    /// Builder pattern: set the context config prefix
    pub fn config_prefix(mut self, prefix: &str) -> Self {
        self.config_prefix = prefix.to_string();
        self
    }

    /// Builder pattern: set the thread mode
    pub fn thread_mode(mut self, mode: ThreadMode) -> Self {
        self.thread_mode = mode;
        self
    }

    /// Builder pattern: set the team completion type
    pub fn completion_type(mut self, completion: CompletionType) -> Self {
        self.completion_type = completion;
        self
    }

    /// Builder pattern: set the requested collective capabilities
    pub fn coll_types(mut self, caps: CollCaps) -> Self {
        self.coll_types = caps;
        self
    }
}

/// Everything needed to open an XCCL communicator from async code
#[derive(Clone)]
pub struct XcclCommConfig {
    pub config: XcclConfig,
    engine: Arc<dyn CollectiveEngine>,
    transport: Arc<dyn P2PTransport>,
}

impl XcclCommConfig {
    pub fn new(
        config: XcclConfig,
        engine: Arc<dyn CollectiveEngine>,
        transport: Arc<dyn P2PTransport>,
    ) -> Self {
        Self {
            config,
            engine,
            transport,
        }
    }

    /// Open the communicator on the blocking pool; team formation spins
    /// until every rank has joined
    pub async fn connect(&self) -> XcclResult<XcclCommunicator> {
        let engine = Arc::clone(&self.engine);
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || XcclCommunicator::open(engine, transport, config))
            .await
            .map_err(|e| {
                XcclError::new(Code::ExecutionError, format!("bootstrap task failed: {}", e))
            })?
    }
}

#[async_trait]
impl CommConfig for XcclCommConfig {
    fn get_type(&self) -> CommType {
        CommType::Xccl
    }

    async fn create_communicator(&self) -> XcclResult<Box<dyn Communicator>> {
        let comm = self.connect().await?;
        Ok(Box::new(comm))
    }
}
