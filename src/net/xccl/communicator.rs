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

//! XCCL communicator bootstrap
//!
//! Opening a communicator walks the engine through library, context and
//! team creation. The ring OOB allgather bound to the caller's transport is
//! handed to the engine at context and team creation; team formation is
//! then polled to completion. Any failure releases what was created so far
//! in reverse order.

use std::sync::Arc;

use crate::error::{Code, XcclError, XcclResult};
use crate::net::oob::{OobCollectives, OobParams, RankRange, RingOob};
use crate::net::request::RequestStatus;
use crate::net::transport::P2PTransport;
use crate::net::{CommType, Communicator};

use super::config::XcclConfig;
use super::engine::{
    CollectiveEngine, ContextHandle, ContextParams, LibHandle, TeamHandle, TeamParams,
};

/// Bootstrap progress of a communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    Uninitialized,
    LibraryReady,
    ContextReady,
    TeamPosted,
    Ready,
    Failed,
    Closed,
}

pub struct XcclCommunicator {
    rank: usize,
    world_size: usize,
    state: CommState,
    config: XcclConfig,
    engine: Arc<dyn CollectiveEngine>,
    transport: Arc<dyn P2PTransport>,
    lib: Option<LibHandle>,
    ctx: Option<ContextHandle>,
    team: Option<TeamHandle>,
}

impl XcclCommunicator {
    fn new(
        engine: Arc<dyn CollectiveEngine>,
        transport: Arc<dyn P2PTransport>,
        config: XcclConfig,
    ) -> Self {
        Self {
            rank: transport.rank(),
            world_size: transport.world_size(),
            state: CommState::Uninitialized,
            config,
            engine,
            transport,
            lib: None,
            ctx: None,
            team: None,
        }
    }

    /// Bootstrap a communicator over `transport`.
    ///
    /// Blocks until the team is formed, which requires every rank of the
    /// transport to open its communicator concurrently.
    pub fn open(
        engine: Arc<dyn CollectiveEngine>,
        transport: Arc<dyn P2PTransport>,
        config: XcclConfig,
    ) -> XcclResult<Self> {
        let mut comm = Self::new(engine, transport, config);
        if let Err(e) = comm.bootstrap() {
            crate::xccl_error!(
                "rank {}: communicator bootstrap failed in state {:?}: {}",
                comm.rank,
                comm.state,
                e
            );
            comm.state = CommState::Failed;
            if let Err(cleanup) = comm.teardown() {
                crate::xccl_warn!("rank {}: cleanup after failed bootstrap: {}", comm.rank, cleanup);
            }
            return Err(e);
        }
        crate::xccl_info!(
            "rank {}/{}: XCCL communicator ready",
            comm.rank,
            comm.world_size
        );
        Ok(comm)
    }

    fn oob_params(&self) -> OobParams {
        let ops: Arc<dyn OobCollectives> = Arc::new(RingOob::new(Arc::clone(&self.transport)));
        OobParams {
            ops,
            rank: self.rank,
            size: self.world_size,
        }
    }

    fn bootstrap(&mut self) -> XcclResult<()> {
        let lib = self.engine.lib_init(&self.config.lib_params()).map_err(|e| {
            XcclError::new(
                Code::CapabilityError,
                format!("failed to init XCCL lib: {}", e),
            )
        })?;
        self.lib = Some(lib);
        self.state = CommState::LibraryReady;
        crate::xccl_debug!("rank {}: XCCL library initialized", self.rank);

        self.create_context()?;
        self.state = CommState::ContextReady;
        crate::xccl_debug!("rank {}: XCCL context created", self.rank);

        self.post_team()?;
        self.state = CommState::TeamPosted;
        crate::xccl_debug!("rank {}: XCCL team creation posted", self.rank);

        self.wait_team()?;
        self.state = CommState::Ready;
        Ok(())
    }

    fn create_context(&mut self) -> XcclResult<()> {
        let lib = self
            .lib
            .as_ref()
            .ok_or_else(|| XcclError::Invalid("context creation without a library".into()))?;

        let ctx_config = self
            .engine
            .context_config_read(lib, &self.config.config_prefix)
            .map_err(|e| {
                XcclError::new(
                    e.code(),
                    format!("failed to read XCCL context config: {}", e),
                )
            })?;

        let params = ContextParams {
            thread_mode: self.config.thread_mode,
            completion_type: self.config.completion_type,
            tls: self.config.tls,
            oob: self.oob_params(),
        };

        let created = self.engine.context_create(lib, params, &ctx_config);
        self.engine.context_config_release(ctx_config);

        let ctx = created.map_err(|e| {
            XcclError::new(e.code(), format!("failed to create XCCL context: {}", e))
        })?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn post_team(&mut self) -> XcclResult<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| XcclError::Invalid("team creation without a context".into()))?;

        let params = TeamParams {
            range: RankRange::full(self.world_size),
            oob: self.oob_params(),
        };

        let team = self.engine.team_create_post(ctx, params).map_err(|e| {
            XcclError::new(e.code(), format!("failed to create XCCL team: {}", e))
        })?;
        self.team = Some(team);
        Ok(())
    }

    /// The one blocking wait of the crate: nothing can run on this
    /// communicator before its team exists
    fn wait_team(&mut self) -> XcclResult<()> {
        let team = self
            .team
            .as_ref()
            .ok_or_else(|| XcclError::Invalid("team wait without a posted team".into()))?;

        loop {
            match self.engine.team_create_test(team)? {
                RequestStatus::InProgress => std::thread::yield_now(),
                RequestStatus::Ok => return Ok(()),
                RequestStatus::Error => {
                    return Err(XcclError::new(
                        Code::ExecutionError,
                        "XCCL team creation completed with an error",
                    ))
                }
            }
        }
    }

    /// Destroy team, context and library in that order, skipping handles
    /// that were never created. Every step runs; the first error is
    /// returned.
    fn teardown(&mut self) -> XcclResult<()> {
        let mut first_err: Option<XcclError> = None;

        if let Some(team) = self.team.take() {
            if let Err(e) = self.engine.team_destroy(team) {
                crate::xccl_error!("rank {}: team destroy failed: {}", self.rank, e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(ctx) = self.ctx.take() {
            if let Err(e) = self.engine.context_destroy(ctx) {
                crate::xccl_error!("rank {}: context destroy failed: {}", self.rank, e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(lib) = self.lib.take() {
            if let Err(e) = self.engine.lib_cleanup(lib) {
                crate::xccl_error!("rank {}: library cleanup failed: {}", self.rank, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear the communicator down
    pub fn close(mut self) -> XcclResult<()> {
        self.close_in_place()
    }

    fn close_in_place(&mut self) -> XcclResult<()> {
        if self.state == CommState::Closed {
            return Ok(());
        }
        let result = self.teardown();
        self.state = CommState::Closed;
        crate::xccl_debug!("rank {}: XCCL communicator closed", self.rank);
        result
    }

    pub fn state(&self) -> CommState {
        self.state
    }

    pub fn config(&self) -> &XcclConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn CollectiveEngine> {
        &self.engine
    }

    /// Team handle, only while the communicator is ready
    pub(crate) fn ready_team(&self) -> XcclResult<&TeamHandle> {
        match (&self.state, &self.team) {
            (CommState::Ready, Some(team)) => Ok(team),
            (state, _) => Err(XcclError::Invalid(format!(
                "collective requested on a communicator in state {:?}",
                state
            ))),
        }
    }
}

impl Communicator for XcclCommunicator {
    fn get_rank(&self) -> usize {
        self.rank
    }

    fn get_world_size(&self) -> usize {
        self.world_size
    }

    fn get_comm_type(&self) -> CommType {
        CommType::Xccl
    }

    fn is_finalized(&self) -> bool {
        self.state == CommState::Closed
    }

    fn finalize(&mut self) -> XcclResult<()> {
        self.close_in_place()
    }
}

impl Drop for XcclCommunicator {
    fn drop(&mut self) {
        if self.state != CommState::Closed {
            if let Err(e) = self.close_in_place() {
                crate::xccl_warn!("rank {}: error closing dropped communicator: {}", self.rank, e);
            }
        }
    }
}

impl std::fmt::Debug for XcclCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XcclCommunicator")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}
