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

//! XCCL collective backend
//!
//! Bootstrap of an engine communicator over an existing point-to-point
//! transport and the non-blocking collectives that run on it.

pub mod communicator;
pub mod config;
pub mod engine;
pub mod mapping;
pub mod operations;

pub use communicator::{CommState, XcclCommunicator};
pub use config::{XcclCommConfig, XcclConfig, DEFAULT_CONFIG_PREFIX};
pub use engine::CollectiveEngine;
pub use operations::{AllToAllVArgs, XcclRequest};

use std::sync::Arc;

use crate::data_types::Type;
use crate::error::XcclResult;
use crate::net::comm_operations::ReduceOp;
use crate::net::request::{CollRequest, RequestStatus};
use crate::net::transport::P2PTransport;

/// Operation table an upper layer uses to drive any collective backend
pub trait CollOps {
    type Comm;
    type Request: CollRequest;

    fn comm_init(&self, transport: Arc<dyn P2PTransport>) -> XcclResult<Self::Comm>;

    fn alltoall(&self, comm: &Self::Comm, send: Vec<u8>, len: usize)
        -> XcclResult<Self::Request>;

    fn alltoallv(&self, comm: &Self::Comm, args: AllToAllVArgs) -> XcclResult<Self::Request>;

    fn allreduce(
        &self,
        comm: &Self::Comm,
        send: Vec<u8>,
        count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> XcclResult<Self::Request>;

    fn progress(&self, req: &mut Self::Request) -> XcclResult<()>;

    fn test(&self, req: &Self::Request) -> RequestStatus;

    fn free(&self, req: Self::Request) -> XcclResult<Vec<u8>>;

    fn comm_close(&self, comm: Self::Comm) -> XcclResult<()>;
}

type EngineFactory<E> = dyn Fn(Arc<dyn P2PTransport>) -> E + Send + Sync;

/// `CollOps` over XCCL communicators; one engine is built per communicator
pub struct XcclCollOps<E: CollectiveEngine> {
    config: XcclConfig,
    make_engine: Box<EngineFactory<E>>,
}

impl<E: CollectiveEngine + 'static> XcclCollOps<E> {
    pub fn new<F>(config: XcclConfig, make_engine: F) -> Self
    where
        F: Fn(Arc<dyn P2PTransport>) -> E + Send + Sync + 'static,
    {
        Self {
            config,
            make_engine: Box::new(make_engine),
        }
    }

    pub fn config(&self) -> &XcclConfig {
        &self.config
    }
}

impl<E: CollectiveEngine + 'static> CollOps for XcclCollOps<E> {
    type Comm = XcclCommunicator;
    type Request = XcclRequest;

    fn comm_init(&self, transport: Arc<dyn P2PTransport>) -> XcclResult<XcclCommunicator> {
        let engine: Arc<dyn CollectiveEngine> =
            Arc::new((self.make_engine)(Arc::clone(&transport)));
        XcclCommunicator::open(engine, transport, self.config.clone())
    }

    fn alltoall(
        &self,
        comm: &XcclCommunicator,
        send: Vec<u8>,
        len: usize,
    ) -> XcclResult<XcclRequest> {
        comm.begin_all_to_all(send, len)
    }

    fn alltoallv(&self, comm: &XcclCommunicator, args: AllToAllVArgs) -> XcclResult<XcclRequest> {
        comm.begin_all_to_all_v(args)
    }

    fn allreduce(
        &self,
        comm: &XcclCommunicator,
        send: Vec<u8>,
        count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> XcclResult<XcclRequest> {
        comm.begin_all_reduce(send, count, data_type, op)
    }

    fn progress(&self, req: &mut XcclRequest) -> XcclResult<()> {
        req.progress()
    }

    fn test(&self, req: &XcclRequest) -> RequestStatus {
        req.status()
    }

    fn free(&self, req: XcclRequest) -> XcclResult<Vec<u8>> {
        Box::new(req).free()
    }

    fn comm_close(&self, comm: XcclCommunicator) -> XcclResult<()> {
        comm.close()
    }
}
