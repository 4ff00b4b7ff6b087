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

//! Data-path collectives on a ready XCCL communicator
//!
//! Each `begin_*` call marshals the engine arguments, then initializes and
//! posts the collective. Problems with the arguments (unmapped element type
//! or operator, inconsistent counts) do not surface as `Err`: the returned
//! request is already in `Error` and nothing was handed to the engine.

use std::sync::Arc;

use crate::data_types::Type;
use crate::error::{Code, XcclError, XcclResult};
use crate::net::comm_operations::ReduceOp;
use crate::net::request::{CollRequest, RequestStatus};
use crate::net::Communicator;

use super::communicator::XcclCommunicator;
use super::engine::{
    BufferInfo, CollArgs, CollType, CollectiveEngine, EngineRequest, ReduceInfo, TeamHandle,
};
use super::mapping::{engine_dt, engine_op};

/// Arguments of a variable-size all-to-all.
///
/// Counts and offsets are in elements of the respective type, one entry per
/// rank.
#[derive(Debug, Clone)]
pub struct AllToAllVArgs {
    pub send: Vec<u8>,
    pub send_type: Type,
    pub send_counts: Vec<u32>,
    pub send_offsets: Vec<u32>,
    pub recv_type: Type,
    pub recv_counts: Vec<u32>,
    pub recv_offsets: Vec<u32>,
}

/// An in-flight data-path collective
pub struct XcclRequest {
    engine: Arc<dyn CollectiveEngine>,
    coll_type: CollType,
    request: Option<EngineRequest>,
    status: RequestStatus,
    output: Option<Vec<u8>>,
    error: Option<XcclError>,
}

impl XcclRequest {
    fn failed(engine: Arc<dyn CollectiveEngine>, coll_type: CollType, error: XcclError) -> Self {
        crate::xccl_warn!("{:?} rejected at begin: {}", coll_type, error);
        Self {
            engine,
            coll_type,
            request: None,
            status: RequestStatus::Error,
            output: None,
            error: Some(error),
        }
    }

    fn start(engine: Arc<dyn CollectiveEngine>, team: &TeamHandle, args: CollArgs) -> Self {
        let coll_type = args.coll_type;

        let request = match engine.collective_init(args, team) {
            Ok(req) => req,
            Err(e) => return Self::failed(engine, coll_type, e),
        };
        if let Err(e) = engine.collective_post(&request) {
            if let Err(fin) = engine.collective_finalize(request) {
                crate::xccl_warn!("finalize after failed post: {}", fin);
            }
            return Self::failed(engine, coll_type, e);
        }

        Self {
            engine,
            coll_type,
            request: Some(request),
            status: RequestStatus::InProgress,
            output: None,
            error: None,
        }
    }

    pub fn coll_type(&self) -> CollType {
        self.coll_type
    }

    /// Why the request ended in `Error`
    pub fn error(&self) -> Option<&XcclError> {
        self.error.as_ref()
    }

    /// Destination buffer of a completed collective
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.output.take()
    }

    /// Mark the request terminal and release the engine request exactly once
    fn finish(&mut self, status: RequestStatus, error: Option<XcclError>) {
        if let Some(req) = self.request.take() {
            match self.engine.collective_finalize(req) {
                Ok(dst) => self.output = Some(dst),
                Err(e) => {
                    crate::xccl_error!("{:?} finalize failed: {}", self.coll_type, e);
                    self.status = RequestStatus::Error;
                    self.error = Some(error.unwrap_or(e));
                    return;
                }
            }
        }
        self.status = status;
        self.error = error;
    }
}

impl CollRequest for XcclRequest {
    fn progress(&mut self) -> XcclResult<()> {
        if self.status != RequestStatus::InProgress {
            return Ok(());
        }
        let req = match self.request.as_ref() {
            Some(req) => req,
            None => return Ok(()),
        };

        match self.engine.collective_test(req) {
            Ok(RequestStatus::InProgress) => Ok(()),
            Ok(RequestStatus::Ok) => {
                self.finish(RequestStatus::Ok, None);
                Ok(())
            }
            Ok(RequestStatus::Error) => {
                let err = XcclError::new(
                    Code::ExecutionError,
                    format!("{:?} completed with an error", self.coll_type),
                );
                self.finish(RequestStatus::Error, Some(err.clone()));
                Err(err)
            }
            Err(e) => {
                self.finish(RequestStatus::Error, Some(e.clone()));
                Err(e)
            }
        }
    }

    fn status(&self) -> RequestStatus {
        self.status
    }

    fn free(self: Box<Self>) -> XcclResult<Vec<u8>> {
        let mut this = *self;
        if this.status == RequestStatus::InProgress {
            crate::xccl_error!("{:?} request freed while in progress", this.coll_type);
            return Err(XcclError::new(
                Code::Invalid,
                "collective request freed before reaching a terminal status",
            ));
        }
        Ok(this.output.take().unwrap_or_default())
    }
}

impl Drop for XcclRequest {
    fn drop(&mut self) {
        if let Some(req) = self.request.take() {
            crate::xccl_debug!("{:?} request dropped before completion", self.coll_type);
            if let Err(e) = self.engine.collective_finalize(req) {
                crate::xccl_warn!("finalize of dropped {:?} request: {}", self.coll_type, e);
            }
        }
    }
}

impl std::fmt::Debug for XcclRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XcclRequest")
            .field("coll_type", &self.coll_type)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish()
    }
}

/// Destination size of an all-to-all-v in bytes
fn displaced_len(counts: &[u32], offsets: &[u32], width: usize) -> XcclResult<usize> {
    let mut len = 0;
    for (&c, &o) in counts.iter().zip(offsets) {
        let end = (c as usize)
            .checked_add(o as usize)
            .and_then(|elems| elems.checked_mul(width))
            .ok_or_else(|| {
                XcclError::Invalid(format!(
                    "offset {} + count {} elements of {} bytes overflows",
                    o, c, width
                ))
            })?;
        len = len.max(end);
    }
    Ok(len)
}

fn check_per_rank(name: &str, values: &[u32], world_size: usize) -> XcclResult<()> {
    if values.len() != world_size {
        return Err(XcclError::Invalid(format!(
            "{} has {} entries, communicator has {} ranks",
            name,
            values.len(),
            world_size
        )));
    }
    Ok(())
}

impl XcclCommunicator {
    /// Start a byte-wise all-to-all; `len` is the number of bytes exchanged
    /// with every rank
    pub fn begin_all_to_all(&self, send: Vec<u8>, len: usize) -> XcclResult<XcclRequest> {
        let team = self.ready_team()?;
        let engine = Arc::clone(self.engine());
        let world_size = self.get_world_size();

        let total = match len.checked_mul(world_size) {
            Some(total) if send.len() >= total => total,
            _ => {
                return Ok(XcclRequest::failed(
                    engine,
                    CollType::AllToAll,
                    XcclError::Invalid(format!(
                        "send buffer holds {} bytes, {} ranks x {} bytes required",
                        send.len(),
                        world_size,
                        len
                    )),
                ))
            }
        };

        let args = CollArgs {
            coll_type: CollType::AllToAll,
            buffer_info: BufferInfo {
                src_buffer: send,
                dst_len: total,
                len,
                ..Default::default()
            },
            reduce_info: None,
            alg_set_by_user: false,
        };
        Ok(XcclRequest::start(engine, team, args))
    }

    /// Start a variable-size all-to-all
    pub fn begin_all_to_all_v(&self, args: AllToAllVArgs) -> XcclResult<XcclRequest> {
        let team = self.ready_team()?;
        let engine = Arc::clone(self.engine());
        let world_size = self.get_world_size();

        let marshalled = (|| -> XcclResult<CollArgs> {
            let src_dt = engine_dt(args.send_type)?;
            let dst_dt = engine_dt(args.recv_type)?;
            check_per_rank("send_counts", &args.send_counts, world_size)?;
            check_per_rank("send_offsets", &args.send_offsets, world_size)?;
            check_per_rank("recv_counts", &args.recv_counts, world_size)?;
            check_per_rank("recv_offsets", &args.recv_offsets, world_size)?;

            let needed = displaced_len(&args.send_counts, &args.send_offsets, src_dt.size())?;
            let dst_len = displaced_len(&args.recv_counts, &args.recv_offsets, dst_dt.size())?;
            if args.send.len() < needed {
                return Err(XcclError::Invalid(format!(
                    "send buffer holds {} bytes, counts and offsets reach {}",
                    args.send.len(),
                    needed
                )));
            }

            Ok(CollArgs {
                coll_type: CollType::AllToAllV,
                buffer_info: BufferInfo {
                    dst_len,
                    src_buffer: args.send,
                    src_counts: args.send_counts,
                    src_displacements: args.send_offsets,
                    src_datatype: Some(src_dt),
                    dst_counts: args.recv_counts,
                    dst_displacements: args.recv_offsets,
                    dst_datatype: Some(dst_dt),
                    ..Default::default()
                },
                reduce_info: None,
                alg_set_by_user: false,
            })
        })();

        Ok(match marshalled {
            Ok(coll_args) => XcclRequest::start(engine, team, coll_args),
            Err(e) => XcclRequest::failed(engine, CollType::AllToAllV, e),
        })
    }

    /// Start an all-reduce of `count` elements of `data_type`
    pub fn begin_all_reduce(
        &self,
        send: Vec<u8>,
        count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> XcclResult<XcclRequest> {
        let team = self.ready_team()?;
        let engine = Arc::clone(self.engine());

        let marshalled = (|| -> XcclResult<CollArgs> {
            let dt = engine_dt(data_type)?;
            let engine_op = engine_op(op)?;
            let len = count.checked_mul(data_type.byte_width()).ok_or_else(|| {
                XcclError::Invalid(format!(
                    "{} elements of {:?} overflow the address space",
                    count, data_type
                ))
            })?;
            if send.len() < len {
                return Err(XcclError::Invalid(format!(
                    "send buffer holds {} bytes, {} elements of {:?} need {}",
                    send.len(),
                    count,
                    data_type,
                    len
                )));
            }

            Ok(CollArgs {
                coll_type: CollType::AllReduce,
                buffer_info: BufferInfo {
                    src_buffer: send,
                    dst_len: len,
                    len,
                    ..Default::default()
                },
                reduce_info: Some(ReduceInfo {
                    dt,
                    op: engine_op,
                    count,
                }),
                alg_set_by_user: false,
            })
        })();

        Ok(match marshalled {
            Ok(coll_args) => XcclRequest::start(engine, team, coll_args),
            Err(e) => XcclRequest::failed(engine, CollType::AllReduce, e),
        })
    }
}
