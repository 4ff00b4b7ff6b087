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

//! Ring allgather over a point-to-point transport
//!
//! Every participant copies its own contribution into its slot of the
//! receive buffer, then for `size - 1` steps forwards the block it received
//! last to its right neighbour while receiving a new block from its left
//! neighbour. Each step posts one send and one receive and `test` returns
//! as soon as a step is still outstanding, so any number of exchanges can be
//! driven from a single loop.
//!
//! Slots are indexed by local rank. For `Undefined` and strided ranges the
//! local-to-global translation is monotone, so slot order is global-rank
//! order.

use std::sync::Arc;

use crate::error::{Code, XcclError, XcclResult};
use crate::net::request::{CollRequest, RequestStatus};
use crate::net::transport::{OpId, P2PTransport, TestStatus};

use super::{OobCollectives, RankRange, OOB_TAG};

/// Send and receive posted for the current step
#[derive(Debug, Clone, Copy)]
struct PendingPair {
    send: OpId,
    recv: OpId,
    /// Slot of the receive buffer the incoming block lands in
    slot: usize,
}

/// State of one in-flight ring allgather
pub struct OobRequest {
    transport: Arc<dyn P2PTransport>,
    range: RankRange,
    recv_buffer: Vec<u8>,
    local_rank: usize,
    size: usize,
    msg_len: usize,
    iteration: usize,
    /// Global rank of the right neighbour
    send_to: usize,
    /// Global rank of the left neighbour
    recv_from: usize,
    pending: Option<PendingPair>,
    status: RequestStatus,
    error: Option<XcclError>,
}

impl OobRequest {
    /// Validate the arguments, seed the local slot and run the first `test`
    pub fn begin(
        transport: Arc<dyn P2PTransport>,
        sbuf: &[u8],
        rbuf: Vec<u8>,
        msg_len: usize,
        local_rank: usize,
        range: RankRange,
    ) -> XcclResult<Self> {
        let world_size = transport.world_size();
        range.validate(world_size)?;

        let (size, local_rank) = if range.is_undefined() {
            (world_size, transport.rank())
        } else {
            (range.participants(world_size), local_rank)
        };

        if local_rank >= size {
            return Err(XcclError::Invalid(format!(
                "local rank {} outside a range of {} participants",
                local_rank, size
            )));
        }
        if sbuf.len() < msg_len {
            return Err(XcclError::Invalid(format!(
                "send buffer holds {} bytes, message length is {}",
                sbuf.len(),
                msg_len
            )));
        }
        let required = size.checked_mul(msg_len).ok_or_else(|| {
            XcclError::Invalid(format!(
                "{} participants x {} bytes overflows the address space",
                size, msg_len
            ))
        })?;
        if rbuf.len() < required {
            return Err(XcclError::Invalid(format!(
                "receive buffer holds {} bytes, {} participants x {} bytes required",
                rbuf.len(),
                size,
                msg_len
            )));
        }

        let mut recv_buffer = rbuf;
        let offset = local_rank * msg_len;
        recv_buffer[offset..offset + msg_len].copy_from_slice(&sbuf[..msg_len]);

        let neighbour = |local: usize| {
            range.to_global(local).ok_or_else(|| {
                XcclError::Invalid(format!("local rank {} has no global rank", local))
            })
        };
        let send_to = neighbour((local_rank + 1) % size)?;
        let recv_from = neighbour((local_rank + size - 1) % size)?;

        crate::xccl_debug!(
            "OOB allgather begin: local rank {}/{}, msg_len {}, send_to {}, recv_from {}",
            local_rank,
            size,
            msg_len,
            send_to,
            recv_from
        );

        let mut req = Self {
            transport,
            range,
            recv_buffer,
            local_rank,
            size,
            msg_len,
            iteration: 0,
            send_to,
            recv_from,
            pending: None,
            status: RequestStatus::InProgress,
            error: None,
        };
        req.test()?;
        Ok(req)
    }

    /// Advance as far as the transport allows without waiting.
    ///
    /// Returns `InProgress` while a step is outstanding. A transport failure
    /// is returned once as an error and leaves the request in `Error`.
    pub fn test(&mut self) -> XcclResult<RequestStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }

        match self.advance() {
            Ok(status) => {
                self.status = status;
                Ok(status)
            }
            Err(e) => {
                crate::xccl_error!(
                    "OOB allgather failed at iteration {} on local rank {}: {}",
                    self.iteration,
                    self.local_rank,
                    e
                );
                if let Some(pair) = self.pending.take() {
                    self.transport.release(&[pair.send, pair.recv]);
                }
                self.status = RequestStatus::Error;
                self.error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> XcclResult<RequestStatus> {
        let size = self.size;

        while self.iteration < size - 1 {
            if self.pending.is_some() && self.poll_pending()? == TestStatus::InProgress {
                return Ok(RequestStatus::InProgress);
            }

            let recv_data_from = (self.local_rank + size - self.iteration - 1) % size;
            let send_data_from = (self.local_rank + size - self.iteration) % size;

            let send_off = send_data_from * self.msg_len;
            let send = self.transport.isend(
                &self.recv_buffer[send_off..send_off + self.msg_len],
                self.send_to,
                OOB_TAG,
            )?;
            let recv = match self.transport.irecv(self.msg_len, self.recv_from, OOB_TAG) {
                Ok(op) => op,
                Err(e) => {
                    self.transport.release(&[send]);
                    return Err(e);
                }
            };

            crate::xccl_trace!(
                "OOB allgather iteration {}: send slot {} -> {}, recv slot {} <- {}",
                self.iteration,
                send_data_from,
                self.send_to,
                recv_data_from,
                self.recv_from
            );

            self.pending = Some(PendingPair {
                send,
                recv,
                slot: recv_data_from,
            });
            self.iteration += 1;
        }

        if self.pending.is_some() && self.poll_pending()? == TestStatus::InProgress {
            return Ok(RequestStatus::InProgress);
        }

        Ok(RequestStatus::Ok)
    }

    /// Test the outstanding pair; on completion copy the received block into
    /// its slot and clear the pair
    fn poll_pending(&mut self) -> XcclResult<TestStatus> {
        let pair = match self.pending {
            Some(pair) => pair,
            None => return Ok(TestStatus::Done),
        };

        if self.transport.test_all(&[pair.send, pair.recv])? == TestStatus::InProgress {
            return Ok(TestStatus::InProgress);
        }

        let data = self.transport.take_received(pair.recv)?;
        if data.len() != self.msg_len {
            return Err(XcclError::Communication(format!(
                "OOB allgather expected {} bytes from rank {}, got {}",
                self.msg_len,
                self.recv_from,
                data.len()
            )));
        }
        let off = pair.slot * self.msg_len;
        self.recv_buffer[off..off + self.msg_len].copy_from_slice(&data);
        self.pending = None;
        Ok(TestStatus::Done)
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Number of send/receive steps posted so far
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn participants(&self) -> usize {
        self.size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn range(&self) -> &RankRange {
        &self.range
    }

    /// Whether a send/receive pair is still outstanding
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The failure that moved this request to `Error`, if any
    pub fn error(&self) -> Option<&XcclError> {
        self.error.as_ref()
    }

    /// Gathered data, only available once the exchange reached `Ok`
    pub fn recv_buffer(&self) -> Option<&[u8]> {
        if self.status == RequestStatus::Ok {
            Some(&self.recv_buffer[..self.size * self.msg_len])
        } else {
            None
        }
    }

    /// Release the request and return the receive buffer.
    ///
    /// Freeing an exchange that is still in progress is a caller error.
    pub fn free(self) -> XcclResult<Vec<u8>> {
        if self.status == RequestStatus::InProgress {
            crate::xccl_error!(
                "OOB allgather freed at iteration {}/{} while still in progress",
                self.iteration,
                self.size - 1
            );
            if let Some(pair) = self.pending {
                self.transport.release(&[pair.send, pair.recv]);
            }
            return Err(XcclError::new(
                Code::Invalid,
                "OOB allgather request freed before reaching a terminal status",
            ));
        }
        Ok(self.recv_buffer)
    }
}

impl std::fmt::Debug for OobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobRequest")
            .field("range", &self.range)
            .field("local_rank", &self.local_rank)
            .field("size", &self.size)
            .field("msg_len", &self.msg_len)
            .field("iteration", &self.iteration)
            .field("pending", &self.pending)
            .field("status", &self.status)
            .finish()
    }
}

impl CollRequest for OobRequest {
    fn progress(&mut self) -> XcclResult<()> {
        self.test().map(|_| ())
    }

    fn status(&self) -> RequestStatus {
        self.status
    }

    fn free(self: Box<Self>) -> XcclResult<Vec<u8>> {
        (*self).free()
    }
}

/// OOB callback set bound to one transport
#[derive(Clone)]
pub struct RingOob {
    transport: Arc<dyn P2PTransport>,
}

impl RingOob {
    pub fn new(transport: Arc<dyn P2PTransport>) -> Self {
        Self { transport }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }
}

impl OobCollectives for RingOob {
    fn allgather(
        &self,
        sbuf: &[u8],
        rbuf: Vec<u8>,
        msg_len: usize,
        local_rank: usize,
        range: RankRange,
    ) -> XcclResult<OobRequest> {
        OobRequest::begin(
            Arc::clone(&self.transport),
            sbuf,
            rbuf,
            msg_len,
            local_rank,
            range,
        )
    }

    fn req_test(&self, req: &mut OobRequest) -> XcclResult<RequestStatus> {
        req.test()
    }

    fn req_free(&self, req: OobRequest) -> XcclResult<Vec<u8>> {
        req.free()
    }
}
