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

//! Out-of-band (OOB) exchange used while a team is being formed
//!
//! The collective engine cannot talk to its peers before it has a team, so
//! it asks the host for an allgather over whatever point-to-point transport
//! already exists. This module defines the three-call interface the engine
//! sees (`OobCollectives`) and the rank-range descriptor it passes in.

pub mod ring;

pub use ring::{OobRequest, RingOob};

use std::sync::Arc;

use crate::error::{XcclError, XcclResult};
use crate::net::request::RequestStatus;
use crate::net::transport::Tag;

/// Reserved tag for bootstrap exchanges.
///
/// Only one OOB exchange may be in flight per communicator.
pub const OOB_TAG: Tag = 0xFFFF_FFFF_0000_0001;

/// Which ranks take part in an exchange and how local indices map to
/// global ranks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankRange {
    /// Every rank of the transport; local rank and size come from the transport
    Undefined,
    /// `count` ranks, local index `i` maps to `start + i * stride`
    Strided {
        start: usize,
        stride: usize,
        count: usize,
    },
    /// Explicit local-to-global table
    Map(Vec<usize>),
}

impl RankRange {
    /// Strided range covering ranks `0..world_size`
    pub fn full(world_size: usize) -> Self {
        RankRange::Strided {
            start: 0,
            stride: 1,
            count: world_size,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, RankRange::Undefined)
    }

    /// Number of participants, falling back to the transport size for
    /// `Undefined`
    pub fn participants(&self, world_size: usize) -> usize {
        match self {
            RankRange::Undefined => world_size,
            RankRange::Strided { count, .. } => *count,
            RankRange::Map(ranks) => ranks.len(),
        }
    }

    /// Translate a local index into a global rank; `None` when the index
    /// is not representable by the range
    pub fn to_global(&self, local: usize) -> Option<usize> {
        match self {
            RankRange::Undefined => Some(local),
            RankRange::Strided { start, stride, .. } => {
                local.checked_mul(*stride)?.checked_add(*start)
            }
            RankRange::Map(ranks) => ranks.get(local).copied(),
        }
    }

    /// Check that every translated rank exists on a transport of
    /// `world_size` ranks and that no rank appears twice
    pub fn validate(&self, world_size: usize) -> XcclResult<()> {
        let count = self.participants(world_size);
        if count == 0 {
            return Err(XcclError::Invalid("rank range has no participants".into()));
        }
        match self {
            RankRange::Undefined => Ok(()),
            RankRange::Strided { stride, .. } => {
                if *stride == 0 && count > 1 {
                    return Err(XcclError::Invalid("strided rank range with stride 0".into()));
                }
                let last = self.to_global(count - 1).ok_or_else(|| {
                    XcclError::Invalid(format!(
                        "strided rank range of {} participants overflows the rank space",
                        count
                    ))
                })?;
                if last >= world_size {
                    return Err(XcclError::Invalid(format!(
                        "rank range reaches rank {} but the transport has {} ranks",
                        last, world_size
                    )));
                }
                Ok(())
            }
            RankRange::Map(ranks) => {
                let mut seen = vec![false; world_size];
                for &r in ranks {
                    if r >= world_size {
                        return Err(XcclError::Invalid(format!(
                            "rank {} is not known to a transport of {} ranks",
                            r, world_size
                        )));
                    }
                    if seen[r] {
                        return Err(XcclError::Invalid(format!("rank {} listed twice", r)));
                    }
                    seen[r] = true;
                }
                Ok(())
            }
        }
    }
}

/// The allgather callback set handed to the collective engine at context
/// and team creation time
pub trait OobCollectives: Send + Sync {
    /// Start an allgather of `msg_len` bytes per participant.
    ///
    /// `rbuf` must hold `participants * msg_len` bytes; it is returned by
    /// `req_free` once the exchange has finished.
    fn allgather(
        &self,
        sbuf: &[u8],
        rbuf: Vec<u8>,
        msg_len: usize,
        local_rank: usize,
        range: RankRange,
    ) -> XcclResult<OobRequest>;

    /// Advance the exchange and report its status
    fn req_test(&self, req: &mut OobRequest) -> XcclResult<RequestStatus>;

    /// Release a finished exchange and hand back the receive buffer
    fn req_free(&self, req: OobRequest) -> XcclResult<Vec<u8>>;
}

/// OOB binding passed to the engine: the callback set plus the identity of
/// the calling rank
#[derive(Clone)]
pub struct OobParams {
    pub ops: Arc<dyn OobCollectives>,
    pub rank: usize,
    pub size: usize,
}

impl std::fmt::Debug for OobParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobParams")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}
