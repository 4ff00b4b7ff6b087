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

//! Point-to-point transport interface
//!
//! The bootstrap layer only needs tagged non-blocking send/receive and a
//! batch completion test. Sends are eager: the payload is copied when the
//! operation is posted, so the caller's buffer is free as soon as `isend`
//! returns. Received payloads are collected with `take_received` once
//! `test_all` has reported the operation done.

use crate::error::XcclResult;

/// Message tag used for matching sends to receives
pub type Tag = u64;

/// Ticket for one outstanding transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

/// Result of a non-blocking completion test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    InProgress,
    Done,
}

/// Tagged point-to-point transport
pub trait P2PTransport: Send + Sync {
    /// Global rank of the calling process
    fn rank(&self) -> usize;

    /// Number of ranks known to the transport
    fn world_size(&self) -> usize;

    /// Post a non-blocking send of `data` to `dest`
    fn isend(&self, data: &[u8], dest: usize, tag: Tag) -> XcclResult<OpId>;

    /// Post a non-blocking receive of exactly `len` bytes from `source`
    fn irecv(&self, len: usize, source: usize, tag: Tag) -> XcclResult<OpId>;

    /// Advance the transport and report whether every op in `ops` is done.
    ///
    /// Never blocks. Completed sends are retired by this call; completed
    /// receives stay until their payload is taken.
    fn test_all(&self, ops: &[OpId]) -> XcclResult<TestStatus>;

    /// Take the payload of a completed receive, retiring the operation
    fn take_received(&self, op: OpId) -> XcclResult<Vec<u8>>;

    /// Drop bookkeeping for operations that will never be tested again
    fn release(&self, ops: &[OpId]);
}
