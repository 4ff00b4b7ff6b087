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

//! Asynchronous request lifecycle
//!
//! Every asynchronous operation (OOB allgather, data-path collectives) is
//! started by its own `begin` constructor and then driven through the same
//! three calls: `progress`, `status` and `free`. `WorkList` relies on
//! nothing else, so bootstrap exchanges and data collectives can share one
//! polling loop.

use crate::error::{Code, XcclError, XcclResult};

/// Status of an asynchronous request.
///
/// Moves only from `InProgress` to `Ok` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    InProgress,
    Ok,
    Error,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::InProgress)
    }
}

/// Uniform contract of an in-flight asynchronous operation
pub trait CollRequest: Send {
    /// Do at most one unit of work. A no-op once the request is terminal.
    fn progress(&mut self) -> XcclResult<()>;

    /// Current status; never advances the operation
    fn status(&self) -> RequestStatus;

    /// Release the request and return its output buffer.
    ///
    /// Must only be called once `status()` is terminal.
    fn free(self: Box<Self>) -> XcclResult<Vec<u8>>;
}

/// Identifier handed out by `WorkList::push`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// A request that reached a terminal status and was freed
#[derive(Debug)]
pub struct Completion {
    pub id: RequestId,
    pub status: RequestStatus,
    pub output: XcclResult<Vec<u8>>,
}

/// Cooperative driver for any mix of requests
#[derive(Default)]
pub struct WorkList {
    entries: Vec<(RequestId, Box<dyn CollRequest>)>,
    next_id: u64,
}

impl WorkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, req: Box<dyn CollRequest>) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, req));
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Progress every request once, then free and return those that are
    /// terminal
    pub fn poll(&mut self) -> Vec<Completion> {
        for (id, req) in self.entries.iter_mut() {
            if let Err(e) = req.progress() {
                crate::xccl_warn!("request {:?} failed while progressing: {}", id, e);
            }
        }

        let mut done = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].1.status().is_terminal() {
                let (id, req) = self.entries.swap_remove(i);
                let status = req.status();
                done.push(Completion {
                    id,
                    status,
                    output: req.free(),
                });
            } else {
                i += 1;
            }
        }
        done.sort_by_key(|c| c.id);
        done
    }

    /// Poll until every request is terminal.
    ///
    /// With `max_polls` set, gives up after that many rounds; requests that
    /// are still running stay in the list.
    pub fn drive_until_empty(&mut self, max_polls: Option<usize>) -> XcclResult<Vec<Completion>> {
        let mut completed = Vec::new();
        let mut rounds = 0usize;
        while !self.entries.is_empty() {
            if let Some(max) = max_polls {
                if rounds >= max {
                    return Err(XcclError::new(
                        Code::ExecutionError,
                        format!(
                            "{} request(s) still in progress after {} polls",
                            self.entries.len(),
                            rounds
                        ),
                    ));
                }
            }
            completed.extend(self.poll());
            rounds += 1;
        }
        completed.sort_by_key(|c| c.id);
        Ok(completed)
    }
}
