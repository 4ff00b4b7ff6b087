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

//! In-memory tagged transport shared by the ranks of one process

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{XcclError, XcclResult};
use crate::net::transport::{OpId, P2PTransport, Tag, TestStatus};

/// (source, destination, tag)
type MailboxKey = (usize, usize, Tag);

#[derive(Debug)]
enum RecvState {
    Pending,
    Delivered(Vec<u8>),
    /// The matched message could not be delivered; only this op reports it
    Failed(String),
}

#[derive(Debug)]
enum OpKind {
    /// Eager send, complete once posted
    Send,
    Recv {
        source: usize,
        tag: Tag,
        len: usize,
        state: RecvState,
    },
}

#[derive(Debug)]
struct Op {
    owner: usize,
    kind: OpKind,
}

#[derive(Debug, Default)]
struct FabricState {
    next_op: u64,
    mailboxes: HashMap<MailboxKey, VecDeque<Vec<u8>>>,
    /// Ordered by id so receives on the same key match in posting order
    ops: BTreeMap<u64, Op>,
}

impl FabricState {
    /// Match posted receives of `rank` against queued messages. A length
    /// mismatch fails the matched receive and nothing else.
    fn match_receives(&mut self, rank: usize) {
        let mailboxes = &mut self.mailboxes;
        for (id, op) in self.ops.iter_mut() {
            if op.owner != rank {
                continue;
            }
            if let OpKind::Recv {
                source,
                tag,
                len,
                state: state @ RecvState::Pending,
            } = &mut op.kind
            {
                let msg = match mailboxes
                    .get_mut(&(*source, rank, *tag))
                    .and_then(VecDeque::pop_front)
                {
                    Some(msg) => msg,
                    None => continue,
                };
                *state = if msg.len() == *len {
                    RecvState::Delivered(msg)
                } else {
                    RecvState::Failed(format!(
                        "receive op {} on rank {} expected {} bytes from rank {}, message has {}",
                        id,
                        rank,
                        len,
                        source,
                        msg.len()
                    ))
                };
            }
        }
    }
}

/// Shared message fabric for `world_size` in-process ranks
#[derive(Debug)]
pub struct LocalFabric {
    world_size: usize,
    state: Mutex<FabricState>,
}

impl LocalFabric {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            state: Mutex::new(FabricState::default()),
        })
    }

    /// Endpoint for one rank
    pub fn transport(self: &Arc<Self>, rank: usize) -> XcclResult<LocalTransport> {
        if rank >= self.world_size {
            return Err(XcclError::Invalid(format!(
                "rank {} outside a fabric of {} ranks",
                rank, self.world_size
            )));
        }
        Ok(LocalTransport {
            rank,
            fabric: Arc::clone(self),
        })
    }

    /// Endpoints for every rank, in rank order
    pub fn transports(self: &Arc<Self>) -> Vec<LocalTransport> {
        (0..self.world_size)
            .map(|rank| LocalTransport {
                rank,
                fabric: Arc::clone(self),
            })
            .collect()
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Operations posted but not yet retired
    pub fn outstanding_ops(&self) -> usize {
        self.lock().map(|s| s.ops.len()).unwrap_or(0)
    }

    /// Messages sent but not yet matched by a receive
    pub fn undelivered_messages(&self) -> usize {
        self.lock()
            .map(|s| s.mailboxes.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> XcclResult<MutexGuard<'_, FabricState>> {
        self.state
            .lock()
            .map_err(|_| XcclError::Communication("local fabric lock poisoned".into()))
    }
}

/// One rank's endpoint on a `LocalFabric`
#[derive(Debug, Clone)]
pub struct LocalTransport {
    rank: usize,
    fabric: Arc<LocalFabric>,
}

impl LocalTransport {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    fn check_peer(&self, peer: usize) -> XcclResult<()> {
        if peer >= self.fabric.world_size {
            return Err(XcclError::Communication(format!(
                "peer rank {} outside a fabric of {} ranks",
                peer, self.fabric.world_size
            )));
        }
        Ok(())
    }
}

impl P2PTransport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.fabric.world_size
    }

    fn isend(&self, data: &[u8], dest: usize, tag: Tag) -> XcclResult<OpId> {
        self.check_peer(dest)?;
        let mut state = self.fabric.lock()?;
        state
            .mailboxes
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(data.to_vec());
        let id = state.next_op;
        state.next_op += 1;
        state.ops.insert(
            id,
            Op {
                owner: self.rank,
                kind: OpKind::Send,
            },
        );
        Ok(OpId(id))
    }

    fn irecv(&self, len: usize, source: usize, tag: Tag) -> XcclResult<OpId> {
        self.check_peer(source)?;
        let mut state = self.fabric.lock()?;
        let id = state.next_op;
        state.next_op += 1;
        state.ops.insert(
            id,
            Op {
                owner: self.rank,
                kind: OpKind::Recv {
                    source,
                    tag,
                    len,
                    state: RecvState::Pending,
                },
            },
        );
        Ok(OpId(id))
    }

    fn test_all(&self, ops: &[OpId]) -> XcclResult<TestStatus> {
        let mut state = self.fabric.lock()?;
        state.match_receives(self.rank);

        let mut pending = false;
        for op in ops {
            match state.ops.get(&op.0) {
                Some(Op {
                    kind:
                        OpKind::Recv {
                            state: RecvState::Failed(reason),
                            ..
                        },
                    ..
                }) => return Err(XcclError::Communication(reason.clone())),
                Some(Op {
                    kind:
                        OpKind::Recv {
                            state: RecvState::Pending,
                            ..
                        },
                    ..
                }) => pending = true,
                Some(_) => {}
                None => {
                    return Err(XcclError::Communication(format!(
                        "rank {} tested unknown transport op {}",
                        self.rank, op.0
                    )))
                }
            }
        }
        if pending {
            return Ok(TestStatus::InProgress);
        }

        for op in ops {
            if matches!(
                state.ops.get(&op.0),
                Some(Op {
                    kind: OpKind::Send,
                    ..
                })
            ) {
                state.ops.remove(&op.0);
            }
        }
        Ok(TestStatus::Done)
    }

    fn take_received(&self, op: OpId) -> XcclResult<Vec<u8>> {
        let mut state = self.fabric.lock()?;
        match state.ops.remove(&op.0) {
            Some(Op {
                kind:
                    OpKind::Recv {
                        state: RecvState::Delivered(data),
                        ..
                    },
                ..
            }) => Ok(data),
            Some(other) => {
                let err = match &other.kind {
                    OpKind::Recv {
                        state: RecvState::Failed(reason),
                        ..
                    } => XcclError::Communication(reason.clone()),
                    _ => XcclError::Communication(format!(
                        "transport op {} has no received payload",
                        op.0
                    )),
                };
                state.ops.insert(op.0, other);
                Err(err)
            }
            None => Err(XcclError::Communication(format!(
                "rank {} took unknown transport op {}",
                self.rank, op.0
            ))),
        }
    }

    fn release(&self, ops: &[OpId]) {
        if let Ok(mut state) = self.fabric.lock() {
            for op in ops {
                state.ops.remove(&op.0);
            }
        }
    }
}
