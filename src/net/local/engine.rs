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

//! Collective engine running over a point-to-point transport
//!
//! Each rank owns one `LocalEngine`. Team formation exchanges a small
//! endpoint record through the OOB allgather it is given; collectives then
//! post direct sends and receives to every peer on a per-collective tag.
//! All ranks must start collectives on a team in the same order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Code, XcclError, XcclResult};
use crate::net::oob::{OobParams, OobRequest, RankRange};
use crate::net::request::RequestStatus;
use crate::net::transport::{OpId, P2PTransport, Tag, TestStatus};
use crate::net::xccl::engine::{
    BufferInfo, CollArgs, CollCaps, CollType, CollectiveEngine, CompletionType, ContextConfig,
    ContextHandle, ContextParams, EngineDataType, EngineOp, EngineRequest, LibHandle, LibParams,
    ReduceInfo, TeamHandle, TeamParams,
};

/// First tag used for collective payloads; collective `n` of a team uses
/// `DATA_TAG_BASE + n`
pub const DATA_TAG_BASE: Tag = 0xFFFF_FFFF_0001_0000;

const ENDPOINT_MAGIC: u32 = 0x5843_434C;
const ENDPOINT_RECORD_LEN: usize = 16;

#[derive(Debug)]
struct ContextEntry {
    lib: u64,
    completion_type: CompletionType,
    oob: OobParams,
}

#[derive(Debug)]
enum TeamPhase {
    Exchanging(OobRequest),
    Ready,
    Failed,
}

#[derive(Debug)]
struct TeamEntry {
    ctx: u64,
    /// Global ranks in team order
    members: Vec<usize>,
    /// This rank's index in `members`
    index: usize,
    oob: OobParams,
    phase: TeamPhase,
    next_seq: u64,
}

#[derive(Debug)]
enum CollPhase {
    Initialized,
    Posted {
        sends: Vec<OpId>,
        /// (member index, receive op)
        recvs: Vec<(usize, OpId)>,
    },
    Done,
    Failed,
}

#[derive(Debug)]
struct CollEntry {
    team: u64,
    members: Vec<usize>,
    index: usize,
    tag: Tag,
    args: CollArgs,
    dst: Vec<u8>,
    phase: CollPhase,
}

#[derive(Debug, Default)]
struct EngineState {
    next_id: u64,
    libs: HashMap<u64, LibParams>,
    configs: HashMap<u64, String>,
    contexts: HashMap<u64, ContextEntry>,
    teams: HashMap<u64, TeamEntry>,
    requests: HashMap<u64, CollEntry>,
}

impl EngineState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Engine objects that are still alive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub libs: usize,
    pub configs: usize,
    pub contexts: usize,
    pub teams: usize,
    pub requests: usize,
}

/// In-process collective engine for one rank
pub struct LocalEngine {
    transport: Arc<dyn P2PTransport>,
    state: Mutex<EngineState>,
}

impl LocalEngine {
    pub fn new(transport: Arc<dyn P2PTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn live_objects(&self) -> LiveObjects {
        self.lock()
            .map(|s| LiveObjects {
                libs: s.libs.len(),
                configs: s.configs.len(),
                contexts: s.contexts.len(),
                teams: s.teams.len(),
                requests: s.requests.len(),
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> XcclResult<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| XcclError::Engine("local engine state lock poisoned".into()))
    }

    fn endpoint_record(&self, ctx: u64) -> [u8; ENDPOINT_RECORD_LEN] {
        let mut record = [0u8; ENDPOINT_RECORD_LEN];
        record[0..4].copy_from_slice(&ENDPOINT_MAGIC.to_le_bytes());
        record[4..8].copy_from_slice(&(self.transport.rank() as u32).to_le_bytes());
        record[8..16].copy_from_slice(&ctx.to_le_bytes());
        record
    }
}

fn unknown(kind: &str, id: u64) -> XcclError {
    XcclError::Invalid(format!("unknown {} handle {}", kind, id))
}

/// Check the gathered endpoint records against the expected membership
fn check_endpoints(records: &[u8], members: &[usize]) -> XcclResult<()> {
    if records.len() != members.len() * ENDPOINT_RECORD_LEN {
        return Err(XcclError::Engine(format!(
            "endpoint exchange returned {} bytes for {} members",
            records.len(),
            members.len()
        )));
    }
    for (i, rec) in records.chunks_exact(ENDPOINT_RECORD_LEN).enumerate() {
        let mut word = [0u8; 4];
        word.copy_from_slice(&rec[0..4]);
        if u32::from_le_bytes(word) != ENDPOINT_MAGIC {
            return Err(XcclError::Engine(format!(
                "endpoint record {} has a bad magic",
                i
            )));
        }
        word.copy_from_slice(&rec[4..8]);
        let rank = u32::from_le_bytes(word) as usize;
        if rank != members[i] {
            return Err(XcclError::Engine(format!(
                "endpoint record {} is from rank {}, expected rank {}",
                i, rank, members[i]
            )));
        }
    }
    Ok(())
}

/// Scalar element of a reduction
trait Element: Copy {
    const WIDTH: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
    fn combine(self, other: Self, op: EngineOp) -> Self;
}

macro_rules! int_element {
    ($($ty:ty),*) => {$(
        impl Element for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }

            fn combine(self, other: Self, op: EngineOp) -> Self {
                match op {
                    EngineOp::Sum => self.wrapping_add(other),
                    EngineOp::Prod => self.wrapping_mul(other),
                    EngineOp::Min => self.min(other),
                    EngineOp::Max => self.max(other),
                }
            }
        }
    )*};
}

macro_rules! float_element {
    ($($ty:ty),*) => {$(
        impl Element for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }

            fn combine(self, other: Self, op: EngineOp) -> Self {
                match op {
                    EngineOp::Sum => self + other,
                    EngineOp::Prod => self * other,
                    EngineOp::Min => self.min(other),
                    EngineOp::Max => self.max(other),
                }
            }
        }
    )*};
}

int_element!(u8, i8, i32, i64);
float_element!(f32, f64);

fn fold<T: Element>(acc: &mut [u8], other: &[u8], op: EngineOp) {
    for (a, b) in acc.chunks_exact_mut(T::WIDTH).zip(other.chunks_exact(T::WIDTH)) {
        T::read(a).combine(T::read(b), op).write(a);
    }
}

fn reduce_into(acc: &mut [u8], other: &[u8], info: &ReduceInfo) -> XcclResult<()> {
    match info.dt {
        EngineDataType::Uint8 => fold::<u8>(acc, other, info.op),
        EngineDataType::Int8 => fold::<i8>(acc, other, info.op),
        EngineDataType::Int32 => fold::<i32>(acc, other, info.op),
        EngineDataType::Int64 => fold::<i64>(acc, other, info.op),
        EngineDataType::Float32 => fold::<f32>(acc, other, info.op),
        EngineDataType::Float64 => fold::<f64>(acc, other, info.op),
        EngineDataType::Float16 => {
            return Err(XcclError::Unsupported(
                "float16 reductions are not supported by the local engine".into(),
            ))
        }
    }
    Ok(())
}

fn byte_range(offset: u32, count: u32, width: usize) -> Option<std::ops::Range<usize>> {
    let start = (offset as usize).checked_mul(width)?;
    let end = (count as usize).checked_mul(width)?.checked_add(start)?;
    Some(start..end)
}

fn block_overflow(peer: usize) -> XcclError {
    XcclError::Invalid(format!("block {} overflows the address space", peer))
}

/// Bytes this rank sends to member `peer`
fn send_slice(args: &CollArgs, peer: usize) -> XcclResult<&[u8]> {
    let info: &BufferInfo = &args.buffer_info;
    let range = match args.coll_type {
        CollType::AllToAll => peer * info.len..(peer + 1) * info.len,
        CollType::AllReduce => 0..info.len,
        CollType::AllToAllV => {
            let width = info.src_datatype.map(|d| d.size()).unwrap_or(1);
            byte_range(info.src_displacements[peer], info.src_counts[peer], width)
                .ok_or_else(|| block_overflow(peer))?
        }
    };
    info.src_buffer.get(range.clone()).ok_or_else(|| {
        XcclError::Invalid(format!(
            "send range {:?} outside a {} byte source buffer",
            range,
            info.src_buffer.len()
        ))
    })
}

/// Where the bytes received from member `peer` land in the destination
fn recv_range(args: &CollArgs, peer: usize) -> XcclResult<std::ops::Range<usize>> {
    let info = &args.buffer_info;
    match args.coll_type {
        CollType::AllToAll => Ok(peer * info.len..(peer + 1) * info.len),
        CollType::AllReduce => Ok(0..info.len),
        CollType::AllToAllV => {
            let width = info.dst_datatype.map(|d| d.size()).unwrap_or(1);
            byte_range(info.dst_displacements[peer], info.dst_counts[peer], width)
                .ok_or_else(|| block_overflow(peer))
        }
    }
}

fn required_cap(coll_type: CollType) -> CollCaps {
    match coll_type {
        CollType::AllToAll => CollCaps::ALLTOALL,
        CollType::AllToAllV => CollCaps::ALLTOALLV,
        CollType::AllReduce => CollCaps::ALLREDUCE,
    }
}

impl CollEntry {
    fn post(&mut self, transport: &dyn P2PTransport) -> XcclResult<()> {
        let mut sends = Vec::with_capacity(self.members.len());
        let mut recvs = Vec::with_capacity(self.members.len());

        let own = send_slice(&self.args, self.index)?.to_vec();
        let own_range = recv_range(&self.args, self.index)?;
        if own.len() != own_range.len() {
            return Err(XcclError::Invalid(format!(
                "rank sends {} bytes to itself but expects {}",
                own.len(),
                own_range.len()
            )));
        }
        if self.args.coll_type != CollType::AllReduce {
            self.dst[own_range].copy_from_slice(&own);
        }

        let posted = (|| -> XcclResult<()> {
            for (peer, &global) in self.members.iter().enumerate() {
                if peer == self.index {
                    continue;
                }
                let data = send_slice(&self.args, peer)?;
                sends.push(transport.isend(data, global, self.tag)?);
                let len = recv_range(&self.args, peer)?.len();
                recvs.push((peer, transport.irecv(len, global, self.tag)?));
            }
            Ok(())
        })();

        if let Err(e) = posted {
            let ops: Vec<OpId> = sends
                .iter()
                .copied()
                .chain(recvs.iter().map(|(_, op)| *op))
                .collect();
            transport.release(&ops);
            return Err(e);
        }

        self.phase = CollPhase::Posted { sends, recvs };
        Ok(())
    }

    fn complete(
        &mut self,
        transport: &dyn P2PTransport,
        recvs: &[(usize, OpId)],
    ) -> XcclResult<()> {
        let mut received = Vec::with_capacity(recvs.len());
        for &(peer, op) in recvs {
            received.push((peer, transport.take_received(op)?));
        }

        match (self.args.coll_type, self.args.reduce_info) {
            (CollType::AllReduce, Some(info)) => {
                // Fold contributions in member order so every rank computes
                // the same result
                let own = send_slice(&self.args, self.index)?.to_vec();
                received.push((self.index, own));
                received.sort_by_key(|(peer, _)| *peer);
                let mut contributions = received.into_iter().map(|(_, data)| data);
                let mut acc = contributions.next().unwrap_or_default();
                for other in contributions {
                    reduce_into(&mut acc, &other, &info)?;
                }
                self.dst[..acc.len()].copy_from_slice(&acc);
            }
            (CollType::AllReduce, None) => {
                return Err(XcclError::Invalid("all-reduce without reduce info".into()))
            }
            _ => {
                for (peer, data) in received {
                    let range = recv_range(&self.args, peer)?;
                    self.dst[range].copy_from_slice(&data);
                }
            }
        }
        Ok(())
    }
}

impl CollectiveEngine for LocalEngine {
    fn lib_init(&self, params: &LibParams) -> XcclResult<LibHandle> {
        let mut state = self.lock()?;
        let id = state.next_id();
        state.libs.insert(id, *params);
        crate::xccl_trace!("rank {}: lib {} initialized", self.transport.rank(), id);
        Ok(LibHandle::new(id))
    }

    fn lib_cleanup(&self, lib: LibHandle) -> XcclResult<()> {
        let mut state = self.lock()?;
        if state.contexts.values().any(|c| c.lib == lib.id()) {
            return Err(XcclError::Invalid(format!(
                "lib {} still has live contexts",
                lib.id()
            )));
        }
        state
            .libs
            .remove(&lib.id())
            .map(|_| ())
            .ok_or_else(|| unknown("lib", lib.id()))
    }

    fn context_config_read(&self, lib: &LibHandle, prefix: &str) -> XcclResult<ContextConfig> {
        let mut state = self.lock()?;
        if !state.libs.contains_key(&lib.id()) {
            return Err(unknown("lib", lib.id()));
        }
        let id = state.next_id();
        state.configs.insert(id, prefix.to_string());
        Ok(ContextConfig::new(id))
    }

    fn context_config_release(&self, config: ContextConfig) {
        if let Ok(mut state) = self.lock() {
            state.configs.remove(&config.id());
        }
    }

    fn context_create(
        &self,
        lib: &LibHandle,
        params: ContextParams,
        config: &ContextConfig,
    ) -> XcclResult<ContextHandle> {
        let mut state = self.lock()?;
        if !state.libs.contains_key(&lib.id()) {
            return Err(unknown("lib", lib.id()));
        }
        if !state.configs.contains_key(&config.id()) {
            return Err(unknown("context config", config.id()));
        }
        if params.oob.rank != self.transport.rank()
            || params.oob.size != self.transport.world_size()
        {
            return Err(XcclError::Invalid(format!(
                "OOB identity {}/{} does not match transport {}/{}",
                params.oob.rank,
                params.oob.size,
                self.transport.rank(),
                self.transport.world_size()
            )));
        }

        let id = state.next_id();
        state.contexts.insert(
            id,
            ContextEntry {
                lib: lib.id(),
                completion_type: params.completion_type,
                oob: params.oob,
            },
        );
        Ok(ContextHandle::new(id))
    }

    fn context_destroy(&self, ctx: ContextHandle) -> XcclResult<()> {
        let mut state = self.lock()?;
        if state.teams.values().any(|t| t.ctx == ctx.id()) {
            return Err(XcclError::Invalid(format!(
                "context {} still has live teams",
                ctx.id()
            )));
        }
        state
            .contexts
            .remove(&ctx.id())
            .map(|_| ())
            .ok_or_else(|| unknown("context", ctx.id()))
    }

    fn team_create_post(&self, ctx: &ContextHandle, params: TeamParams) -> XcclResult<TeamHandle> {
        let mut state = self.lock()?;
        let context = state
            .contexts
            .get(&ctx.id())
            .ok_or_else(|| unknown("context", ctx.id()))?;
        if params.oob.rank != context.oob.rank || params.oob.size != context.oob.size {
            return Err(XcclError::Invalid(
                "team OOB identity differs from its context".into(),
            ));
        }

        let world_size = self.transport.world_size();
        params.range.validate(world_size)?;
        let members: Vec<usize> = (0..params.range.participants(world_size))
            .map(|i| params.range.to_global(i))
            .collect::<Option<_>>()
            .ok_or_else(|| XcclError::Invalid("team range has untranslatable members".into()))?;
        let index = members
            .iter()
            .position(|&r| r == self.transport.rank())
            .ok_or_else(|| {
                XcclError::Invalid(format!(
                    "rank {} is not a member of the requested team",
                    self.transport.rank()
                ))
            })?;

        let range = match &params.range {
            RankRange::Undefined => RankRange::full(world_size),
            other => other.clone(),
        };
        let record = self.endpoint_record(ctx.id());
        let rbuf = vec![0u8; members.len() * ENDPOINT_RECORD_LEN];
        let exchange =
            params
                .oob
                .ops
                .allgather(&record, rbuf, ENDPOINT_RECORD_LEN, index, range)?;

        crate::xccl_debug!(
            "rank {}: team of {} posted on context {} ({:?} completion)",
            self.transport.rank(),
            members.len(),
            ctx.id(),
            context.completion_type
        );

        let id = state.next_id();
        state.teams.insert(
            id,
            TeamEntry {
                ctx: ctx.id(),
                members,
                index,
                oob: params.oob,
                phase: TeamPhase::Exchanging(exchange),
                next_seq: 0,
            },
        );
        Ok(TeamHandle::new(id))
    }

    fn team_create_test(&self, team: &TeamHandle) -> XcclResult<RequestStatus> {
        let mut state = self.lock()?;
        let entry = state
            .teams
            .get_mut(&team.id())
            .ok_or_else(|| unknown("team", team.id()))?;

        let mut exchange = match std::mem::replace(&mut entry.phase, TeamPhase::Failed) {
            TeamPhase::Exchanging(req) => req,
            TeamPhase::Ready => {
                entry.phase = TeamPhase::Ready;
                return Ok(RequestStatus::Ok);
            }
            TeamPhase::Failed => return Ok(RequestStatus::Error),
        };

        let ops = Arc::clone(&entry.oob.ops);
        match ops.req_test(&mut exchange) {
            Ok(RequestStatus::InProgress) => {
                entry.phase = TeamPhase::Exchanging(exchange);
                Ok(RequestStatus::InProgress)
            }
            Ok(RequestStatus::Ok) => {
                let checked = ops
                    .req_free(exchange)
                    .and_then(|records| check_endpoints(&records, &entry.members));
                match checked {
                    Ok(()) => {
                        entry.phase = TeamPhase::Ready;
                        Ok(RequestStatus::Ok)
                    }
                    Err(e) => {
                        crate::xccl_error!("team {} endpoint exchange invalid: {}", team.id(), e);
                        Ok(RequestStatus::Error)
                    }
                }
            }
            Ok(RequestStatus::Error) | Err(_) => {
                if let Some(e) = exchange.error() {
                    crate::xccl_error!("team {} endpoint exchange failed: {}", team.id(), e);
                }
                if let Err(e) = ops.req_free(exchange) {
                    crate::xccl_warn!("releasing failed exchange: {}", e);
                }
                Ok(RequestStatus::Error)
            }
        }
    }

    fn team_destroy(&self, team: TeamHandle) -> XcclResult<()> {
        let mut state = self.lock()?;
        let entry = state
            .teams
            .remove(&team.id())
            .ok_or_else(|| unknown("team", team.id()))?;
        if let TeamPhase::Exchanging(exchange) = entry.phase {
            // Abandoned mid-exchange; the request still owns transport ops
            if let Err(e) = entry.oob.ops.req_free(exchange) {
                crate::xccl_debug!("team {} destroyed during exchange: {}", team.id(), e);
            }
        }
        let orphans: Vec<u64> = state
            .requests
            .iter()
            .filter(|(_, r)| r.team == team.id())
            .map(|(id, _)| *id)
            .collect();
        for id in orphans {
            if let Some(CollEntry {
                phase: CollPhase::Posted { sends, recvs },
                ..
            }) = state.requests.remove(&id)
            {
                let ops: Vec<OpId> = sends
                    .into_iter()
                    .chain(recvs.into_iter().map(|(_, op)| op))
                    .collect();
                self.transport.release(&ops);
            }
        }
        Ok(())
    }

    fn collective_init(&self, args: CollArgs, team: &TeamHandle) -> XcclResult<EngineRequest> {
        let mut state = self.lock()?;
        let team_entry = state
            .teams
            .get(&team.id())
            .ok_or_else(|| unknown("team", team.id()))?;
        if !matches!(team_entry.phase, TeamPhase::Ready) {
            return Err(XcclError::Invalid(format!("team {} is not ready", team.id())));
        }

        let lib_caps = state
            .contexts
            .get(&team_entry.ctx)
            .and_then(|c| state.libs.get(&c.lib))
            .map(|l| l.coll_types)
            .ok_or_else(|| XcclError::Engine("team outlived its library".into()))?;
        if !lib_caps.contains(required_cap(args.coll_type)) {
            return Err(XcclError::new(
                Code::CapabilityError,
                format!("{:?} was not requested at lib init", args.coll_type),
            ));
        }

        let members = team_entry.members.len();
        let info = &args.buffer_info;
        match (args.coll_type, &args.reduce_info) {
            (CollType::AllReduce, Some(reduce)) => {
                if reduce.dt == EngineDataType::Float16 {
                    return Err(XcclError::Unsupported(
                        "float16 reductions are not supported by the local engine".into(),
                    ));
                }
                let expected = reduce.count.checked_mul(reduce.dt.size());
                if expected != Some(info.len)
                    || info.src_buffer.len() < info.len
                    || info.dst_len < info.len
                {
                    return Err(XcclError::Invalid(format!(
                        "all-reduce of {} x {:?} does not match {} bytes",
                        reduce.count, reduce.dt, info.len
                    )));
                }
            }
            (CollType::AllReduce, None) => {
                return Err(XcclError::Invalid("all-reduce without reduce info".into()))
            }
            (CollType::AllToAll, _) => {
                let total = info.len.checked_mul(members).ok_or_else(|| {
                    XcclError::Invalid(format!(
                        "{} members x {} bytes overflows the address space",
                        members, info.len
                    ))
                })?;
                if info.src_buffer.len() < total || info.dst_len < total {
                    return Err(XcclError::Invalid(format!(
                        "all-to-all buffers hold {} and {} bytes, {} required",
                        info.src_buffer.len(),
                        info.dst_len,
                        total
                    )));
                }
            }
            (CollType::AllToAllV, _) => {
                for v in [
                    &info.src_counts,
                    &info.src_displacements,
                    &info.dst_counts,
                    &info.dst_displacements,
                ] {
                    if v.len() != members {
                        return Err(XcclError::Invalid(format!(
                            "all-to-all-v needs {} counts and displacements per side",
                            members
                        )));
                    }
                }
                let width = info.dst_datatype.map(|d| d.size()).unwrap_or(1);
                for peer in 0..members {
                    let end =
                        byte_range(info.dst_displacements[peer], info.dst_counts[peer], width)
                            .ok_or_else(|| block_overflow(peer))?
                            .end;
                    if end > info.dst_len {
                        return Err(XcclError::Invalid(format!(
                            "receive block {} ends at byte {}, destination holds {}",
                            peer, end, info.dst_len
                        )));
                    }
                }
            }
        }

        let (members, index, team_id) = (team_entry.members.clone(), team_entry.index, team.id());
        let seq = match state.teams.get_mut(&team_id) {
            Some(t) => {
                let seq = t.next_seq;
                t.next_seq += 1;
                seq
            }
            None => return Err(unknown("team", team_id)),
        };

        let id = state.next_id();
        let dst = vec![0u8; args.buffer_info.dst_len];
        state.requests.insert(
            id,
            CollEntry {
                team: team_id,
                members,
                index,
                tag: DATA_TAG_BASE + seq,
                args,
                dst,
                phase: CollPhase::Initialized,
            },
        );
        Ok(EngineRequest::new(id))
    }

    fn collective_post(&self, req: &EngineRequest) -> XcclResult<()> {
        let mut state = self.lock()?;
        let entry = state
            .requests
            .get_mut(&req.id())
            .ok_or_else(|| unknown("collective", req.id()))?;
        if !matches!(entry.phase, CollPhase::Initialized) {
            return Err(XcclError::Invalid(format!(
                "collective {} posted twice",
                req.id()
            )));
        }
        entry.post(self.transport.as_ref())
    }

    fn collective_test(&self, req: &EngineRequest) -> XcclResult<RequestStatus> {
        let mut state = self.lock()?;
        let entry = state
            .requests
            .get_mut(&req.id())
            .ok_or_else(|| unknown("collective", req.id()))?;

        let (sends, recvs) = match &entry.phase {
            CollPhase::Initialized => {
                return Err(XcclError::Invalid(format!(
                    "collective {} tested before post",
                    req.id()
                )))
            }
            CollPhase::Done => return Ok(RequestStatus::Ok),
            CollPhase::Failed => return Ok(RequestStatus::Error),
            CollPhase::Posted { sends, recvs } => (sends.clone(), recvs.clone()),
        };

        let ops: Vec<OpId> = sends
            .iter()
            .copied()
            .chain(recvs.iter().map(|(_, op)| *op))
            .collect();
        let transport = self.transport.as_ref();
        let outcome = transport.test_all(&ops).and_then(|status| match status {
            TestStatus::InProgress => Ok(RequestStatus::InProgress),
            TestStatus::Done => entry.complete(transport, &recvs).map(|_| RequestStatus::Ok),
        });

        match outcome {
            Ok(RequestStatus::InProgress) => Ok(RequestStatus::InProgress),
            Ok(_) => {
                entry.phase = CollPhase::Done;
                Ok(RequestStatus::Ok)
            }
            Err(e) => {
                crate::xccl_error!(
                    "rank {}: collective {} failed: {}",
                    transport.rank(),
                    req.id(),
                    e
                );
                transport.release(&ops);
                entry.phase = CollPhase::Failed;
                Ok(RequestStatus::Error)
            }
        }
    }

    fn collective_finalize(&self, req: EngineRequest) -> XcclResult<Vec<u8>> {
        let mut state = self.lock()?;
        let entry = state
            .requests
            .remove(&req.id())
            .ok_or_else(|| unknown("collective", req.id()))?;
        match entry.phase {
            CollPhase::Posted { sends, recvs } => {
                let ops: Vec<OpId> = sends
                    .into_iter()
                    .chain(recvs.into_iter().map(|(_, op)| op))
                    .collect();
                self.transport.release(&ops);
                Ok(Vec::new())
            }
            CollPhase::Done => Ok(entry.dst),
            CollPhase::Initialized | CollPhase::Failed => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("rank", &self.transport.rank())
            .field("live", &self.live_objects())
            .finish()
    }
}
