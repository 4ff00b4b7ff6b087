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

//! Data-path collective tests on the local engine

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cylon_xccl::data_types::Type;
use cylon_xccl::error::{Code, XcclResult};
use cylon_xccl::net::comm_operations::ReduceOp;
use cylon_xccl::net::local::{LocalEngine, LocalFabric};
use cylon_xccl::net::oob::{OobRequest, RankRange};
use cylon_xccl::net::request::{CollRequest, RequestStatus, WorkList};
use cylon_xccl::net::transport::{OpId, P2PTransport, Tag, TestStatus};
use cylon_xccl::net::xccl::engine::CollCaps;
use cylon_xccl::net::xccl::{AllToAllVArgs, CollOps, XcclCollOps, XcclCommunicator, XcclConfig};
use cylon_xccl::net::Communicator;

/// Counts every operation posted through it
struct CountingTransport {
    inner: Arc<dyn P2PTransport>,
    posted: AtomicUsize,
}

impl CountingTransport {
    fn new(inner: Arc<dyn P2PTransport>) -> Self {
        Self {
            inner,
            posted: AtomicUsize::new(0),
        }
    }

    fn posted(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }
}

impl P2PTransport for CountingTransport {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn isend(&self, data: &[u8], dest: usize, tag: Tag) -> XcclResult<OpId> {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.inner.isend(data, dest, tag)
    }

    fn irecv(&self, len: usize, source: usize, tag: Tag) -> XcclResult<OpId> {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.inner.irecv(len, source, tag)
    }

    fn test_all(&self, ops: &[OpId]) -> XcclResult<TestStatus> {
        self.inner.test_all(ops)
    }

    fn take_received(&self, op: OpId) -> XcclResult<Vec<u8>> {
        self.inner.take_received(op)
    }

    fn release(&self, ops: &[OpId]) {
        self.inner.release(ops)
    }
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn open_local(
    transport: Arc<dyn P2PTransport>,
    config: XcclConfig,
) -> (XcclCommunicator, Arc<LocalEngine>) {
    let engine = Arc::new(LocalEngine::new(transport.clone()));
    let comm = XcclCommunicator::open(engine.clone(), transport, config).unwrap();
    (comm, engine)
}

#[test]
fn test_collectives_on_four_ranks() {
    let world = 4;
    let fabric = LocalFabric::new(world);

    std::thread::scope(|scope| {
        for t in fabric.transports() {
            scope.spawn(move || {
                let me = t.rank();
                let (comm, engine) = open_local(Arc::new(t), XcclConfig::default());
                let mut work = WorkList::new();

                // all-reduce: sum of [r, 2r, -1] over four ranks
                let sum = comm
                    .begin_all_reduce(
                        i32_bytes(&[me as i32, 2 * me as i32, -1]),
                        3,
                        Type::Int32,
                        ReduceOp::Sum,
                    )
                    .unwrap();
                let sum_id = work.push(Box::new(sum));

                let max = comm
                    .begin_all_reduce(
                        (me as f64 * 1.5).to_le_bytes().to_vec(),
                        1,
                        Type::Double,
                        ReduceOp::Max,
                    )
                    .unwrap();
                let max_id = work.push(Box::new(max));

                // all-to-all: block for peer p is [10 * me + p; 2]
                let send: Vec<u8> = (0..world).flat_map(|p| vec![(10 * me + p) as u8; 2]).collect();
                let a2a_id = work.push(Box::new(comm.begin_all_to_all(send, 2).unwrap()));

                // all-to-all-v: peer p gets p + 1 elements of value 100 * me + p
                let mut send = Vec::new();
                let mut send_counts = Vec::new();
                let mut send_offsets = Vec::new();
                for p in 0..world {
                    send_offsets.push((send.len() / 4) as u32);
                    send_counts.push(p as u32 + 1);
                    send.extend(i32_bytes(&vec![(100 * me + p) as i32; p + 1]));
                }
                let recv_counts = vec![me as u32 + 1; world];
                let recv_offsets: Vec<u32> = (0..world).map(|j| (j * (me + 1)) as u32).collect();
                let a2av = comm
                    .begin_all_to_all_v(AllToAllVArgs {
                        send,
                        send_type: Type::Int32,
                        send_counts,
                        send_offsets,
                        recv_type: Type::Int32,
                        recv_counts,
                        recv_offsets,
                    })
                    .unwrap();
                let a2av_id = work.push(Box::new(a2av));

                let done = work.drive_until_empty(None).unwrap();
                assert_eq!(done.len(), 4);
                for completion in done {
                    assert_eq!(completion.status, RequestStatus::Ok);
                    let out = completion.output.unwrap();
                    if completion.id == sum_id {
                        assert_eq!(bytes_i32(&out), vec![6, 12, -4]);
                    } else if completion.id == max_id {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&out);
                        assert_eq!(f64::from_le_bytes(raw), 4.5);
                    } else if completion.id == a2a_id {
                        let expected: Vec<u8> =
                            (0..world).flat_map(|j| vec![(10 * j + me) as u8; 2]).collect();
                        assert_eq!(out, expected);
                    } else if completion.id == a2av_id {
                        let expected: Vec<i32> = (0..world)
                            .flat_map(|j| vec![(100 * j + me) as i32; me + 1])
                            .collect();
                        assert_eq!(bytes_i32(&out), expected);
                    } else {
                        panic!("unexpected completion {:?}", completion.id);
                    }
                }

                assert_eq!(engine.live_objects().requests, 0);
                comm.close().unwrap();
            });
        }
    });

    assert_eq!(fabric.outstanding_ops(), 0);
    assert_eq!(fabric.undelivered_messages(), 0);
}

#[test]
fn test_unsupported_operator_fails_without_transport_activity() {
    let fabric = LocalFabric::new(1);
    let counting = Arc::new(CountingTransport::new(Arc::new(fabric.transport(0).unwrap())));
    let (comm, engine) = open_local(counting.clone(), XcclConfig::default());
    let posted = counting.posted();

    let mut req = comm
        .begin_all_reduce(i32_bytes(&[1, 2]), 2, Type::Int32, ReduceOp::Avg)
        .unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::Unsupported);
    req.progress().unwrap();
    assert_eq!(req.status(), RequestStatus::Error);

    let req_type = comm
        .begin_all_reduce(vec![0; 4], 2, Type::UInt16, ReduceOp::Sum)
        .unwrap();
    assert_eq!(req_type.error().unwrap().code(), Code::Unsupported);

    assert_eq!(counting.posted(), posted);
    assert_eq!(engine.live_objects().requests, 0);
    assert!(Box::new(req).free().unwrap().is_empty());
}

#[test]
fn test_half_float_reduction_rejected_by_engine() {
    let fabric = LocalFabric::new(1);
    let (comm, engine) = open_local(
        Arc::new(fabric.transport(0).unwrap()),
        XcclConfig::default(),
    );

    let req = comm
        .begin_all_reduce(vec![0; 4], 2, Type::HalfFloat, ReduceOp::Sum)
        .unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::Unsupported);
    assert_eq!(engine.live_objects().requests, 0);
}

#[test]
fn test_capability_not_requested() {
    let fabric = LocalFabric::new(1);
    let config = XcclConfig::default().coll_types(CollCaps::ALLREDUCE);
    let (comm, _engine) = open_local(Arc::new(fabric.transport(0).unwrap()), config);

    let req = comm.begin_all_to_all(vec![1, 2], 2).unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::CapabilityError);
}

#[test]
fn test_inconsistent_alltoallv_counts() {
    let fabric = LocalFabric::new(1);
    let (comm, _engine) = open_local(
        Arc::new(fabric.transport(0).unwrap()),
        XcclConfig::default(),
    );

    let req = comm
        .begin_all_to_all_v(AllToAllVArgs {
            send: vec![0; 8],
            send_type: Type::Int32,
            send_counts: vec![2, 0],
            send_offsets: vec![0],
            recv_type: Type::Int32,
            recv_counts: vec![2],
            recv_offsets: vec![0],
        })
        .unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::Invalid);
}

#[test]
fn test_oversized_sizes_fail_at_begin() {
    let fabric = LocalFabric::new(2);
    let t0: Arc<dyn P2PTransport> = Arc::new(fabric.transport(0).unwrap());
    let t1: Arc<dyn P2PTransport> = Arc::new(fabric.transport(1).unwrap());

    let ((comm0, engine0), comm1) = std::thread::scope(|scope| {
        let h0 = scope.spawn(|| open_local(t0, XcclConfig::default()));
        let h1 = scope.spawn(|| open_local(t1, XcclConfig::default()));
        (h0.join().unwrap(), h1.join().unwrap())
    });
    let posted = fabric.outstanding_ops();

    let req = comm0
        .begin_all_reduce(vec![0; 8], usize::MAX / 2, Type::Int64, ReduceOp::Sum)
        .unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::Invalid);

    let req = comm0.begin_all_to_all(vec![0; 4], usize::MAX).unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::Invalid);

    let req = comm0
        .begin_all_to_all_v(AllToAllVArgs {
            send: vec![0; 8],
            send_type: Type::Int64,
            send_counts: vec![u32::MAX, 1],
            send_offsets: vec![u32::MAX, 0],
            recv_type: Type::Int64,
            recv_counts: vec![1, 1],
            recv_offsets: vec![0, 1],
        })
        .unwrap();
    assert_eq!(req.status(), RequestStatus::Error);
    assert_eq!(req.error().unwrap().code(), Code::Invalid);

    assert_eq!(engine0.live_objects().requests, 0);
    assert_eq!(fabric.outstanding_ops(), posted);

    drop(comm1);
    drop(comm0);
}

#[test]
fn test_premature_free_of_collective() {
    let fabric = LocalFabric::new(2);
    let t0: Arc<dyn P2PTransport> = Arc::new(fabric.transport(0).unwrap());
    let t1: Arc<dyn P2PTransport> = Arc::new(fabric.transport(1).unwrap());

    let (comm0, comm1) = std::thread::scope(|scope| {
        let h0 = scope.spawn(|| open_local(t0, XcclConfig::default()));
        let h1 = scope.spawn(|| open_local(t1, XcclConfig::default()));
        (h0.join().unwrap(), h1.join().unwrap())
    });

    // Rank 1 never joins, so rank 0 cannot finish
    let req = comm0.0.begin_all_to_all(vec![0; 4], 2).unwrap();
    assert_eq!(req.status(), RequestStatus::InProgress);
    let err = Box::new(req).free().unwrap_err();
    assert_eq!(err.code(), Code::Invalid);

    drop(comm1);
    drop(comm0);
}

#[test]
fn test_bootstrap_and_data_requests_share_a_worklist() {
    let fabric = LocalFabric::new(1);
    let transport: Arc<dyn P2PTransport> = Arc::new(fabric.transport(0).unwrap());
    let (comm, _engine) = open_local(transport.clone(), XcclConfig::default());

    let mut work = WorkList::new();
    let gather = OobRequest::begin(transport, &[9, 9], vec![0; 2], 2, 0, RankRange::Undefined).unwrap();
    work.push(Box::new(gather));
    work.push(Box::new(
        comm.begin_all_reduce(i32_bytes(&[5]), 1, Type::Int32, ReduceOp::Product)
            .unwrap(),
    ));

    let done = work.drive_until_empty(Some(10)).unwrap();
    assert_eq!(done[0].output.as_ref().unwrap(), &vec![9, 9]);
    assert_eq!(bytes_i32(done[1].output.as_ref().unwrap()), vec![5]);
    assert_eq!(comm.get_rank(), 0);
}

#[test]
fn test_coll_ops_table() {
    let world = 2;
    let fabric = LocalFabric::new(world);
    let ops = XcclCollOps::new(XcclConfig::default(), LocalEngine::new);

    std::thread::scope(|scope| {
        for t in fabric.transports() {
            let ops = &ops;
            scope.spawn(move || {
                let me = t.rank() as i32;
                let comm = ops.comm_init(Arc::new(t)).unwrap();

                let mut req = ops
                    .allreduce(&comm, i32_bytes(&[me + 1, -me]), 2, Type::Int32, ReduceOp::Min)
                    .unwrap();
                while ops.test(&req) == RequestStatus::InProgress {
                    ops.progress(&mut req).unwrap();
                }
                assert_eq!(ops.test(&req), RequestStatus::Ok);
                assert_eq!(bytes_i32(&ops.free(req).unwrap()), vec![1, -1]);

                ops.comm_close(comm).unwrap();
            });
        }
    });
}
