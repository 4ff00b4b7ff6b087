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

//! XCCL communicator bootstrap tests
//!
//! Cleanup ordering is checked against a scripted engine that records every
//! call; full bring-up runs one thread per rank on a `LocalFabric` with a
//! `LocalEngine` per rank.

use std::sync::{Arc, Mutex};

use cylon_xccl::error::{Code, XcclError, XcclResult};
use cylon_xccl::net::local::{LocalEngine, LocalFabric};
use cylon_xccl::net::request::RequestStatus;
use cylon_xccl::net::transport::P2PTransport;
use cylon_xccl::net::xccl::engine::{
    CollArgs, CollCaps, CollectiveEngine, CompletionType, ContextConfig, ContextHandle,
    ContextParams, EngineRequest, LibHandle, LibParams, TeamHandle, TeamParams, ThreadMode,
    TransportLayer,
};
use cylon_xccl::net::xccl::{CommState, XcclCommunicator, XcclConfig};
use cylon_xccl::net::{CommType, Communicator};

/// Engine that records calls and fails at a chosen step
#[derive(Default)]
struct ScriptedEngine {
    calls: Mutex<Vec<&'static str>>,
    fail_at: Option<&'static str>,
    team_status: Option<RequestStatus>,
    seen_lib: Mutex<Option<LibParams>>,
    seen_ctx: Mutex<Option<(ThreadMode, CompletionType, TransportLayer, String)>>,
    seen_team: Mutex<Option<cylon_xccl::net::oob::RankRange>>,
}

impl ScriptedEngine {
    fn failing_at(step: &'static str) -> Self {
        Self {
            fail_at: Some(step),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, step: &'static str) -> XcclResult<()> {
        self.calls.lock().unwrap().push(step);
        if self.fail_at == Some(step) {
            return Err(XcclError::Engine(format!("scripted failure in {}", step)));
        }
        Ok(())
    }
}

impl CollectiveEngine for ScriptedEngine {
    fn lib_init(&self, params: &LibParams) -> XcclResult<LibHandle> {
        *self.seen_lib.lock().unwrap() = Some(*params);
        self.record("lib_init")?;
        Ok(LibHandle::new(1))
    }

    fn lib_cleanup(&self, _lib: LibHandle) -> XcclResult<()> {
        self.record("lib_cleanup")
    }

    fn context_config_read(&self, _lib: &LibHandle, prefix: &str) -> XcclResult<ContextConfig> {
        self.record("context_config_read")?;
        let mut seen = self.seen_ctx.lock().unwrap();
        *seen = Some((
            ThreadMode::Single,
            CompletionType::NonBlocking,
            TransportLayer::Sharp,
            prefix.to_string(),
        ));
        Ok(ContextConfig::new(2))
    }

    fn context_config_release(&self, _config: ContextConfig) {
        self.calls.lock().unwrap().push("context_config_release");
    }

    fn context_create(
        &self,
        _lib: &LibHandle,
        params: ContextParams,
        _config: &ContextConfig,
    ) -> XcclResult<ContextHandle> {
        if let Some(seen) = self.seen_ctx.lock().unwrap().as_mut() {
            seen.0 = params.thread_mode;
            seen.1 = params.completion_type;
            seen.2 = params.tls;
        }
        self.record("context_create")?;
        Ok(ContextHandle::new(3))
    }

    fn context_destroy(&self, _ctx: ContextHandle) -> XcclResult<()> {
        self.record("context_destroy")
    }

    fn team_create_post(&self, _ctx: &ContextHandle, params: TeamParams) -> XcclResult<TeamHandle> {
        *self.seen_team.lock().unwrap() = Some(params.range.clone());
        self.record("team_create_post")?;
        Ok(TeamHandle::new(4))
    }

    fn team_create_test(&self, _team: &TeamHandle) -> XcclResult<RequestStatus> {
        self.record("team_create_test")?;
        Ok(self.team_status.unwrap_or(RequestStatus::Ok))
    }

    fn team_destroy(&self, _team: TeamHandle) -> XcclResult<()> {
        self.record("team_destroy")
    }

    fn collective_init(&self, _args: CollArgs, _team: &TeamHandle) -> XcclResult<EngineRequest> {
        self.record("collective_init")?;
        Ok(EngineRequest::new(5))
    }

    fn collective_post(&self, _req: &EngineRequest) -> XcclResult<()> {
        self.record("collective_post")
    }

    fn collective_test(&self, _req: &EngineRequest) -> XcclResult<RequestStatus> {
        self.record("collective_test")?;
        Ok(RequestStatus::Ok)
    }

    fn collective_finalize(&self, _req: EngineRequest) -> XcclResult<Vec<u8>> {
        self.record("collective_finalize")?;
        Ok(Vec::new())
    }
}

fn single_rank_transport() -> Arc<dyn P2PTransport> {
    Arc::new(LocalFabric::new(1).transport(0).unwrap())
}

fn open_scripted(engine: &Arc<ScriptedEngine>) -> XcclResult<XcclCommunicator> {
    let dyn_engine: Arc<dyn CollectiveEngine> = engine.clone();
    XcclCommunicator::open(dyn_engine, single_rank_transport(), XcclConfig::default())
}

#[test]
fn test_fixed_bootstrap_policy() {
    let engine = Arc::new(ScriptedEngine::default());
    let comm = open_scripted(&engine).unwrap();
    assert_eq!(comm.state(), CommState::Ready);

    let lib = engine.seen_lib.lock().unwrap().unwrap();
    assert!(lib.coll_types.contains(CollCaps::BCAST));
    assert!(lib.coll_types.contains(CollCaps::ALLREDUCE));
    assert!(lib.coll_types.contains(CollCaps::ALLTOALL));
    assert!(lib.coll_types.contains(CollCaps::ALLTOALLV));

    let ctx = engine.seen_ctx.lock().unwrap().clone().unwrap();
    assert_eq!(ctx.0, ThreadMode::Multiple);
    assert_eq!(ctx.1, CompletionType::Blocking);
    assert_eq!(ctx.2, TransportLayer::Ucx);
    assert_eq!(ctx.3, "TORCH");

    let range = engine.seen_team.lock().unwrap().clone().unwrap();
    assert_eq!(range, cylon_xccl::net::oob::RankRange::full(1));

    assert_eq!(
        engine.calls(),
        vec![
            "lib_init",
            "context_config_read",
            "context_create",
            "context_config_release",
            "team_create_post",
            "team_create_test",
        ]
    );
}

#[test]
fn test_lib_failure_has_nothing_to_unwind() {
    let engine = Arc::new(ScriptedEngine::failing_at("lib_init"));
    let err = open_scripted(&engine).unwrap_err();
    assert_eq!(err.code(), Code::CapabilityError);
    assert_eq!(engine.calls(), vec!["lib_init"]);
}

#[test]
fn test_context_failure_releases_config_and_lib() {
    let engine = Arc::new(ScriptedEngine::failing_at("context_create"));
    assert!(open_scripted(&engine).is_err());
    assert_eq!(
        engine.calls(),
        vec![
            "lib_init",
            "context_config_read",
            "context_create",
            "context_config_release",
            "lib_cleanup",
        ]
    );
}

#[test]
fn test_team_post_failure_unwinds_in_reverse() {
    let engine = Arc::new(ScriptedEngine::failing_at("team_create_post"));
    assert!(open_scripted(&engine).is_err());
    assert_eq!(
        engine.calls(),
        vec![
            "lib_init",
            "context_config_read",
            "context_create",
            "context_config_release",
            "team_create_post",
            "context_destroy",
            "lib_cleanup",
        ]
    );
}

#[test]
fn test_team_poll_error_unwinds_in_reverse() {
    let engine = Arc::new(ScriptedEngine {
        team_status: Some(RequestStatus::Error),
        ..Default::default()
    });
    let err = open_scripted(&engine).unwrap_err();
    assert_eq!(err.code(), Code::ExecutionError);
    assert_eq!(
        engine.calls()[4..].to_vec(),
        vec![
            "team_create_post",
            "team_create_test",
            "team_destroy",
            "context_destroy",
            "lib_cleanup",
        ]
    );
}

#[test]
fn test_close_runs_every_step_and_reports_first_error() {
    let engine = Arc::new(ScriptedEngine::failing_at("team_destroy"));
    let comm = open_scripted(&engine).unwrap();
    let err = comm.close().unwrap_err();
    assert_eq!(err.code(), Code::ExecutionError);

    let calls = engine.calls();
    assert_eq!(
        calls[calls.len() - 3..].to_vec(),
        vec!["team_destroy", "context_destroy", "lib_cleanup"]
    );
}

#[test]
fn test_drop_tears_down_once() {
    let engine = Arc::new(ScriptedEngine::default());
    let mut comm = open_scripted(&engine).unwrap();
    comm.finalize().unwrap();
    assert!(comm.is_finalized());
    drop(comm);

    let calls = engine.calls();
    assert_eq!(calls.iter().filter(|c| **c == "lib_cleanup").count(), 1);

    let engine = Arc::new(ScriptedEngine::default());
    drop(open_scripted(&engine).unwrap());
    assert_eq!(engine.calls().last(), Some(&"lib_cleanup"));
}

#[test]
fn test_collectives_require_ready_communicator() {
    let engine = Arc::new(ScriptedEngine::default());
    let mut comm = open_scripted(&engine).unwrap();
    comm.finalize().unwrap();

    let err = comm.begin_all_to_all(vec![0; 4], 4).unwrap_err();
    assert_eq!(err.code(), Code::Invalid);
    assert!(!engine.calls().contains(&"collective_init"));
}

#[test]
fn test_local_bootstrap_four_ranks() {
    let world = 4;
    let fabric = LocalFabric::new(world);

    std::thread::scope(|scope| {
        let handles: Vec<_> = fabric
            .transports()
            .into_iter()
            .map(|t| {
                scope.spawn(move || {
                    let transport: Arc<dyn P2PTransport> = Arc::new(t);
                    let engine = Arc::new(LocalEngine::new(transport.clone()));
                    let comm =
                        XcclCommunicator::open(engine.clone(), transport, XcclConfig::default())
                            .unwrap();
                    assert_eq!(comm.state(), CommState::Ready);
                    assert_eq!(comm.get_world_size(), world);
                    assert_eq!(comm.get_comm_type(), CommType::Xccl);

                    let live = engine.live_objects();
                    assert_eq!((live.libs, live.contexts, live.teams), (1, 1, 1));
                    assert_eq!(live.configs, 0);

                    comm.close().unwrap();
                    engine.live_objects()
                })
            })
            .collect();

        for handle in handles {
            let live = handle.join().unwrap();
            assert_eq!(live.libs + live.contexts + live.teams + live.requests, 0);
        }
    });

    assert_eq!(fabric.outstanding_ops(), 0);
    assert_eq!(fabric.undelivered_messages(), 0);
}

#[test]
fn test_open_fails_cleanly_when_context_errors() {
    let engine = Arc::new(ScriptedEngine::failing_at("context_config_read"));
    let err = open_scripted(&engine).unwrap_err();
    assert_eq!(err.code(), Code::ExecutionError);
    assert_eq!(
        engine.calls(),
        vec!["lib_init", "context_config_read", "lib_cleanup"]
    );
}
