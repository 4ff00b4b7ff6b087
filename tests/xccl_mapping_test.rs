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

//! Tests for the element type / operator tables and error values

use cylon_xccl::data_types::Type;
use cylon_xccl::error::{Code, XcclError};
use cylon_xccl::net::comm_operations::ReduceOp;
use cylon_xccl::net::xccl::engine::{EngineDataType, EngineOp};
use cylon_xccl::net::xccl::mapping::{engine_dt, engine_op};

#[test]
fn test_mapped_types() {
    let mapped = [
        (Type::UInt8, EngineDataType::Uint8),
        (Type::Int8, EngineDataType::Int8),
        (Type::HalfFloat, EngineDataType::Float16),
        (Type::Double, EngineDataType::Float64),
        (Type::Float, EngineDataType::Float32),
        (Type::Int32, EngineDataType::Int32),
        (Type::Int64, EngineDataType::Int64),
    ];
    for (ty, dt) in mapped {
        assert_eq!(engine_dt(ty).unwrap(), dt);
        assert_eq!(ty.byte_width(), dt.size());
    }
}

#[test]
fn test_unmapped_types_fail_closed() {
    for ty in [Type::UInt16, Type::Int16, Type::UInt32, Type::UInt64, Type::Bool] {
        let err = engine_dt(ty).unwrap_err();
        assert_eq!(err.code(), Code::Unsupported);
    }
}

#[test]
fn test_operator_table() {
    assert_eq!(engine_op(ReduceOp::Min).unwrap(), EngineOp::Min);
    assert_eq!(engine_op(ReduceOp::Max).unwrap(), EngineOp::Max);
    assert_eq!(engine_op(ReduceOp::Sum).unwrap(), EngineOp::Sum);
    assert_eq!(engine_op(ReduceOp::Product).unwrap(), EngineOp::Prod);

    for op in [
        ReduceOp::Avg,
        ReduceOp::BitAnd,
        ReduceOp::BitOr,
        ReduceOp::BitXor,
        ReduceOp::LogicalAnd,
        ReduceOp::LogicalOr,
    ] {
        assert_eq!(engine_op(op).unwrap_err().code(), Code::Unsupported);
    }
}

#[test]
fn test_error_codes() {
    assert_eq!(XcclError::Invalid("x".into()).code(), Code::Invalid);
    assert_eq!(XcclError::Communication("x".into()).code(), Code::IoError);
    assert_eq!(XcclError::Engine("x".into()).code(), Code::ExecutionError);
    assert_eq!(
        XcclError::new(Code::CapabilityError, "caps").code(),
        Code::CapabilityError
    );

    let err = XcclError::Unsupported("float16".into());
    assert_eq!(err.code(), Code::Unsupported);
    assert!(err.to_string().contains("float16"));
}
