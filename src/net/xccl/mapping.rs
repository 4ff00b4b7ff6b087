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

//! Element type and reduction operator tables
//!
//! Unmapped keys are errors, never a fallback code.

use crate::data_types::Type;
use crate::error::{XcclError, XcclResult};
use crate::net::comm_operations::ReduceOp;

use super::engine::{EngineDataType, EngineOp};

/// Convert an element type to the engine's datatype
pub fn engine_dt(data_type: Type) -> XcclResult<EngineDataType> {
    match data_type {
        Type::UInt8 => Ok(EngineDataType::Uint8),
        Type::Int8 => Ok(EngineDataType::Int8),
        Type::HalfFloat => Ok(EngineDataType::Float16),
        Type::Double => Ok(EngineDataType::Float64),
        Type::Float => Ok(EngineDataType::Float32),
        Type::Int32 => Ok(EngineDataType::Int32),
        Type::Int64 => Ok(EngineDataType::Int64),
        Type::Bool | Type::UInt16 | Type::Int16 | Type::UInt32 | Type::UInt64 => Err(
            XcclError::Unsupported(format!("element type {:?} has no engine datatype", data_type)),
        ),
    }
}

/// Convert a reduction operator to the engine's operator
pub fn engine_op(op: ReduceOp) -> XcclResult<EngineOp> {
    match op {
        ReduceOp::Min => Ok(EngineOp::Min),
        ReduceOp::Max => Ok(EngineOp::Max),
        ReduceOp::Sum => Ok(EngineOp::Sum),
        ReduceOp::Product => Ok(EngineOp::Prod),
        ReduceOp::Avg
        | ReduceOp::BitAnd
        | ReduceOp::BitOr
        | ReduceOp::BitXor
        | ReduceOp::LogicalAnd
        | ReduceOp::LogicalOr => Err(XcclError::Unsupported(format!(
            "reduction operator {:?} has no engine operator",
            op
        ))),
    }
}
