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

//! Element types carried by collective buffers
//!
//! The tensor scalar types a caller may hand to the data-path collectives.
//! Whether a type can actually be reduced or exchanged is decided by the
//! engine mapping in `net::xccl::mapping`.

use serde::{Deserialize, Serialize};

/// Element type of a collective buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Boolean stored as one byte
    Bool,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 16-bit little-endian integer
    UInt16,
    /// Signed 16-bit little-endian integer
    Int16,
    /// Unsigned 32-bit little-endian integer
    UInt32,
    /// Signed 32-bit little-endian integer
    Int32,
    /// Unsigned 64-bit little-endian integer
    UInt64,
    /// Signed 64-bit little-endian integer
    Int64,
    /// 2-byte floating point value
    HalfFloat,
    /// 4-byte floating point value
    Float,
    /// 8-byte floating point value
    Double,
}

impl Type {
    /// Size of one element in bytes
    pub fn byte_width(&self) -> usize {
        match self {
            Type::Bool | Type::UInt8 | Type::Int8 => 1,
            Type::UInt16 | Type::Int16 | Type::HalfFloat => 2,
            Type::UInt32 | Type::Int32 | Type::Float => 4,
            Type::UInt64 | Type::Int64 | Type::Double => 8,
        }
    }
}
