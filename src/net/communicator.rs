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

//! Communicator trait
//!
//! The base interface every communication backend implements.

use crate::error::XcclResult;

use super::CommType;

/// Main interface of a communication backend
pub trait Communicator: Send + Sync {
    fn get_rank(&self) -> usize;
    fn get_world_size(&self) -> usize;
    fn get_comm_type(&self) -> CommType;
    fn is_finalized(&self) -> bool;

    /// Release every backend resource. Calling it again is a no-op.
    fn finalize(&mut self) -> XcclResult<()>;
}
