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

//! In-process transport and collective engine
//!
//! Lets several ranks run in one process, one thread per rank, for tests
//! and single-node runs.

pub mod engine;
pub mod transport;

pub use engine::{LiveObjects, LocalEngine, DATA_TAG_BASE};
pub use transport::{LocalFabric, LocalTransport};
