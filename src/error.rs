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

//! Error handling for bootstrap and collective operations

use std::fmt;

/// Error codes shared by every layer of the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    Invalid = 4,
    IoError = 5,
    UnknownError = 9,
    NotImplemented = 10,
    /// Element type or reduction operator has no engine mapping
    Unsupported = 15,
    /// The collective engine rejected a requested capability
    CapabilityError = 16,
    ExecutionError = 42,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::Invalid => write!(f, "Invalid"),
            Code::IoError => write!(f, "IO error"),
            Code::UnknownError => write!(f, "Unknown error"),
            Code::NotImplemented => write!(f, "Not implemented"),
            Code::Unsupported => write!(f, "Unsupported"),
            Code::CapabilityError => write!(f, "Capability error"),
            Code::ExecutionError => write!(f, "Execution error"),
        }
    }
}

/// Main error type
#[derive(thiserror::Error, Debug, Clone)]
pub enum XcclError {
    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl XcclError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        XcclError::Generic {
            code,
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            XcclError::Invalid(_) => Code::Invalid,
            XcclError::Communication(_) => Code::IoError,
            XcclError::Unsupported(_) => Code::Unsupported,
            XcclError::Engine(_) => Code::ExecutionError,
            XcclError::Generic { code, .. } => *code,
        }
    }
}

/// Type alias for Results using XcclError
pub type XcclResult<T> = Result<T, XcclError>;
