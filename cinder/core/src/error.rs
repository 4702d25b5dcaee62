// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Cinder error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use crate::dataset::ShuffleId;

/// Result type alias for Cinder operations.
pub type Result<T> = result::Result<T, CinderError>;

/// Cinder error types for the driver-side scheduling layer.
#[derive(Debug)]
pub enum CinderError {
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// I/O operation error.
    IoError(io::Error),
    /// Tokio task join error.
    TokioError(tokio::task::JoinError),
    /// Task closure could not be encoded for shipping to executors.
    Serialization(bincode::Error),
    /// Shuffle fetch failed: (executor_id, shuffle_id, map_id, message).
    FetchFailed(String, ShuffleId, Option<usize>, String),
    /// A barrier stage cannot be scheduled with the current topology or
    /// cluster configuration.
    BarrierIncompatible(String),
    /// A barrier stage requires more simultaneous task slots than the
    /// cluster currently offers: (required, available).
    BarrierSlotsExceeded(usize, usize),
    /// Operation was cancelled.
    Cancelled,
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for CinderError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

/// Creates a general Cinder error from a string message.
pub fn cinder_error(message: &str) -> CinderError {
    CinderError::General(message.to_owned())
}

impl From<String> for CinderError {
    fn from(e: String) -> Self {
        CinderError::General(e)
    }
}

impl From<io::Error> for CinderError {
    fn from(e: io::Error) -> Self {
        CinderError::IoError(e)
    }
}

impl From<tokio::task::JoinError> for CinderError {
    fn from(e: tokio::task::JoinError) -> Self {
        CinderError::TokioError(e)
    }
}

impl From<bincode::Error> for CinderError {
    fn from(e: bincode::Error) -> Self {
        CinderError::Serialization(e)
    }
}

impl Display for CinderError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CinderError::General(desc) => write!(f, "General error: {desc}"),
            CinderError::Internal(desc) => {
                write!(f, "Internal Cinder error: {desc}")
            }
            CinderError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            CinderError::IoError(desc) => write!(f, "IO error: {desc}"),
            CinderError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
            CinderError::Serialization(desc) => {
                write!(f, "Task serialization error: {desc}")
            }
            CinderError::FetchFailed(executor_id, shuffle_id, map_id, desc) => {
                write!(
                    f,
                    "Shuffle fetch error from executor {executor_id}, shuffle {shuffle_id}, \
                map output {map_id:?}: {desc}"
                )
            }
            CinderError::BarrierIncompatible(desc) => {
                write!(f, "Barrier stage error: {desc}")
            }
            CinderError::BarrierSlotsExceeded(required, available) => {
                write!(
                    f,
                    "Barrier stage requires {required} simultaneous task slots but only \
                {available} are available"
                )
            }
            CinderError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl Error for CinderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_fetch_details() {
        let e = CinderError::FetchFailed(
            "exec-1".to_owned(),
            ShuffleId(7),
            Some(2),
            "connection reset".to_owned(),
        );
        let msg = e.to_string();
        assert!(msg.contains("exec-1"));
        assert!(msg.contains("shuffle 7"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn string_conversion_is_general() {
        let e: CinderError = "boom".to_owned().into();
        assert!(matches!(e, CinderError::General(_)));
    }
}
