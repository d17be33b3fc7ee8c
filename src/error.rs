//
// Copyright (C) 2022 CUAVA, The University of Sydney
//
// Licensed under the Apache License, Version 2.0 (the "License")
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

//! Error types shared by the transports, the two device codecs and the daemon

use failure::Fail;
use std::io;

// Error list
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum Error {
    /// I/O failure on a transport
    #[fail(display = "transport error: {}", _0)]
    Transport(String),
    /// No response within the read deadline
    #[fail(display = "timeout waiting for response")]
    Timeout,
    /// Bad start/end byte or checksum mismatch
    #[fail(display = "framing error: {}", _0)]
    Framing(String),
    /// Field parse failure, wrong field count or unknown discriminant
    #[fail(display = "decode error: {}", _0)]
    Decode(String),
    /// Device replied NAK to a command
    #[fail(display = "command not acknowledged: {}", _0)]
    NotAcknowledged(String),
    /// Invalid configuration at startup
    #[fail(display = "config error: {}", _0)]
    Config(String),
    /// MQTT client failure
    #[fail(display = "mqtt error: {}", _0)]
    Mqtt(String),
    /// A blocked acquire or turn was interrupted by shutdown
    #[fail(display = "cancelled by shutdown")]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Transport(e.to_string()),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
