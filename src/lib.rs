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

//! Energy-monitoring gateway core: wire codecs for Voltronic Axpert
//! inverters (USB-HID) and Pylontech batteries (RS-232/485), plus the
//! polling supervisor and MQTT egress used by the `datalogd` daemon.

pub use crate::error::*;
pub use crate::objects::*;

pub mod axpert;
pub mod config;
pub mod connector;
mod error;
mod objects;
pub mod publisher;
pub mod pylontech;
pub mod scheduler;
pub mod slot;
