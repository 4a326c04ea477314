// Copyright 2019 The Cashnode Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The node assembly: wires the p2p engine to the validation kernel,
//! owns the parallel script-check dispatcher, the weak-block store
//! housekeeping and the operator-facing statistics.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

use cashnode_core as core;
use cashnode_p2p as p2p;
use cashnode_util as util;

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod common;
pub mod parallel;
pub mod server;

pub use crate::common::stats::{PeerStats, ServerStats};
pub use crate::common::types::ServerConfig;
pub use crate::parallel::{ParallelValidation, ScriptCheckQueue, ScriptError, ValidationKernel};
pub use crate::server::Server;
