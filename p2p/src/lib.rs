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

//! Networking code to connect to other peers and exchange blocks,
//! transactions, etc. Contains the socket reactor, the message dispatcher,
//! the request manager and the thin-type block relay machinery.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

use cashnode_core as core;
use cashnode_util as util;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod blockrelay;
pub mod bloom;
pub mod conn;
pub mod extversion;
pub mod handshake;
pub mod msg;
pub mod nodestate;
pub mod peer;
pub mod peers;
pub mod protocol;
pub mod requests;
pub mod serv;
pub mod shaper;
pub mod types;

pub use crate::blockrelay::common::{ThinType, ThinTypeRelay, MAX_THINTYPE_BLOCKS_IN_FLIGHT};
pub use crate::conn::{NetMessage, RecvParser, SendQueue};
pub use crate::msg::Command;
pub use crate::peer::Peer;
pub use crate::peers::Peers;
pub use crate::requests::RequestManager;
pub use crate::serv::Server;
pub use crate::shaper::LeakyBucket;
pub use crate::types::{
	AddressBook, BlockIndexInfo, BlockValidator, Capabilities, ChainView, Direction, DosManager,
	Error, P2PConfig, PeerId, TxMempoolView,
};
