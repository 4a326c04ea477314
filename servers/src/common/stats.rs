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

//! Server stat collection types, to be used by tests, logging or the
//! operator RPC surface. Strictly observational; nothing in the node
//! makes decisions based on these.

use chrono::prelude::{DateTime, TimeZone, Utc};

use crate::p2p::peer::Peer;
use crate::p2p::types::Direction;
use crate::util::{Mutex, StatHistory, StatOp};

/// The node-wide stat rings, shifted by the stat timer thread.
pub struct NodeStats {
	/// Bytes received across all peers.
	pub recv_bytes: Mutex<StatHistory>,
	/// Bytes sent across all peers.
	pub sent_bytes: Mutex<StatHistory>,
	/// Transactions admitted.
	pub txns_accepted: Mutex<StatHistory>,
	/// Transactions requested but never received.
	pub txns_dropped: Mutex<StatHistory>,
	/// Blocks validated.
	pub blocks_validated: Mutex<StatHistory>,
	/// Peak block response time observed, microseconds.
	pub blk_response_peak_us: Mutex<StatHistory>,
}

impl NodeStats {
	/// Fresh, empty rings.
	pub fn new() -> NodeStats {
		NodeStats {
			recv_bytes: Mutex::new(StatHistory::new("net/recv", StatOp::Sum)),
			sent_bytes: Mutex::new(StatHistory::new("net/sent", StatOp::Sum)),
			txns_accepted: Mutex::new(StatHistory::new("txn/accepted", StatOp::Sum)),
			txns_dropped: Mutex::new(StatHistory::new("txn/dropped", StatOp::Sum)),
			blocks_validated: Mutex::new(StatHistory::new("blk/validated", StatOp::Sum)),
			blk_response_peak_us: Mutex::new(StatHistory::new("blk/response-peak", StatOp::Max)),
		}
	}

	/// Shift every ring; driven by the stat timer at the configured
	/// cadence, never faster than the ring minimum.
	pub fn sample_all(&self) {
		self.recv_bytes.lock().sample();
		self.sent_bytes.lock().sample();
		self.txns_accepted.lock().sample();
		self.txns_dropped.lock().sample();
		self.blocks_validated.lock().sample();
		self.blk_response_peak_us.lock().sample();
	}
}

/// Struct to return relevant information about peers.
#[derive(Clone, Debug, Serialize)]
pub struct PeerStats {
	/// Peer id.
	pub id: i64,
	/// Current state of peer.
	pub state: String,
	/// Address.
	pub addr: String,
	/// Protocol version in use.
	pub version: u32,
	/// Peer user agent string.
	pub user_agent: String,
	/// Direction.
	pub direction: String,
	/// When the peer connected.
	pub connected_at: DateTime<Utc>,
	/// Smoothed block response time, seconds.
	pub avg_block_response_secs: f64,
	/// Adaptive in-transit block budget.
	pub max_blocks_in_transit: u32,
	/// Last measured ping, microseconds.
	pub ping_usec: i64,
	/// Negotiated relay capabilities.
	pub relay_capabilities: String,
}

impl PeerStats {
	/// Convert from a peer directly.
	pub fn from_peer(peer: &Peer) -> PeerStats {
		let state = if peer.should_disconnect() {
			"Disconnecting"
		} else if peer.is_connected() {
			"Connected"
		} else {
			"Handshaking"
		};
		let direction = match peer.direction {
			Direction::Inbound => "Inbound",
			Direction::Outbound => "Outbound",
			Direction::Feeler => "Feeler",
		};
		let mut caps = vec![];
		if peer.graphene_capable() {
			caps.push("graphene");
		}
		if peer.xthin_capable() {
			caps.push("xthin");
		}
		if peer.compact_capable() {
			caps.push("cmpct");
		}
		if peer.mempool_sync_capable() {
			caps.push("mpsync");
		}
		let info = peer.info.read();
		PeerStats {
			id: peer.id,
			state: state.to_string(),
			addr: peer.addr.to_string(),
			version: info.version,
			user_agent: info.user_agent.clone(),
			direction: direction.to_string(),
			connected_at: Utc.timestamp_opt(peer.connected_at, 0).single().unwrap_or_else(Utc::now),
			avg_block_response_secs: peer.avg_block_response_secs(),
			max_blocks_in_transit: peer.max_blocks_in_transit(),
			ping_usec: peer.ping_latency_usec(),
			relay_capabilities: caps.join(","),
		}
	}
}

/// Simpler thread-unaware snapshot to be returned to consumers that
/// might be interested, such as test results or an operator UI.
#[derive(Clone, Debug)]
pub struct ServerStats {
	/// Number of peers.
	pub peer_count: usize,
	/// Blocks currently under parallel validation.
	pub validations_running: usize,
	/// Weak blocks currently tracked.
	pub weak_blocks: usize,
	/// Network-wide smoothed block response time, seconds.
	pub overall_block_response_secs: f64,
	/// Per-peer stats.
	pub peer_stats: Vec<PeerStats>,
}
