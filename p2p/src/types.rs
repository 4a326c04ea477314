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

//! Shared p2p types: configuration, errors, capability flags and the
//! traits through which the networking core drives its collaborators
//! (chain state, mempool, validation, DoS policy, address manager).

use std::io;
use std::net::{IpAddr, SocketAddr};

use crate::core::consensus;
use crate::core::core::block::{Block, BlockHeader};
use crate::core::core::hash::Hash;
use crate::core::core::inventory::Inv;
use crate::core::core::transaction::TxRef;
use crate::core::ser;

/// Monotonically increasing peer identifier. Zero and negative values are
/// reserved as sentinels and never name a live peer.
pub type PeerId = i64;

/// Sentinel id naming no peer.
pub const INVALID_PEER: PeerId = 0;

/// Maximum number of locator hashes in a getheaders request.
pub const MAX_LOCATORS: usize = 101;

/// Maximum simultaneous feeler connections.
pub const MAX_FEELER_CONNECTIONS: usize = 1;

/// Mean interval between feeler connections, in seconds.
pub const FEELER_INTERVAL_SECS: f64 = 120.0;

/// How long we wait for a VERACK after sending our VERSION.
pub const VERACK_TIMEOUT_SECS: i64 = 60;

/// General inactivity timeout: no bytes in either direction disconnects.
pub const TIMEOUT_INTERVAL_SECS: i64 = 20 * 60;

bitflags! {
	/// Service bits a peer may advertise in its version message.
	pub struct Capabilities: u64 {
		/// Unknown or no services.
		const UNKNOWN = 0b0000_0000;
		/// Can serve the full chain.
		const NETWORK = 1 << 0;
		/// Serves bloom-filtered connections.
		const BLOOM = 1 << 2;
		/// Understands the xthin block relay family.
		const XTHIN = 1 << 4;
		/// This chain's replay-protected network.
		const CASH = 1 << 5;
		/// Understands graphene block relay.
		const GRAPHENE = 1 << 6;
		/// Accepts weak blocks.
		const WEAKBLOCKS = 1 << 7;
		/// Will exchange an extended-version map after the handshake.
		const XVERSION = 1 << 11;
	}
}

/// Direction of the connection relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// The remote opened the connection.
	Inbound,
	/// We opened the connection.
	Outbound,
	/// We opened a short-lived address probe.
	Feeler,
}

/// Configuration for the peer-to-peer server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PConfig {
	/// Interface to bind.
	pub host: IpAddr,
	/// Port to bind.
	pub port: u16,
	/// Network magic expected on every frame.
	pub magic: [u8; 4],
	/// Total connection budget, in and out.
	pub max_connections: usize,
	/// Outbound connection budget.
	pub max_outbound: usize,
	/// Number of addnode-style pinned peers configured by the operator.
	pub addnode_count: usize,
	/// Minimum number of xthin-capable outbound peers to hold during IBD.
	pub min_xthin_nodes: usize,
	/// Operator-configured excessive block size.
	pub excessive_block_size: u64,
	/// Preferential thin-relay timer base, in milliseconds. Zero disables
	/// preferential relay entirely.
	pub preferential_timer_ms: u64,
	/// Base retry interval for block requests, in microseconds.
	pub blk_retry_interval_us: i64,
	/// Base retry interval for txn requests, in microseconds.
	pub tx_retry_interval_us: i64,
	/// How far ahead of our tip we download blocks.
	pub block_download_window: u64,
	/// Whether the xthin scheme is enabled.
	pub use_thinblocks: bool,
	/// Whether the graphene scheme is enabled.
	pub use_graphene: bool,
	/// Whether compact blocks are enabled.
	pub use_compact_blocks: bool,
	/// Whether peer-initiated mempool sync is served.
	pub use_mempool_sync: bool,
	/// Send shaper (max_burst, avg_rate) in bytes; None disables shaping.
	pub send_shaper: Option<(i64, i64)>,
	/// Receive shaper (max_burst, avg_rate) in bytes; None disables shaping.
	pub recv_shaper: Option<(i64, i64)>,
	/// Addresses exempt from eviction, bans and upload caps.
	pub whitelist: Vec<IpAddr>,
	/// Relay blocks only; transactions from non-whitelisted peers are
	/// ignored.
	pub blocks_only: bool,
	/// Running a local test network (relaxes download-timeout disconnects).
	pub regtest: bool,
	/// Historical-block upload budget per day, bytes. Zero means unlimited.
	pub max_upload_target: u64,
}

impl Default for P2PConfig {
	fn default() -> P2PConfig {
		P2PConfig {
			host: "0.0.0.0".parse().unwrap(),
			port: 8333,
			magic: [0xe3, 0xe1, 0xf3, 0xe8],
			max_connections: 125,
			max_outbound: 16,
			addnode_count: 0,
			min_xthin_nodes: 8,
			excessive_block_size: consensus::DEFAULT_EXCESSIVE_BLOCK_SIZE,
			preferential_timer_ms: 1000,
			blk_retry_interval_us: 5_000_000,
			tx_retry_interval_us: 5_000_000,
			block_download_window: 1024,
			use_thinblocks: true,
			use_graphene: true,
			use_compact_blocks: true,
			use_mempool_sync: true,
			send_shaper: None,
			recv_shaper: None,
			whitelist: vec![],
			blocks_only: false,
			regtest: false,
			max_upload_target: 0,
		}
	}
}

impl P2PConfig {
	/// Largest wire message we accept given the configured excessive size.
	pub fn max_message_size(&self) -> u64 {
		consensus::max_message_size(self.excessive_block_size)
	}

	/// Whether the address is operator-whitelisted.
	pub fn is_whitelisted(&self, addr: &IpAddr) -> bool {
		self.whitelist.contains(addr)
	}

	/// Inbound connection budget, leaving room for outbound, feelers and
	/// operator-pinned peers.
	pub fn max_inbound(&self) -> usize {
		self.max_connections.saturating_sub(
			self.max_outbound
				+ MAX_FEELER_CONNECTIONS
				+ self.addnode_count.min(self.max_outbound),
		)
	}
}

/// Error type for the p2p crate.
#[derive(Debug)]
pub enum Error {
	/// Message failed to (de)serialize.
	Serialization(ser::Error),
	/// Underlying socket error.
	Connection(io::Error),
	/// Peer is banned.
	Banned,
	/// The connection was or should be closed.
	ConnectionClose,
	/// A timed operation took too long.
	Timeout,
	/// The frame carried the wrong network magic. The flag reports whether
	/// it matched the legacy core network's magic.
	BadMagic {
		/// Whether the magic identified the legacy core network.
		legacy_core: bool,
	},
	/// A frame declared a body larger than the message cap.
	OversizedMessage(u64),
	/// The frame checksum did not match the payload.
	BadChecksum,
	/// Connected to ourselves.
	PeerWithSelf,
	/// Peer speaks a protocol version below our minimum.
	ObsoleteVersion(u32),
	/// The peer misbehaved badly enough to drop the message.
	Misbehaving,
	/// No such peer.
	PeerNotFound,
}

impl From<ser::Error> for Error {
	fn from(e: ser::Error) -> Error {
		Error::Serialization(e)
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Connection(e)
	}
}

/// Everything the request manager and dispatcher need to know about one
/// entry in the block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexInfo {
	/// Block hash.
	pub hash: Hash,
	/// Previous block hash.
	pub prev_hash: Hash,
	/// Height on its chain.
	pub height: u64,
	/// Total chain work up to and including this block.
	pub work: u128,
	/// Header timestamp.
	pub time: i64,
}

/// Read access to the chain state maintained by the validation kernel.
pub trait ChainView: Send + Sync {
	/// The current active chain tip.
	fn tip(&self) -> BlockIndexInfo;
	/// The best known header (may be ahead of the tip).
	fn best_header(&self) -> BlockIndexInfo;
	/// Whether the block is on the active chain.
	fn contains(&self, hash: &Hash) -> bool;
	/// A locator describing the active chain from the tip backwards.
	fn locator(&self) -> Vec<Hash>;
	/// Look up a block index entry by hash, on any chain.
	fn lookup(&self, hash: &Hash) -> Option<BlockIndexInfo>;
	/// Walk the chain leading to `best_known`, starting after
	/// `last_common`, returning at most `max` entries in height order.
	fn next_blocks_toward(
		&self,
		last_common: &Hash,
		best_known: &Hash,
		max: usize,
	) -> Vec<BlockIndexInfo>;
	/// Most-work common ancestor of a chain entry and the active chain.
	fn last_common_ancestor(&self, hash: &Hash) -> Option<BlockIndexInfo>;
	/// Read a full block from the store.
	fn read_block(&self, hash: &Hash) -> Option<Block>;
	/// Headers following the locator's fork point, at most `max`.
	fn locate_headers(&self, locator: &[Hash], max: usize) -> Vec<BlockHeader>;
	/// Accept a standalone header, extending the block index.
	fn accept_block_header(&self, header: &BlockHeader) -> Result<BlockIndexInfo, RejectCode>;
	/// Whether we are still in initial block download.
	fn is_initial_block_download(&self) -> bool;
	/// Whether the chain is close enough to the network tip for thin relay.
	fn is_chain_nearly_syncd(&self) -> bool;
	/// Whether a block may be served to peers: on the active chain, or
	/// script-valid and recent enough.
	fn can_serve_block(&self, hash: &Hash) -> bool;
}

/// Read/submit access to the transaction mempool.
pub trait TxMempoolView: Send + Sync {
	/// All txids currently in the pool.
	fn query_hashes(&self) -> Vec<Hash>;
	/// Fetch a pool transaction by txid.
	fn get(&self, hash: &Hash) -> Option<TxRef>;
	/// Whether the txid is in the pool (or recently committed).
	fn contains(&self, hash: &Hash) -> bool;
	/// Hand a relayed transaction to the admission pipeline.
	fn submit(&self, tx: TxRef, from: PeerId);
	/// Validate and store a double-spend proof; returns the double-spent
	/// pool transaction when the proof is good.
	fn add_double_spend_proof(&self, proof: &[u8]) -> Option<TxRef>;
}

/// Entry point into block validation; implemented over the parallel
/// validation dispatcher.
pub trait BlockValidator: Send + Sync {
	/// Validate a freshly reconstructed or received block. Never blocks the
	/// calling dispatcher thread on script checks.
	fn handle_block(&self, peer: PeerId, block: Block, inv: Inv);
}

/// Misbehaviour and ban policy, maintained outside the core.
pub trait DosManager: Send + Sync {
	/// Award misbehaviour points; returns true once the peer crossed the
	/// disconnect threshold.
	fn misbehaving(&self, peer: PeerId, points: i32, reason: &str) -> bool;
	/// Ban an address outright.
	fn ban(&self, addr: &IpAddr, subver: &str, reason: &str, seconds: i64);
	/// Whether the address is currently banned.
	fn is_banned(&self, addr: &IpAddr) -> bool;
	/// Load the persisted banlist; called once at startup.
	fn load_banlist(&self) {}
	/// Persist the banlist; called on interval and at shutdown.
	fn dump_banlist(&self) {}
}

/// The peers.dat-backed address manager.
pub trait AddressBook: Send + Sync {
	/// Record addresses learned from a peer.
	fn add(&self, addrs: &[SocketAddr], source: &IpAddr);
	/// Mark an address as successfully connected.
	fn good(&self, addr: &SocketAddr);
	/// Mark a connection attempt.
	fn attempt(&self, addr: &SocketAddr);
	/// Select a candidate address for a new outbound or feeler connection.
	fn select(&self, new_only: bool) -> Option<SocketAddr>;
	/// A sample of known addresses to answer getaddr.
	fn get_addresses(&self, max: usize) -> Vec<SocketAddr>;
}

/// Wire reject codes surfaced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
	/// Message failed to deserialize.
	Malformed = 0x01,
	/// Failed higher-level validation.
	Invalid = 0x10,
	/// Peer protocol version too low.
	Obsolete = 0x11,
	/// Object already known.
	Duplicate = 0x12,
	/// Transaction violates standardness policy.
	Nonstandard = 0x40,
	/// Output below the dust threshold.
	Dust = 0x41,
	/// Fee below the relay floor.
	InsufficientFee = 0x42,
	/// Block violates a hardcoded checkpoint.
	Checkpoint = 0x43,
}

impl RejectCode {
	/// Parse a wire value.
	pub fn from_u8(n: u8) -> Option<RejectCode> {
		match n {
			0x01 => Some(RejectCode::Malformed),
			0x10 => Some(RejectCode::Invalid),
			0x11 => Some(RejectCode::Obsolete),
			0x12 => Some(RejectCode::Duplicate),
			0x40 => Some(RejectCode::Nonstandard),
			0x41 => Some(RejectCode::Dust),
			0x42 => Some(RejectCode::InsufficientFee),
			0x43 => Some(RejectCode::Checkpoint),
			_ => None,
		}
	}
}
