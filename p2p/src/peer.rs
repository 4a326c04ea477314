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

//! One connected peer: identity, handshake state, negotiated
//! capabilities, the send/receive queues and the per-peer counters the
//! eviction, request and relay subsystems feed on. Peers are refcounted
//! so other subsystems can hold them across a disconnect.

use lru_cache::LruCache;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::bloom::BloomFilter;
use crate::conn::{NetMessage, RecvParser, SendQueue};
use crate::core::core::hash::Hash;
use crate::core::ser::{self, Writeable};
use crate::extversion::ExtState;
use crate::msg::{Command, NetAddress};
use crate::types::{Capabilities, Direction, Error, PeerId};
use crate::util::{Mutex, RwLock};

/// Known-inventory rolling filter size per peer.
const KNOWN_INV_CAP: usize = 10_000;

/// Half-life of the useful-activity byte counter, seconds.
const ACTIVITY_HALF_LIFE_SECS: i64 = 2 * 60 * 60;

/// Samples in the per-peer block response time moving average.
const RESPONSE_EWMA_SAMPLES: f64 = 50.0;

/// Initial adaptive in-transit block budget.
const DEFAULT_BLOCKS_IN_TRANSIT: u32 = 16;

/// Handshake progress on the connection we initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
	/// Socket is up, nothing sent.
	Connected,
	/// Our VERSION is out.
	SentVersion,
	/// Their VERACK arrived.
	Ready,
}

/// Handshake progress on what the remote sends us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
	/// Waiting for their VERSION.
	WaitVersion,
	/// We answered their VERSION, awaiting their XVERSION.
	SentVerackAwaitXver,
	/// Fully negotiated.
	Ready,
}

/// What the version handshake told us about the peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
	/// Protocol version.
	pub version: u32,
	/// Advertised services.
	pub services: Capabilities,
	/// User agent string.
	pub user_agent: String,
	/// Height of the peer's chain at connect time.
	pub start_height: i32,
	/// The address the peer sees for us.
	pub addr_you: Option<NetAddress>,
	/// The address the peer advertises for itself.
	pub advertised_addr: Option<NetAddress>,
	/// Whether the peer wants transactions before loading a filter.
	pub relay_txns: bool,
}

impl Default for PeerInfo {
	fn default() -> PeerInfo {
		PeerInfo {
			version: 0,
			services: Capabilities::UNKNOWN,
			user_agent: String::new(),
			start_height: 0,
			addr_you: None,
			advertised_addr: None,
			relay_txns: true,
		}
	}
}

/// A counter decaying exponentially with a configured half-life.
pub struct DecayedCounter {
	value: f64,
	last_secs: i64,
	half_life_secs: i64,
}

impl DecayedCounter {
	/// New zeroed counter.
	pub fn new(half_life_secs: i64) -> DecayedCounter {
		DecayedCounter {
			value: 0.0,
			last_secs: 0,
			half_life_secs,
		}
	}

	/// Decay to `now` and add `amount`. Returns the new value.
	pub fn bump(&mut self, now_secs: i64, amount: f64) -> f64 {
		self.value = crate::util::decay(
			self.value,
			now_secs - self.last_secs,
			self.half_life_secs,
		);
		self.last_secs = now_secs;
		self.value += amount;
		self.value
	}

	/// The decayed value at `now` without mutation beyond the decay.
	pub fn get(&mut self, now_secs: i64) -> f64 {
		self.bump(now_secs, 0.0)
	}
}

/// One connected peer.
pub struct Peer {
	/// Stable identifier, never reused within a run.
	pub id: PeerId,
	/// Remote socket address.
	pub addr: SocketAddr,
	/// Who initiated the connection.
	pub direction: Direction,
	/// Epoch seconds when the connection was established.
	pub connected_at: i64,
	magic: [u8; 4],

	/// Handshake-provided facts.
	pub info: RwLock<PeerInfo>,
	/// Extended-version negotiation results.
	pub xver: RwLock<ExtState>,
	outgoing_state: RwLock<OutgoingState>,
	incoming_state: RwLock<IncomingState>,
	successfully_connected: AtomicBool,
	disconnect: AtomicBool,

	/// Ordered outbound frames.
	pub send_queue: Mutex<SendQueue>,
	/// Inbound frame assembly.
	pub recv_parser: Mutex<RecvParser>,
	/// Parsed handshake-phase messages, consumed under `serial_phase`.
	pub recv_handshake: Mutex<std::collections::VecDeque<NetMessage>>,
	/// Parsed ordinary messages.
	pub recv_ordinary: Mutex<std::collections::VecDeque<NetMessage>>,
	/// Serializes handshake processing against ordinary dispatch.
	pub serial_phase: Mutex<()>,
	stream: Mutex<Option<TcpStream>>,

	/// Whether we may zero-checksum frames to this peer.
	zero_checksum_send: AtomicBool,

	last_send: AtomicI64,
	last_recv: AtomicI64,
	/// When our VERSION went out (epoch secs); gates the VERACK timeout.
	pub version_sent_at: AtomicI64,

	ping_nonce: AtomicU64,
	ping_sent_usec: AtomicI64,
	ping_usec: AtomicI64,

	activity: Mutex<DecayedCounter>,
	/// Thin-type object request counter for the DoS cap.
	pub request_counter: Mutex<DecayedCounter>,

	known_inventory: Mutex<LruCache<Hash, ()>>,
	recently_sent_inv: Mutex<LruCache<Hash, ()>>,
	/// SPV relay filter, when the peer loaded one.
	pub spv_filter: Mutex<Option<BloomFilter>>,

	/// Blocks currently requested from this peer.
	pub blocks_in_flight: AtomicI32,
	avg_blk_response_secs: Mutex<f64>,
	max_blocks_in_transit: AtomicU32,

	/// Compact-block announce preference, set by sendcmpct.
	pub compact_announce: AtomicBool,
	/// Compact-block version, zero until sendcmpct.
	pub compact_version: AtomicU64,
	/// Expedited-block subscription, set by req_xpedited.
	pub expedited_blocks: AtomicBool,
	/// Peer asked for headers-first announcements via sendheaders.
	pub prefer_headers: AtomicBool,
	/// Last mempool-sync request we answered for this peer (monotonic).
	pub last_mempool_sync: Mutex<Option<Instant>>,
	/// Historical-block bytes served, for the upload cap.
	pub historical_bytes_served: AtomicU64,
}

impl Peer {
	/// A fresh peer record for the given connection.
	pub fn new(
		id: PeerId,
		addr: SocketAddr,
		direction: Direction,
		magic: [u8; 4],
		max_message_size: u64,
		now_secs: i64,
	) -> Peer {
		Peer {
			id,
			addr,
			direction,
			connected_at: now_secs,
			magic,
			info: RwLock::new(PeerInfo::default()),
			xver: RwLock::new(ExtState::default()),
			outgoing_state: RwLock::new(OutgoingState::Connected),
			incoming_state: RwLock::new(IncomingState::WaitVersion),
			successfully_connected: AtomicBool::new(false),
			disconnect: AtomicBool::new(false),
			send_queue: Mutex::new(SendQueue::new()),
			recv_parser: Mutex::new(RecvParser::new(magic, max_message_size)),
			recv_handshake: Mutex::new(std::collections::VecDeque::new()),
			recv_ordinary: Mutex::new(std::collections::VecDeque::new()),
			serial_phase: Mutex::new(()),
			stream: Mutex::new(None),
			zero_checksum_send: AtomicBool::new(false),
			last_send: AtomicI64::new(now_secs),
			last_recv: AtomicI64::new(now_secs),
			version_sent_at: AtomicI64::new(0),
			ping_nonce: AtomicU64::new(0),
			ping_sent_usec: AtomicI64::new(0),
			ping_usec: AtomicI64::new(0),
			activity: Mutex::new(DecayedCounter::new(ACTIVITY_HALF_LIFE_SECS)),
			request_counter: Mutex::new(DecayedCounter::new(600)),
			known_inventory: Mutex::new(LruCache::new(KNOWN_INV_CAP)),
			recently_sent_inv: Mutex::new(LruCache::new(KNOWN_INV_CAP)),
			spv_filter: Mutex::new(None),
			blocks_in_flight: AtomicI32::new(0),
			avg_blk_response_secs: Mutex::new(0.0),
			max_blocks_in_transit: AtomicU32::new(DEFAULT_BLOCKS_IN_TRANSIT),
			compact_announce: AtomicBool::new(false),
			compact_version: AtomicU64::new(0),
			expedited_blocks: AtomicBool::new(false),
			prefer_headers: AtomicBool::new(false),
			last_mempool_sync: Mutex::new(None),
			historical_bytes_served: AtomicU64::new(0),
		}
	}

	/// Attach the socket once established.
	pub fn set_stream(&self, stream: TcpStream) {
		*self.stream.lock() = Some(stream);
	}

	/// Run a closure over the socket, if still attached.
	pub fn with_stream<T>(&self, f: impl FnOnce(&mut TcpStream) -> T) -> Option<T> {
		let mut guard = self.stream.lock();
		guard.as_mut().map(f)
	}

	/// Drop the socket.
	pub fn take_stream(&self) -> Option<TcpStream> {
		self.stream.lock().take()
	}

	/// Serialize and queue a message. Priority commands jump the ordinary
	/// traffic per the send-queue insertion rules.
	pub fn send_msg<T: Writeable>(&self, cmd: Command, body: &T) -> Result<(), Error> {
		let payload = ser::ser_vec(body)?;
		self.send_frame(cmd, &payload, false)
	}

	/// As `send_msg` but rides the low-priority tier (bulk traffic such as
	/// historical blocks).
	pub fn send_msg_low_priority<T: Writeable>(&self, cmd: Command, body: &T) -> Result<(), Error> {
		let payload = ser::ser_vec(body)?;
		self.send_frame(cmd, &payload, true)
	}

	fn send_frame(&self, cmd: Command, payload: &[u8], low_priority: bool) -> Result<(), Error> {
		if self.should_disconnect() {
			return Err(Error::ConnectionClose);
		}
		let zero = self.zero_checksum_send.load(Ordering::Relaxed);
		let frame = crate::msg::build_frame(self.magic, cmd, payload, zero)?;
		let mut queue = self.send_queue.lock();
		if low_priority {
			queue.push_low_priority(frame);
		} else {
			queue.push(frame, cmd.is_priority());
		}
		trace!(
			"queued {} ({} bytes) for peer {}",
			cmd.as_str(),
			payload.len(),
			self.id
		);
		Ok(())
	}

	/// Whether both handshake directions completed.
	pub fn is_connected(&self) -> bool {
		self.successfully_connected.load(Ordering::Relaxed)
	}

	/// Outgoing handshake state.
	pub fn outgoing_state(&self) -> OutgoingState {
		*self.outgoing_state.read()
	}

	/// Incoming handshake state.
	pub fn incoming_state(&self) -> IncomingState {
		*self.incoming_state.read()
	}

	/// Advance the outgoing handshake.
	pub fn set_outgoing_state(&self, state: OutgoingState) {
		*self.outgoing_state.write() = state;
		self.maybe_mark_connected();
	}

	/// Advance the incoming handshake.
	pub fn set_incoming_state(&self, state: IncomingState) {
		*self.incoming_state.write() = state;
		self.maybe_mark_connected();
	}

	fn maybe_mark_connected(&self) {
		// monotone except through the destructor
		if *self.outgoing_state.read() == OutgoingState::Ready
			&& *self.incoming_state.read() == IncomingState::Ready
		{
			self.successfully_connected.store(true, Ordering::Relaxed);
		}
	}

	/// Ask the reactor to drop this peer.
	pub fn request_disconnect(&self) {
		self.disconnect.store(true, Ordering::Relaxed);
	}

	/// Whether a disconnect was requested.
	pub fn should_disconnect(&self) -> bool {
		self.disconnect.load(Ordering::Relaxed)
	}

	/// Allow zero-checksum frames toward this peer.
	pub fn enable_zero_checksum_send(&self) {
		self.zero_checksum_send.store(true, Ordering::Relaxed);
	}

	/// Record bytes sent at `now`.
	pub fn touch_send(&self, now_secs: i64) {
		self.last_send.store(now_secs, Ordering::Relaxed);
	}

	/// Record bytes received at `now`.
	pub fn touch_recv(&self, now_secs: i64) {
		self.last_recv.store(now_secs, Ordering::Relaxed);
	}

	/// Last send instant, epoch seconds.
	pub fn last_send(&self) -> i64 {
		self.last_send.load(Ordering::Relaxed)
	}

	/// Last receive instant, epoch seconds.
	pub fn last_recv(&self) -> i64 {
		self.last_recv.load(Ordering::Relaxed)
	}

	/// Record an outgoing ping.
	pub fn ping_sent(&self, nonce: u64, now_usec: i64) {
		self.ping_nonce.store(nonce, Ordering::Relaxed);
		self.ping_sent_usec.store(now_usec, Ordering::Relaxed);
	}

	/// Process a pong; returns the latency in microseconds when the nonce
	/// matches the outstanding ping.
	pub fn pong_received(&self, nonce: u64, now_usec: i64) -> Option<i64> {
		if nonce != self.ping_nonce.load(Ordering::Relaxed) {
			return None;
		}
		let sent = self.ping_sent_usec.swap(0, Ordering::Relaxed);
		if sent == 0 {
			return None;
		}
		let latency = now_usec - sent;
		self.ping_usec.store(latency, Ordering::Relaxed);
		Some(latency)
	}

	/// Microseconds since an unanswered ping went out, zero when none.
	pub fn ping_outstanding_usec(&self, now_usec: i64) -> i64 {
		let sent = self.ping_sent_usec.load(Ordering::Relaxed);
		if sent == 0 {
			0
		} else {
			now_usec - sent
		}
	}

	/// Latest measured ping latency in microseconds.
	pub fn ping_latency_usec(&self) -> i64 {
		self.ping_usec.load(Ordering::Relaxed)
	}

	/// Credit useful traffic toward this peer's eviction weight.
	pub fn add_activity_bytes(&self, now_secs: i64, bytes: u64) {
		self.activity.lock().bump(now_secs, bytes as f64);
	}

	/// The decayed useful-traffic weight.
	pub fn activity_bytes(&self, now_secs: i64) -> f64 {
		self.activity.lock().get(now_secs)
	}

	/// Note that the peer announced or was sent this inventory hash.
	/// Returns true if it was already known.
	pub fn filter_known_inventory(&self, hash: &Hash) -> bool {
		let mut filter = self.known_inventory.lock();
		if filter.contains_key(hash) {
			true
		} else {
			filter.insert(*hash, ());
			false
		}
	}

	/// Whether we relayed this hash to the peer recently; marks it if not.
	pub fn filter_sent_inventory(&self, hash: &Hash) -> bool {
		let mut filter = self.recently_sent_inv.lock();
		if filter.contains_key(hash) {
			true
		} else {
			filter.insert(*hash, ());
			false
		}
	}

	/// Fold a block response time (seconds) into the moving average and
	/// adapt the in-transit budget. Returns the smoothed average.
	pub fn record_block_response(&self, response_secs: f64) -> f64 {
		let mut avg = self.avg_blk_response_secs.lock();
		if *avg == 0.0 {
			*avg = response_secs;
		} else {
			*avg = (*avg * (RESPONSE_EWMA_SAMPLES - 1.0) + response_secs) / RESPONSE_EWMA_SAMPLES;
		}
		let transit = if *avg < 0.2 {
			64
		} else if *avg < 0.5 {
			56
		} else if *avg < 0.9 {
			48
		} else if *avg < 1.4 {
			32
		} else if *avg < 2.0 {
			24
		} else {
			16
		};
		self.max_blocks_in_transit.store(transit, Ordering::Relaxed);
		*avg
	}

	/// Smoothed block response time, seconds.
	pub fn avg_block_response_secs(&self) -> f64 {
		*self.avg_blk_response_secs.lock()
	}

	/// Current adaptive in-transit block budget, clamped to 8..=64.
	pub fn max_blocks_in_transit(&self) -> u32 {
		self.max_blocks_in_transit
			.load(Ordering::Relaxed)
			.max(8)
			.min(64)
	}

	/// Whether the peer can serve xthin blocks.
	pub fn xthin_capable(&self) -> bool {
		self.info.read().services.contains(Capabilities::XTHIN)
			|| self.xver.read().xthin_version > 0
	}

	/// Whether a mutually supported graphene version exists.
	pub fn graphene_capable(&self) -> bool {
		self.info.read().services.contains(Capabilities::GRAPHENE)
			&& self.xver.read().graphene_version > 0
	}

	/// Whether the peer negotiated compact blocks via sendcmpct.
	pub fn compact_capable(&self) -> bool {
		self.compact_version.load(Ordering::Relaxed) > 0
	}

	/// Whether the peer serves mempool synchronization.
	pub fn mempool_sync_capable(&self) -> bool {
		self.xver.read().mempool_sync_version > 0
	}

	/// Whether the peer is a full node able to serve blocks.
	pub fn can_serve_blocks(&self) -> bool {
		self.info.read().services.contains(Capabilities::NETWORK)
	}
}

impl std::fmt::Debug for Peer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Peer({} @ {})", self.id, self.addr)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_peer() -> Peer {
		Peer::new(
			1,
			"127.0.0.1:8333".parse().unwrap(),
			Direction::Outbound,
			[0xe3, 0xe1, 0xf3, 0xe8],
			2_000_000,
			1_000_000,
		)
	}

	#[test]
	fn connected_only_when_both_sides_ready() {
		let peer = test_peer();
		assert!(!peer.is_connected());
		peer.set_outgoing_state(OutgoingState::Ready);
		assert!(!peer.is_connected());
		peer.set_incoming_state(IncomingState::Ready);
		assert!(peer.is_connected());
	}

	#[test]
	fn ping_pong_latency() {
		let peer = test_peer();
		peer.ping_sent(7, 1_000_000);
		assert!(peer.pong_received(8, 1_400_000).is_none());
		assert_eq!(peer.pong_received(7, 1_400_000), Some(400_000));
		assert_eq!(peer.ping_latency_usec(), 400_000);
		assert_eq!(peer.ping_outstanding_usec(2_000_000), 0);
	}

	#[test]
	fn response_time_adapts_transit_budget() {
		let peer = test_peer();
		peer.record_block_response(0.1);
		assert_eq!(peer.max_blocks_in_transit(), 64);
		for _ in 0..500 {
			peer.record_block_response(3.0);
		}
		assert_eq!(peer.max_blocks_in_transit(), 16);
	}

	#[test]
	fn known_inventory_dedup() {
		let peer = test_peer();
		let h = crate::core::core::hash::sha256d(b"inv");
		assert!(!peer.filter_known_inventory(&h));
		assert!(peer.filter_known_inventory(&h));
	}
}
