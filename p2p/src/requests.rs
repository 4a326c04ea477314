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

//! The request manager creates an isolation layer between the message
//! processor and the network. It tracks known locations of data objects
//! and issues requests to the node most likely to respond, monitors
//! responses, and re-requests objects from alternative sources when a
//! node disconnects or does not respond. Message handlers never request
//! data from a peer directly; they call `ask_for` and later report
//! `received`, `rejected` or `already_received`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::blockrelay::common::{ThinType, ThinTypeRelay};
use crate::blockrelay::graphene::{GetGraphene, MempoolInfo};
use crate::blockrelay::thinblock::GetXthin;
use crate::bloom::BloomFilter;
use crate::core::consensus::MAX_INV_SZ;
use crate::core::core::hash::Hash;
use crate::core::core::inventory::{Inv, InvType};
use crate::msg::{Command, InvMsg};
use crate::nodestate::BlockAvailability;
use crate::peer::Peer;
use crate::peers::Peers;
use crate::shaper::LeakyBucket;
use crate::types::{ChainView, P2PConfig, PeerId, RejectCode, TxMempoolView};
use crate::util::Mutex;

/// Thin-type object requests allowed per decay window before a peer is
/// disconnected for request spam.
pub const MAX_THINTYPE_OBJECT_REQUESTS: f64 = 100.0;

/// Outbound request pacer: burst and sustained requests per second.
const REQUEST_PACER_BURST: i64 = 15_000;
const REQUEST_PACER_RATE: i64 = 10_000;

/// Batched getdata flush threshold per peer and pass.
const MAX_GETDATA_BATCH: usize = 1_000;

/// Block look-ahead: a block downloading for longer than this many base
/// retry intervals is re-eligible for request.
const LOOKAHEAD_MULTIPLIER: i64 = 6;

/// Outbound slots that must be busy before slow peers are pruned.
const BEGIN_PRUNING_PEERS: usize = 8;

/// A known source for an unknown object.
#[derive(Debug, Clone)]
struct RequestSource {
	peer: PeerId,
	desirability: i32,
}

/// One object we want but do not have.
struct UnknownObj {
	inv: Inv,
	priority: u32,
	rate_limited: bool,
	/// Data arrived and is being validated; do not re-request.
	processing: bool,
	/// Microseconds, zero means never requested.
	last_request_time_us: i64,
	outstanding_reqs: u32,
	available_from: VecDeque<RequestSource>,
	insert_seq: u64,
}

impl UnknownObj {
	fn new(inv: Inv, priority: u32, seq: u64) -> UnknownObj {
		UnknownObj {
			inv,
			priority,
			rate_limited: false,
			processing: false,
			last_request_time_us: 0,
			outstanding_reqs: 0,
			available_from: VecDeque::new(),
			insert_seq: seq,
		}
	}

	/// Add a source if not already present; sources are kept sorted by
	/// descending desirability.
	fn add_source(&mut self, peer: PeerId, desirability: i32) -> bool {
		if self.available_from.iter().any(|s| s.peer == peer) {
			return false;
		}
		let src = RequestSource { peer, desirability };
		let pos = self
			.available_from
			.iter()
			.position(|s| s.desirability < desirability)
			.unwrap_or(self.available_from.len());
		self.available_from.insert(pos, src);
		true
	}
}

/// A block in flight from one peer.
#[derive(Debug, Clone, Copy)]
struct QueuedBlock {
	hash: Hash,
	request_time_us: i64,
}

/// Request-manager state for one peer.
struct NodeState {
	blocks_in_flight: Vec<QueuedBlock>,
	/// When the head of `blocks_in_flight` started downloading.
	downloading_since_us: i64,
	availability: BlockAvailability,
	/// Peer proved too slow during IBD; drop once its queue drains.
	prune_when_drained: bool,
}

impl NodeState {
	fn new() -> NodeState {
		NodeState {
			blocks_in_flight: vec![],
			downloading_since_us: 0,
			availability: BlockAvailability::default(),
			prune_when_drained: false,
		}
	}
}

struct Inner {
	tx_map: BTreeMap<Hash, UnknownObj>,
	blk_map: BTreeMap<Hash, UnknownObj>,
	/// hash -> peers it is in flight from.
	blocks_in_flight: HashMap<Hash, HashMap<PeerId, ()>>,
	node_state: HashMap<PeerId, NodeState>,
	/// Round-robin resume point for the txn pass.
	tx_cursor: Option<Hash>,
	insert_seq: u64,
}

/// The asynchronous source-tracking request scheduler.
pub struct RequestManager {
	config: P2PConfig,
	chain: Arc<dyn ChainView>,
	mempool: Arc<dyn TxMempoolView>,
	thinrelay: Arc<ThinTypeRelay>,
	peers: Arc<Peers>,
	inner: Mutex<Inner>,
	pacer: Mutex<LeakyBucket>,
	/// Network-wide smoothed block response time, seconds.
	overall_response: Mutex<f64>,
	epoch: Instant,
}

impl RequestManager {
	/// Build the manager over its collaborators.
	pub fn new(
		config: P2PConfig,
		chain: Arc<dyn ChainView>,
		mempool: Arc<dyn TxMempoolView>,
		thinrelay: Arc<ThinTypeRelay>,
		peers: Arc<Peers>,
	) -> RequestManager {
		RequestManager {
			config,
			chain,
			mempool,
			thinrelay,
			peers,
			inner: Mutex::new(Inner {
				tx_map: BTreeMap::new(),
				blk_map: BTreeMap::new(),
				blocks_in_flight: HashMap::new(),
				node_state: HashMap::new(),
				tx_cursor: None,
				insert_seq: 0,
			}),
			pacer: Mutex::new(LeakyBucket::new(REQUEST_PACER_BURST, REQUEST_PACER_RATE)),
			overall_response: Mutex::new(0.0),
			epoch: Instant::now(),
		}
	}

	fn now_us(&self) -> i64 {
		// the scheduler clock starts at one second so that a stored zero
		// always means "never requested"
		self.epoch.elapsed().as_micros() as i64 + 1_000_000
	}

	/// Soft cap on tracked unknown transactions, scaled by the configured
	/// block size; the oldest entries are dropped past it.
	fn tx_map_cap(&self) -> usize {
		let per_mb = (self.config.excessive_block_size / 1_000_000).max(1) as usize;
		MAX_INV_SZ * 2 * per_mb
	}

	fn desirability(&self, peer: &Peer) -> i32 {
		let mut d = 0;
		if self.chain.is_chain_nearly_syncd()
			&& (peer.graphene_capable() || peer.xthin_capable() || peer.compact_capable())
		{
			d += 1;
		}
		let overall = *self.overall_response.lock();
		if overall > 0.0 && peer.avg_block_response_secs() > 2.0 * overall {
			d -= 1;
		}
		d
	}

	/// Register interest in one object, adding `peer` as a source.
	pub fn ask_for(&self, inv: &Inv, peer: &Arc<Peer>, priority: u32) {
		let mut inner = self.inner.lock();
		inner.insert_seq += 1;
		let seq = inner.insert_seq;
		let desirability = self.desirability(peer);

		match inv.kind {
			InvType::Tx => {
				// soft cap: drop the oldest entry to make room
				if inner.tx_map.len() >= self.tx_map_cap()
					&& !inner.tx_map.contains_key(&inv.hash)
				{
					if let Some(oldest) = inner
						.tx_map
						.iter()
						.filter(|(_, o)| !o.processing)
						.min_by_key(|(_, o)| o.insert_seq)
						.map(|(h, _)| *h)
					{
						debug!("txn request map full, dropping oldest entry {}", oldest);
						inner.tx_map.remove(&oldest);
					}
				}
				let entry = inner
					.tx_map
					.entry(inv.hash)
					.or_insert_with(|| UnknownObj::new(*inv, priority, seq));
				if !entry.processing {
					entry.priority = entry.priority.max(priority);
					entry.add_source(peer.id, desirability);
				}
			}
			_ => {
				let entry = inner
					.blk_map
					.entry(inv.hash)
					.or_insert_with(|| UnknownObj::new(*inv, priority, seq));
				if !entry.processing {
					entry.priority = entry.priority.max(priority);
					entry.add_source(peer.id, desirability);
				}
			}
		}
	}

	/// Batched `ask_for`.
	pub fn ask_for_batch(&self, invs: &[Inv], peer: &Arc<Peer>, priority: u32) {
		for inv in invs {
			self.ask_for(inv, peer, priority);
		}
	}

	/// As `ask_for_batch`, plus every other block-serving peer is added
	/// as a back-up source; during initial download any peer can serve the
	/// blocks we need, and without back-ups a timeout would leave an
	/// entry with no one left to ask.
	pub fn ask_for_during_ibd(&self, invs: &[Inv], selected: &Arc<Peer>, priority: u32) {
		self.ask_for_batch(invs, selected, priority);
		for other in self.peers.connected_peers() {
			if other.id == selected.id || !other.is_connected() || !other.can_serve_blocks() {
				continue;
			}
			for inv in invs {
				self.ask_for(inv, &other, priority);
			}
		}
	}

	/// Whether a block is already tracked (requested or in flight).
	pub fn already_asked_for_block(&self, hash: &Hash) -> bool {
		let inner = self.inner.lock();
		inner
			.blk_map
			.get(hash)
			.map(|o| o.last_request_time_us > 0)
			.unwrap_or(false)
			|| inner.blocks_in_flight.contains_key(hash)
	}

	/// The object arrived. Removes the entry and updates latency samples.
	pub fn received(&self, inv: &Inv, peer: &Arc<Peer>) {
		let now = self.now_us();
		match inv.kind {
			InvType::Tx => {
				self.inner.lock().tx_map.remove(&inv.hash);
			}
			_ => {
				self.mark_block_as_received(&inv.hash, peer, now);
				self.inner.lock().blk_map.remove(&inv.hash);
			}
		}
	}

	/// The object arrived but we already had it: remove bookkeeping
	/// without touching latency samples.
	pub fn already_received(&self, peer: &Arc<Peer>, inv: &Inv) {
		match inv.kind {
			InvType::Tx => {
				self.inner.lock().tx_map.remove(&inv.hash);
			}
			_ => {
				self.remove_block_in_flight(&inv.hash, peer.id);
				self.inner.lock().blk_map.remove(&inv.hash);
				self.thinrelay.block_was_received(peer.id, &inv.hash);
			}
		}
	}

	/// The peer explicitly rejected our request.
	pub fn rejected(&self, inv: &Inv, peer: PeerId, reason: Option<RejectCode>) {
		let mut inner = self.inner.lock();
		let map = match inv.kind {
			InvType::Tx => &mut inner.tx_map,
			_ => &mut inner.blk_map,
		};
		if let Some(entry) = map.get_mut(&inv.hash) {
			entry.outstanding_reqs = entry.outstanding_reqs.saturating_sub(1);
			entry.available_from.retain(|s| s.peer != peer);
			if reason == Some(RejectCode::InsufficientFee) {
				// age out instead of hammering other peers with a txn
				// nobody will accept
				entry.rate_limited = true;
			}
		}
	}

	/// Data for this txn arrived and entered validation: stop tracking
	/// sources so disconnects are not blocked on us.
	pub fn processing_txn(&self, hash: &Hash, _peer: &Arc<Peer>) {
		let mut inner = self.inner.lock();
		if let Some(entry) = inner.tx_map.get_mut(hash) {
			entry.processing = true;
			entry.available_from.clear();
		}
	}

	/// A block entered validation: keep the sources so a bad block can be
	/// re-attempted from someone else.
	pub fn processing_block(&self, hash: &Hash, _peer: &Arc<Peer>) {
		let mut inner = self.inner.lock();
		if let Some(entry) = inner.blk_map.get_mut(hash) {
			entry.processing = true;
		}
	}

	/// Validation rejected the block: clear the processing latch so the
	/// scheduler may try another source.
	pub fn block_rejected(&self, inv: &Inv, peer: PeerId) {
		{
			let mut inner = self.inner.lock();
			if let Some(entry) = inner.blk_map.get_mut(&inv.hash) {
				entry.processing = false;
			}
		}
		self.remove_block_in_flight(&inv.hash, peer);
		self.thinrelay.clear_all_block_data(peer, &inv.hash);
	}

	fn block_retry_interval_us(&self) -> i64 {
		let base = self.config.blk_retry_interval_us;
		if self.is_traffic_shaped() {
			base * 6
		} else if self.chain.is_initial_block_download() {
			base * 2
		} else {
			base
		}
	}

	fn txn_retry_interval_us(&self) -> i64 {
		let base = self.config.tx_retry_interval_us;
		if self.is_traffic_shaped() {
			base * 24
		} else if self.chain.is_initial_block_download() {
			base * 8
		} else {
			base
		}
	}

	fn is_traffic_shaped(&self) -> bool {
		self.config.send_shaper.is_some() || self.config.recv_shaper.is_some()
	}

	/// One scheduling pass over both maps: emit due requests, fail over
	/// exhausted entries, and batch txn getdata per peer.
	pub fn send_requests(&self) {
		let now = self.now_us();
		self.send_block_requests(now);
		self.send_txn_requests(now);
	}

	fn send_block_requests(&self, now: i64) {
		let interval = self.block_retry_interval_us();
		let lookahead = self.config.blk_retry_interval_us * LOOKAHEAD_MULTIPLIER;
		let ibd = self.chain.is_initial_block_download();

		// decide under the lock, send after dropping it
		let mut to_request: Vec<(Hash, Inv, PeerId)> = vec![];
		{
			let mut inner = self.inner.lock();
			let hashes: Vec<Hash> = inner.blk_map.keys().cloned().collect();
			for hash in hashes {
				let source = {
					let downloading_since = inner
						.blocks_in_flight
						.get(&hash)
						.and_then(|peers| peers.keys().next().cloned())
						.and_then(|p| inner.node_state.get(&p))
						.map(|s| s.downloading_since_us)
						.unwrap_or(0);
					let entry = match inner.blk_map.get_mut(&hash) {
						Some(e) => e,
						None => continue,
					};
					if entry.processing {
						continue;
					}
					let due = entry.last_request_time_us == 0
						|| now - entry.last_request_time_us > interval
						|| (downloading_since != 0 && now - downloading_since > lookahead);
					if !due {
						continue;
					}
					entry.available_from.pop_front()
				};
				match source {
					Some(src) => to_request.push((hash, inner.blk_map[&hash].inv, src.peer)),
					None => {
						// a peer disconnected before we could ask anyone
						debug!("no sources left for block {}, dropping request", hash);
						inner.blk_map.remove(&hash);
					}
				}
			}
		}

		// During IBD full-block requests are batched into one getdata per
		// peer instead of a message per block.
		let mut batches: HashMap<PeerId, Vec<Inv>> = HashMap::new();
		for (hash, inv, peer_id) in to_request {
			let peer = match self.peers.get_peer(peer_id) {
				Some(p) if p.is_connected() && !p.should_disconnect() => p,
				_ => {
					// source died; put the entry back in line for the next pass
					let mut inner = self.inner.lock();
					if let Some(entry) = inner.blk_map.get_mut(&hash) {
						entry.available_from.retain(|s| s.peer != peer_id);
					}
					continue;
				}
			};
			let batch = if ibd { Some(&mut batches) } else { None };
			let requested = self.request_block_inner(&peer, &inv, batch);
			let mut inner = self.inner.lock();
			if let Some(entry) = inner.blk_map.get_mut(&hash) {
				if requested {
					entry.last_request_time_us = now;
					entry.outstanding_reqs += 1;
				} else {
					// e.g. preferential timer still running and this peer
					// cannot serve a thin type: retain the source
					entry.add_source(peer.id, self.desirability(&peer));
				}
			}
		}

		for (peer_id, invs) in batches {
			if invs.is_empty() {
				continue;
			}
			if let Some(peer) = self.peers.get_peer(peer_id) {
				let _ = peer.send_msg(Command::GetData, &InvMsg { invs });
			}
		}
	}

	fn send_txn_requests(&self, now: i64) {
		let interval = self.txn_retry_interval_us();
		let mut batches: HashMap<PeerId, Vec<Inv>> = HashMap::new();

		let mut paced_out = false;
		{
			let mut inner = self.inner.lock();
			let start = inner.tx_cursor;
			let keys: Vec<Hash> = match start {
				Some(cursor) => inner
					.tx_map
					.range(cursor..)
					.skip(1)
					.map(|(h, _)| *h)
					.chain(inner.tx_map.range(..=cursor).map(|(h, _)| *h))
					.collect(),
				None => inner.tx_map.keys().cloned().collect(),
			};

			for hash in keys {
				let entry = match inner.tx_map.get_mut(&hash) {
					Some(e) => e,
					None => continue,
				};
				if entry.processing || entry.rate_limited {
					continue;
				}
				if entry.last_request_time_us != 0
					&& now - entry.last_request_time_us <= interval
				{
					continue;
				}
				if !self.pacer.lock().try_leak(1) {
					inner.tx_cursor = Some(hash);
					paced_out = true;
					break;
				}
				match entry.available_from.pop_front() {
					Some(src) => {
						entry.last_request_time_us = now;
						entry.outstanding_reqs += 1;
						let batch = batches.entry(src.peer).or_insert_with(Vec::new);
						batch.push(entry.inv);
					}
					None => {
						inner.tx_map.remove(&hash);
					}
				}
			}
			if !paced_out {
				inner.tx_cursor = None;
			}
		}

		for (peer_id, invs) in batches {
			if let Some(peer) = self.peers.get_peer(peer_id) {
				for chunk in invs.chunks(MAX_GETDATA_BATCH) {
					let _ = peer.send_msg(
						Command::GetData,
						&InvMsg {
							invs: chunk.to_vec(),
						},
					);
				}
			}
		}
	}

	/// Request a single block from this peer, choosing graphene, then
	/// xthin, then compact while the preferential timer runs, and a full
	/// block once it expired (or when thin relay is disabled). Returns
	/// false when no request was emitted and the source should be kept.
	pub fn request_block(&self, peer: &Arc<Peer>, inv: &Inv) -> bool {
		self.request_block_inner(peer, inv, None)
	}

	fn request_block_inner(
		&self,
		peer: &Arc<Peer>,
		inv: &Inv,
		full_block_batch: Option<&mut HashMap<PeerId, Vec<Inv>>>,
	) -> bool {
		let hash = inv.hash;
		let timer_enabled = self.thinrelay.is_timer_enabled();
		let timer_expired = self.thinrelay.has_timer_expired(&hash);

		if self.chain.is_chain_nearly_syncd() && (!timer_expired || !timer_enabled) {
			// graphene first, the leanest representation
			if self.config.use_graphene && peer.graphene_capable() {
				if self
					.thinrelay
					.add_in_flight(peer.id, &hash, ThinType::Graphene)
				{
					self.mark_block_as_in_flight(peer.id, &hash);
					let pool_hashes = self.mempool.query_hashes();
					let msg = GetGraphene {
						inv: Inv::new(InvType::GrapheneBlock, hash),
						mempool_info: MempoolInfo {
							tx_count: pool_hashes.len() as u64,
							filter_pref: peer.xver.read().fast_filter_pref,
						},
					};
					let _ = peer.send_msg(Command::GetGraphene, &msg);
					debug!("requesting graphene block {} from peer {}", hash, peer.id);
					return true;
				}
			}

			// xthin when graphene is not possible
			if self.config.use_thinblocks && peer.xthin_capable() {
				if self.thinrelay.add_in_flight(peer.id, &hash, ThinType::Xthin) {
					self.mark_block_as_in_flight(peer.id, &hash);
					let pool_hashes = self.mempool.query_hashes();
					let mut filter =
						BloomFilter::new(pool_hashes.len(), 0.0001, rand::thread_rng().gen(), 0);
					for txid in &pool_hashes {
						filter.insert(txid.as_bytes());
					}
					let msg = GetXthin {
						inv: Inv::new(InvType::XthinBlock, hash),
						filter,
					};
					let _ = peer.send_msg(Command::GetXthin, &msg);
					debug!("requesting xthinblock {} from peer {}", hash, peer.id);
					return true;
				}
			}

			// compact when neither graphene nor xthin is possible
			if self.config.use_compact_blocks && peer.compact_capable() {
				if self
					.thinrelay
					.add_in_flight(peer.id, &hash, ThinType::Compact)
				{
					self.mark_block_as_in_flight(peer.id, &hash);
					let msg = InvMsg {
						invs: vec![Inv::new(InvType::CmpctBlock, hash)],
					};
					let _ = peer.send_msg(Command::GetData, &msg);
					debug!("requesting compact block {} from peer {}", hash, peer.id);
					return true;
				}
			}
		}

		// full block once the relay timer expired or preferential relay
		// is off entirely
		if !self.chain.is_chain_nearly_syncd() || timer_expired || !timer_enabled {
			self.mark_block_as_in_flight(peer.id, &hash);
			match full_block_batch {
				Some(batches) => {
					batches
						.entry(peer.id)
						.or_insert_with(Vec::new)
						.push(Inv::new(InvType::Block, hash));
				}
				None => {
					let msg = InvMsg {
						invs: vec![Inv::new(InvType::Block, hash)],
					};
					let _ = peer.send_msg(Command::GetData, &msg);
				}
			}
			debug!("requesting regular block {} from peer {}", hash, peer.id);
			return true;
		}
		false
	}

	/// Ensure a node-state entry exists for a fresh peer.
	pub fn init_node_state(&self, peer: PeerId) {
		self.inner
			.lock()
			.node_state
			.entry(peer)
			.or_insert_with(NodeState::new);
	}

	/// Tear down a disconnecting peer: its in-flight blocks become
	/// immediately re-requestable from other sources.
	pub fn remove_node_state(&self, peer: PeerId) {
		let mut inner = self.inner.lock();
		let in_flight: Vec<Hash> = inner
			.node_state
			.remove(&peer)
			.map(|s| s.blocks_in_flight.iter().map(|q| q.hash).collect())
			.unwrap_or_default();
		for hash in in_flight {
			if let Some(peers) = inner.blocks_in_flight.get_mut(&hash) {
				peers.remove(&peer);
				if peers.is_empty() {
					inner.blocks_in_flight.remove(&hash);
				}
			}
			// reset the retry gate so the next pass can re-ask at once
			if let Some(entry) = inner.blk_map.get_mut(&hash) {
				entry.last_request_time_us = 0;
				entry.available_from.retain(|s| s.peer != peer);
			}
			if let Some(entry) = inner.tx_map.get_mut(&hash) {
				entry.available_from.retain(|s| s.peer != peer);
			}
		}
	}

	/// Record a getdata for `hash` sent to `peer`. A hash may be in
	/// flight from several peers, but only once per peer.
	pub fn mark_block_as_in_flight(&self, peer: PeerId, hash: &Hash) {
		let now = self.now_us();
		let mut inner = self.inner.lock();
		let already = inner
			.blocks_in_flight
			.get(hash)
			.map(|m| m.contains_key(&peer))
			.unwrap_or(false);
		if already {
			return;
		}
		inner
			.blocks_in_flight
			.entry(*hash)
			.or_insert_with(HashMap::new)
			.insert(peer, ());
		let state = inner.node_state.entry(peer).or_insert_with(NodeState::new);
		if state.blocks_in_flight.is_empty() {
			state.downloading_since_us = now;
		}
		state.blocks_in_flight.push(QueuedBlock {
			hash: *hash,
			request_time_us: now,
		});
		if let Some(p) = self.peers.get_peer(peer) {
			p.blocks_in_flight
				.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		}
	}

	fn remove_block_in_flight(&self, hash: &Hash, peer: PeerId) -> Option<i64> {
		let mut inner = self.inner.lock();
		if let Some(peers) = inner.blocks_in_flight.get_mut(hash) {
			peers.remove(&peer);
			if peers.is_empty() {
				inner.blocks_in_flight.remove(hash);
			}
		}
		let now = self.now_us();
		let state = inner.node_state.get_mut(&peer)?;
		let pos = state.blocks_in_flight.iter().position(|q| q.hash == *hash)?;
		let queued = state.blocks_in_flight.remove(pos);
		state.downloading_since_us = if state.blocks_in_flight.is_empty() {
			0
		} else {
			now
		};
		if let Some(p) = self.peers.get_peer(peer) {
			p.blocks_in_flight
				.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
		}
		Some(queued.request_time_us)
	}

	/// Record a block arrival: update the peer's response-time average,
	/// the network-wide average, and prune chronically slow peers during
	/// initial download.
	pub fn mark_block_as_received(&self, hash: &Hash, peer: &Arc<Peer>, now_us: i64) -> bool {
		let request_time = match self.remove_block_in_flight(hash, peer.id) {
			Some(t) => t,
			None => return false,
		};
		self.thinrelay.block_was_received(peer.id, hash);

		let response_secs = (now_us - request_time) as f64 / 1_000_000.0;
		let peer_avg = peer.record_block_response(response_secs);

		let overall = {
			let mut overall = self.overall_response.lock();
			let n = (self.config.max_outbound * 50) as f64;
			if *overall == 0.0 {
				*overall = response_secs;
			} else {
				*overall = (*overall * (n - 1.0) + response_secs) / n;
			}
			*overall
		};

		if self.chain.is_initial_block_download()
			&& self.peers.outbound_count() >= BEGIN_PRUNING_PEERS
			&& peer_avg > 4.0 * overall
		{
			let mut inner = self.inner.lock();
			if let Some(state) = inner.node_state.get_mut(&peer.id) {
				if state.blocks_in_flight.is_empty() {
					info!(
						"disconnecting peer {}: response time {:.2}s vs overall {:.2}s",
						peer.id, peer_avg, overall
					);
					peer.request_disconnect();
				} else if !state.prune_when_drained {
					debug!("peer {} marked for pruning once drained", peer.id);
					state.prune_when_drained = true;
				}
			}
		} else {
			let mut inner = self.inner.lock();
			if let Some(state) = inner.node_state.get_mut(&peer.id) {
				if state.prune_when_drained && state.blocks_in_flight.is_empty() {
					peer.request_disconnect();
				}
			}
		}
		true
	}

	/// Blocks currently in flight from one peer.
	pub fn blocks_in_flight_count(&self, peer: PeerId) -> usize {
		self.inner
			.lock()
			.node_state
			.get(&peer)
			.map(|s| s.blocks_in_flight.len())
			.unwrap_or(0)
	}

	/// Update which block the peer is assumed to have.
	pub fn update_block_availability(&self, peer: PeerId, hash: Hash) {
		let chain = self.chain.clone();
		let mut inner = self.inner.lock();
		let state = inner.node_state.entry(peer).or_insert_with(NodeState::new);
		state.availability.update(hash, |h| chain.lookup(h));
	}

	/// Promote a stashed unknown announcement if it resolved since.
	pub fn process_block_availability(&self, peer: PeerId) {
		let chain = self.chain.clone();
		let mut inner = self.inner.lock();
		if let Some(state) = inner.node_state.get_mut(&peer) {
			state.availability.process_pending(|h| chain.lookup(h));
		}
	}

	/// Top up this peer's block download pipeline from its best-known
	/// chain, within the download window and its adaptive transit budget.
	pub fn request_next_blocks_to_download(&self, peer: &Arc<Peer>) {
		let in_flight = self.blocks_in_flight_count(peer.id);
		let budget = (peer.max_blocks_in_transit() as usize).saturating_sub(in_flight);
		if budget == 0 {
			return;
		}
		let to_fetch = self.find_next_blocks_to_download(peer, budget);
		if to_fetch.is_empty() {
			return;
		}
		let invs: Vec<Inv> = to_fetch
			.iter()
			.map(|h| Inv::new(InvType::Block, *h))
			.collect();
		if self.chain.is_initial_block_download() {
			self.ask_for_during_ibd(&invs, peer, 0);
		} else {
			self.ask_for_batch(&invs, peer, 0);
		}
	}

	/// Walk from the last common block toward the peer's best-known
	/// block, skipping what we have or already asked this peer for,
	/// bounded by the download window.
	pub fn find_next_blocks_to_download(&self, peer: &Arc<Peer>, count: usize) -> Vec<Hash> {
		let chain = self.chain.clone();
		let tip = chain.tip();

		let (best_known, last_common) = {
			let mut inner = self.inner.lock();
			let state = match inner.node_state.get_mut(&peer.id) {
				Some(s) => s,
				None => return vec![],
			};
			state.availability.process_pending(|h| chain.lookup(h));

			let best_known = match state.availability.best_known_block {
				Some(b) => b,
				None => return vec![],
			};
			if best_known.work <= tip.work {
				// nothing interesting in the peer's chain
				return vec![];
			}
			let last_common = match state.availability.last_common_block {
				Some(c) => c,
				None => match chain.last_common_ancestor(&best_known.hash) {
					Some(c) => {
						state.availability.last_common_block = Some(c);
						c
					}
					None => return vec![],
				},
			};
			(best_known, last_common)
		};

		let window_end = tip.height + self.config.block_download_window;
		let candidates = chain.next_blocks_toward(
			&last_common.hash,
			&best_known.hash,
			count.min(128) * 4,
		);

		let mut inner = self.inner.lock();
		let mut out = vec![];
		for info in candidates {
			if info.height > window_end {
				break;
			}
			if out.len() >= count {
				break;
			}
			let in_flight_here = inner
				.blocks_in_flight
				.get(&info.hash)
				.map(|m| m.contains_key(&peer.id))
				.unwrap_or(false);
			if in_flight_here {
				continue;
			}
			if chain.contains(&info.hash) {
				// already connected; advance the shared prefix
				if let Some(state) = inner.node_state.get_mut(&peer.id) {
					state.availability.last_common_block = Some(info);
				}
				continue;
			}
			out.push(info.hash);
		}
		out
	}

	/// Decay-and-bump the peer's thin-object request counter and
	/// disconnect on request spam.
	pub fn check_for_request_dos(&self, peer: &Arc<Peer>, now_secs: i64) -> bool {
		if self.config.regtest || self.config.is_whitelisted(&peer.addr.ip()) {
			return false;
		}
		let count = peer.request_counter.lock().bump(now_secs, 1.0);
		if count >= MAX_THINTYPE_OBJECT_REQUESTS {
			warn!(
				"disconnecting peer {}: {} thin-type object requests",
				peer.id, count as u64
			);
			peer.request_disconnect();
			true
		} else {
			false
		}
	}

	/// The network-wide smoothed block response time.
	pub fn overall_response_secs(&self) -> f64 {
		*self.overall_response.lock()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::block::{Block, BlockHeader};
	use crate::core::core::hash::sha256d;
	use crate::core::core::transaction::TxRef;
	use crate::types::{BlockIndexInfo, Direction, DosManager};
	use std::net::IpAddr;
	use std::sync::atomic::{AtomicBool, Ordering};

	struct NullDos;
	impl DosManager for NullDos {
		fn misbehaving(&self, _p: PeerId, _pts: i32, _r: &str) -> bool {
			false
		}
		fn ban(&self, _a: &IpAddr, _s: &str, _r: &str, _secs: i64) {}
		fn is_banned(&self, _a: &IpAddr) -> bool {
			false
		}
	}

	struct TestChain {
		near_sync: AtomicBool,
		ibd: AtomicBool,
	}

	impl TestChain {
		fn new() -> TestChain {
			TestChain {
				near_sync: AtomicBool::new(true),
				ibd: AtomicBool::new(false),
			}
		}
	}

	impl ChainView for TestChain {
		fn tip(&self) -> BlockIndexInfo {
			BlockIndexInfo {
				hash: sha256d(b"tip"),
				prev_hash: Hash::default(),
				height: 100,
				work: 1000,
				time: 0,
			}
		}
		fn best_header(&self) -> BlockIndexInfo {
			self.tip()
		}
		fn contains(&self, _h: &Hash) -> bool {
			false
		}
		fn locator(&self) -> Vec<Hash> {
			vec![self.tip().hash]
		}
		fn lookup(&self, _h: &Hash) -> Option<BlockIndexInfo> {
			None
		}
		fn next_blocks_toward(
			&self,
			_l: &Hash,
			_b: &Hash,
			_max: usize,
		) -> Vec<BlockIndexInfo> {
			vec![]
		}
		fn last_common_ancestor(&self, _h: &Hash) -> Option<BlockIndexInfo> {
			None
		}
		fn read_block(&self, _h: &Hash) -> Option<Block> {
			None
		}
		fn locate_headers(&self, _l: &[Hash], _m: usize) -> Vec<BlockHeader> {
			vec![]
		}
		fn accept_block_header(
			&self,
			_h: &BlockHeader,
		) -> Result<BlockIndexInfo, RejectCode> {
			Err(RejectCode::Invalid)
		}
		fn is_initial_block_download(&self) -> bool {
			self.ibd.load(Ordering::Relaxed)
		}
		fn is_chain_nearly_syncd(&self) -> bool {
			self.near_sync.load(Ordering::Relaxed)
		}
		fn can_serve_block(&self, _h: &Hash) -> bool {
			true
		}
	}

	struct EmptyPool;
	impl TxMempoolView for EmptyPool {
		fn query_hashes(&self) -> Vec<Hash> {
			vec![]
		}
		fn get(&self, _h: &Hash) -> Option<TxRef> {
			None
		}
		fn contains(&self, _h: &Hash) -> bool {
			false
		}
		fn submit(&self, _tx: TxRef, _from: PeerId) {}
		fn add_double_spend_proof(&self, _p: &[u8]) -> Option<TxRef> {
			None
		}
	}

	fn setup() -> (Arc<Peers>, RequestManager, Arc<TestChain>) {
		let mut config = P2PConfig::default();
		// full-block only so request_block does not depend on negotiation
		config.use_graphene = false;
		config.use_thinblocks = false;
		config.use_compact_blocks = false;
		let chain = Arc::new(TestChain::new());
		let peers = Arc::new(Peers::new(config.clone(), Arc::new(NullDos)));
		let relay = Arc::new(ThinTypeRelay::new(config.clone()));
		let rm = RequestManager::new(
			config,
			chain.clone(),
			Arc::new(EmptyPool),
			relay,
			peers.clone(),
		);
		(peers, rm, chain)
	}

	fn add_peer(peers: &Peers, n: u16) -> Arc<Peer> {
		let id = peers.next_peer_id();
		let peer = peers.add_connected(Peer::new(
			id,
			format!("127.0.0.1:{}", 20000 + n).parse().unwrap(),
			Direction::Outbound,
			[0xe3, 0xe1, 0xf3, 0xe8],
			2_000_000,
			0,
		));
		peer.set_outgoing_state(crate::peer::OutgoingState::Ready);
		peer.set_incoming_state(crate::peer::IncomingState::Ready);
		peer
	}

	#[test]
	fn retry_gate_holds_until_interval() {
		let (peers, rm, _chain) = setup();
		let peer = add_peer(&peers, 1);
		let inv = Inv::new(InvType::Block, sha256d(b"wanted"));

		rm.ask_for(&inv, &peer, 0);
		rm.send_requests();
		assert_eq!(peer.send_queue.lock().len(), 1);

		// a second pass within the retry interval must not re-request
		rm.send_requests();
		assert_eq!(peer.send_queue.lock().len(), 1);
	}

	#[test]
	fn entry_dropped_when_sources_exhausted() {
		let (peers, rm, _chain) = setup();
		let peer = add_peer(&peers, 2);
		let inv = Inv::new(InvType::Block, sha256d(b"gone"));

		rm.ask_for(&inv, &peer, 0);
		peers.remove(peer.id);
		rm.send_requests();
		// entry deleted: re-asking starts fresh
		assert!(!rm.already_asked_for_block(&inv.hash));
	}

	#[test]
	fn in_flight_once_per_peer() {
		let (peers, rm, _chain) = setup();
		let peer = add_peer(&peers, 3);
		let hash = sha256d(b"block");

		rm.mark_block_as_in_flight(peer.id, &hash);
		rm.mark_block_as_in_flight(peer.id, &hash);
		assert_eq!(rm.blocks_in_flight_count(peer.id), 1);

		// parallel fetch from a second peer is allowed
		let peer2 = add_peer(&peers, 4);
		rm.mark_block_as_in_flight(peer2.id, &hash);
		assert_eq!(rm.blocks_in_flight_count(peer2.id), 1);

		assert!(rm.mark_block_as_received(&hash, &peer, rm.now_us()));
		assert_eq!(rm.blocks_in_flight_count(peer.id), 0);
		assert_eq!(rm.blocks_in_flight_count(peer2.id), 1);
	}

	#[test]
	fn processing_txn_clears_sources_but_block_keeps_them() {
		let (peers, rm, _chain) = setup();
		let peer = add_peer(&peers, 5);

		let tx_inv = Inv::new(InvType::Tx, sha256d(b"txn"));
		rm.ask_for(&tx_inv, &peer, 0);
		rm.processing_txn(&tx_inv.hash, &peer);
		{
			let inner = rm.inner.lock();
			let entry = inner.tx_map.get(&tx_inv.hash).unwrap();
			assert!(entry.processing);
			assert!(entry.available_from.is_empty());
		}

		let blk_inv = Inv::new(InvType::Block, sha256d(b"blk"));
		rm.ask_for(&blk_inv, &peer, 0);
		rm.processing_block(&blk_inv.hash, &peer);
		{
			let inner = rm.inner.lock();
			let entry = inner.blk_map.get(&blk_inv.hash).unwrap();
			assert!(entry.processing);
			assert_eq!(entry.available_from.len(), 1);
		}

		// a rejected block becomes requestable again
		rm.block_rejected(&blk_inv, peer.id);
		{
			let inner = rm.inner.lock();
			assert!(!inner.blk_map.get(&blk_inv.hash).unwrap().processing);
		}
	}

	#[test]
	fn insufficient_fee_rate_limits_txn() {
		let (peers, rm, _chain) = setup();
		let peer = add_peer(&peers, 6);
		let inv = Inv::new(InvType::Tx, sha256d(b"feetx"));

		rm.ask_for(&inv, &peer, 0);
		rm.rejected(&inv, peer.id, Some(RejectCode::InsufficientFee));
		{
			let inner = rm.inner.lock();
			assert!(inner.tx_map.get(&inv.hash).unwrap().rate_limited);
		}
		// rate-limited entries are skipped by the scheduler
		rm.send_requests();
		assert_eq!(peer.send_queue.lock().len(), 0);
	}

	#[test]
	fn preferential_timer_gates_full_block_fallback() {
		// thin relay enabled with a short timer: a full-block-only peer
		// must wait out the preferential window before getting asked
		let mut config = P2PConfig::default();
		config.use_thinblocks = true;
		config.use_graphene = false;
		config.use_compact_blocks = false;
		config.preferential_timer_ms = 30;

		let chain = Arc::new(TestChain::new());
		let peers = Arc::new(Peers::new(config.clone(), Arc::new(NullDos)));
		let relay = Arc::new(ThinTypeRelay::new(config.clone()));
		let rm = RequestManager::new(
			config,
			chain.clone(),
			Arc::new(EmptyPool),
			relay.clone(),
			peers.clone(),
		);

		// an xthin-capable peer elsewhere keeps the timer machinery armed
		let thin_peer = add_peer(&peers, 8);
		thin_peer.info.write().services = crate::types::Capabilities::XTHIN;
		relay.add_peer(&thin_peer);
		assert!(relay.is_timer_enabled());

		let full_peer = add_peer(&peers, 9);
		let inv = Inv::new(InvType::Block, sha256d(b"pref"));

		// while the timer runs, the full-block peer cannot serve a thin
		// type, so no request goes out and the caller keeps the source
		assert!(!rm.request_block(&full_peer, &inv));
		assert_eq!(full_peer.send_queue.lock().len(), 0);

		std::thread::sleep(std::time::Duration::from_millis(50));
		assert!(rm.request_block(&full_peer, &inv));
		assert_eq!(full_peer.send_queue.lock().len(), 1);
	}

	#[test]
	fn request_dos_cap_disconnects() {
		let (peers, rm, _chain) = setup();
		let peer = add_peer(&peers, 7);
		for _ in 0..99 {
			assert!(!rm.check_for_request_dos(&peer, 1000));
		}
		assert!(rm.check_for_request_dos(&peer, 1000));
		assert!(peer.should_disconnect());
	}
}
