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

//! State shared by every thin-type relay scheme: the global in-flight
//! registry with its six-slot cap, the preferential-relay timer, and the
//! per-(peer, hash) reconstruction slots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::consensus;
use crate::core::core::block::BlockHeader;
use crate::core::core::hash::Hash;
use crate::core::core::transaction::TxRef;
use crate::peer::Peer;
use crate::types::{P2PConfig, PeerId};
use crate::util::Mutex;

/// Cap on simultaneous thin-type block downloads across all peers.
pub const MAX_THINTYPE_BLOCKS_IN_FLIGHT: usize = 6;

/// Download timeout: this many base retry intervals without the block
/// arriving disconnects the peer.
const DOWNLOAD_TIMEOUT_MULTIPLIER: u32 = 6;

/// The thin-type block relay families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThinType {
	/// Xthin relay.
	Xthin,
	/// Graphene relay.
	Graphene,
	/// Compact-block relay.
	Compact,
}

#[derive(Debug)]
struct InFlightEntry {
	hash: Hash,
	requested: Instant,
	received: bool,
	kind: ThinType,
}

struct RelayTimer {
	start: Instant,
	/// Jittered effective timeout for this hash.
	timeout: Duration,
	warned: bool,
}

/// A block being reassembled from one or more thin representations. Every
/// scheme contributes the transactions it manages to collect, so a
/// fallback via another scheme picks up where the first one stopped.
pub struct ReconstructionSlot {
	/// Header of the block under reconstruction, once known.
	pub header: Option<BlockHeader>,
	/// Everything gathered so far, keyed by txid.
	pub collected: HashMap<Hash, TxRef>,
	/// Partially decoded xthin state.
	pub thin: Option<crate::blockrelay::thinblock::ThinBlockData>,
	/// Partially decoded graphene state.
	pub graphene: Option<crate::blockrelay::graphene::GrapheneData>,
	/// Partially decoded compact state.
	pub compact: Option<crate::blockrelay::compactblock::CompactData>,
	/// Running total of bytes buffered for this block.
	pub total_bytes: u64,
}

impl ReconstructionSlot {
	fn new() -> ReconstructionSlot {
		ReconstructionSlot {
			header: None,
			collected: HashMap::new(),
			thin: None,
			graphene: None,
			compact: None,
			total_bytes: 0,
		}
	}
}

/// Shared handle to a reconstruction slot.
pub type SlotRef = Arc<Mutex<ReconstructionSlot>>;

/// The thin-type relay registry.
pub struct ThinTypeRelay {
	config: P2PConfig,
	in_flight: Mutex<HashMap<PeerId, Vec<InFlightEntry>>>,
	timers: Mutex<HashMap<Hash, RelayTimer>>,
	reconstruct: Mutex<HashMap<PeerId, HashMap<Hash, SlotRef>>>,
	thin_peers: Mutex<HashSet<PeerId>>,
	graphene_peers: Mutex<HashSet<PeerId>>,
	compact_peers: Mutex<HashSet<PeerId>>,
}

impl ThinTypeRelay {
	/// New registry for the given configuration.
	pub fn new(config: P2PConfig) -> ThinTypeRelay {
		ThinTypeRelay {
			config,
			in_flight: Mutex::new(HashMap::new()),
			timers: Mutex::new(HashMap::new()),
			reconstruct: Mutex::new(HashMap::new()),
			thin_peers: Mutex::new(HashSet::new()),
			graphene_peers: Mutex::new(HashSet::new()),
			compact_peers: Mutex::new(HashSet::new()),
		}
	}

	/// Register a freshly negotiated peer with every scheme it speaks.
	pub fn add_peer(&self, peer: &Peer) {
		if peer.xthin_capable() {
			self.thin_peers.lock().insert(peer.id);
		}
		if peer.graphene_capable() {
			self.graphene_peers.lock().insert(peer.id);
		}
		if peer.compact_capable() {
			self.compact_peers.lock().insert(peer.id);
		}
	}

	/// Register a peer for compact relay after a late sendcmpct.
	pub fn add_compact_peer(&self, id: PeerId) {
		self.compact_peers.lock().insert(id);
	}

	/// Forget a disconnecting peer everywhere.
	pub fn remove_peer(&self, id: PeerId) {
		self.thin_peers.lock().remove(&id);
		self.graphene_peers.lock().remove(&id);
		self.compact_peers.lock().remove(&id);
		self.clear_all_in_flight(id);
		self.clear_all_blocks_to_reconstruct(id);
	}

	/// Peers registered per scheme.
	pub fn peer_counts(&self) -> (usize, usize, usize) {
		(
			self.thin_peers.lock().len(),
			self.graphene_peers.lock().len(),
			self.compact_peers.lock().len(),
		)
	}

	/// Whether the preferential-relay timer mechanism is active at all:
	/// a zero base disables it, as does a scheme configuration where
	/// either nothing or everything is thin-capable, or no enabled scheme
	/// has a peer to serve it.
	pub fn is_timer_enabled(&self) -> bool {
		if self.config.preferential_timer_ms == 0 {
			return false;
		}
		let (thin, graphene, compact) = self.peer_counts();
		let schemes = [
			(self.config.use_thinblocks, thin > 0),
			(self.config.use_graphene, graphene > 0),
			(self.config.use_compact_blocks, compact > 0),
		];
		let enabled = schemes.iter().filter(|(on, _)| *on).count();
		if enabled == 0 || enabled == schemes.len() {
			return false;
		}
		schemes.iter().any(|(on, has_peers)| *on && *has_peers)
	}

	/// First call for a hash starts its preferential timer (with a random
	/// offset within 20% of the configured base) and reports not-expired;
	/// later calls report expiry. A zero base is expired from the start.
	pub fn has_timer_expired(&self, hash: &Hash) -> bool {
		let base_ms = self.config.preferential_timer_ms;
		if base_ms == 0 {
			return true;
		}
		let mut timers = self.timers.lock();
		match timers.get_mut(hash) {
			None => {
				let jitter = rand::thread_rng().gen_range(0.8f64, 1.2f64);
				let timeout = Duration::from_millis((base_ms as f64 * jitter) as u64);
				timers.insert(
					*hash,
					RelayTimer {
						start: Instant::now(),
						timeout,
						warned: false,
					},
				);
				debug!(
					"starting preferential relay timer for {} ({} ms)",
					hash,
					timeout.as_millis()
				);
				false
			}
			Some(timer) => {
				let expired = timer.start.elapsed() >= timer.timeout;
				if expired && !timer.warned {
					timer.warned = true;
					debug!("preferential relay timer expired for {}", hash);
				}
				expired
			}
		}
	}

	/// Forget the timer for a hash once the block arrived or failed.
	pub fn clear_timer(&self, hash: &Hash) {
		self.timers.lock().remove(hash);
	}

	/// Non-received thin-type downloads across all peers.
	pub fn total_in_flight(&self) -> usize {
		self.in_flight
			.lock()
			.values()
			.flat_map(|v| v.iter())
			.filter(|e| !e.received)
			.count()
	}

	/// Whether the global in-flight budget is exhausted.
	pub fn too_many_in_flight(&self) -> bool {
		self.total_in_flight() >= MAX_THINTYPE_BLOCKS_IN_FLIGHT
	}

	/// Whether this peer already has this (kind, hash) in flight.
	pub fn is_in_flight(&self, peer: PeerId, kind: ThinType, hash: &Hash) -> bool {
		self.in_flight
			.lock()
			.get(&peer)
			.map(|v| v.iter().any(|e| e.hash == *hash && e.kind == kind))
			.unwrap_or(false)
	}

	/// Atomically claim an in-flight slot for (peer, hash, kind). Refused
	/// when the global cap is reached or the pair is already in flight.
	pub fn add_in_flight(&self, peer: PeerId, hash: &Hash, kind: ThinType) -> bool {
		let mut in_flight = self.in_flight.lock();
		let live = in_flight
			.values()
			.flat_map(|v| v.iter())
			.filter(|e| !e.received)
			.count();
		if live >= MAX_THINTYPE_BLOCKS_IN_FLIGHT {
			debug!(
				"too many thin-type blocks in flight, not requesting {} from peer {}",
				hash, peer
			);
			return false;
		}
		let entries = in_flight.entry(peer).or_insert_with(Vec::new);
		if entries.iter().any(|e| e.hash == *hash && e.kind == kind) {
			return false;
		}
		entries.push(InFlightEntry {
			hash: *hash,
			requested: Instant::now(),
			received: false,
			kind,
		});
		true
	}

	/// Mark every in-flight entry for this hash as received; entries stay
	/// for duplicate suppression until cleared.
	pub fn block_was_received(&self, peer: PeerId, hash: &Hash) {
		if let Some(entries) = self.in_flight.lock().get_mut(&peer) {
			for e in entries.iter_mut().filter(|e| e.hash == *hash) {
				e.received = true;
			}
		}
	}

	/// Drop every in-flight entry for this (peer, hash). Safe to call
	/// across a disconnect.
	pub fn clear_in_flight(&self, peer: PeerId, hash: &Hash) {
		if let Some(entries) = self.in_flight.lock().get_mut(&peer) {
			entries.retain(|e| e.hash != *hash);
		}
	}

	/// Drop every in-flight entry for a peer.
	pub fn clear_all_in_flight(&self, peer: PeerId) {
		self.in_flight.lock().remove(&peer);
	}

	/// Disconnect a peer sitting on an unanswered thin-type download for
	/// longer than six retry intervals. Whitelisted peers and regtest are
	/// exempt. Returns whether a disconnect was requested.
	pub fn check_for_download_timeout(&self, peer: &Peer) -> bool {
		if self.config.regtest || self.config.is_whitelisted(&peer.addr.ip()) {
			return false;
		}
		let limit = Duration::from_micros(
			self.config.blk_retry_interval_us as u64 * DOWNLOAD_TIMEOUT_MULTIPLIER as u64,
		);
		let timed_out = self
			.in_flight
			.lock()
			.get(&peer.id)
			.map(|v| {
				v.iter()
					.any(|e| !e.received && e.requested.elapsed() > limit)
			})
			.unwrap_or(false);
		if timed_out {
			warn!(
				"disconnecting peer {}: thin-type block download timeout",
				peer.id
			);
			peer.request_disconnect();
		}
		timed_out
	}

	/// The shared reconstruction slot for (peer, hash), created on first
	/// use. All schemes write into the same slot.
	pub fn set_block_to_reconstruct(&self, peer: PeerId, hash: Hash) -> SlotRef {
		let mut map = self.reconstruct.lock();
		map.entry(peer)
			.or_insert_with(HashMap::new)
			.entry(hash)
			.or_insert_with(|| Arc::new(Mutex::new(ReconstructionSlot::new())))
			.clone()
	}

	/// The slot for (peer, hash) if one exists.
	pub fn get_block_to_reconstruct(&self, peer: PeerId, hash: &Hash) -> Option<SlotRef> {
		self.reconstruct
			.lock()
			.get(&peer)
			.and_then(|m| m.get(hash))
			.cloned()
	}

	/// Drop the slot for (peer, hash).
	pub fn clear_block_to_reconstruct(&self, peer: PeerId, hash: &Hash) {
		if let Some(m) = self.reconstruct.lock().get_mut(&peer) {
			m.remove(hash);
		}
	}

	/// Drop every slot a peer owns.
	pub fn clear_all_blocks_to_reconstruct(&self, peer: PeerId) {
		self.reconstruct.lock().remove(&peer);
	}

	/// Largest byte total a reconstruction may buffer before the handler
	/// aborts it.
	pub fn max_allowed_block_size(&self) -> u64 {
		consensus::DEFAULT_MAX_MESSAGE_SIZE_MULTIPLIER * self.config.excessive_block_size
	}

	/// Account freshly buffered bytes toward a slot; errors once the slot
	/// exceeds the allowed total, at which point the caller aborts and
	/// clears the block data.
	pub fn add_block_bytes(&self, bytes: u64, slot: &SlotRef) -> Result<u64, u64> {
		let mut slot = slot.lock();
		slot.total_bytes += bytes;
		if slot.total_bytes > self.max_allowed_block_size() {
			Err(slot.total_bytes)
		} else {
			Ok(slot.total_bytes)
		}
	}

	/// Clear everything tracked for (peer, hash): slot, in-flight entries
	/// and the relay timer.
	pub fn clear_all_block_data(&self, peer: PeerId, hash: &Hash) {
		self.clear_block_to_reconstruct(peer, hash);
		self.clear_in_flight(peer, hash);
		self.clear_timer(hash);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::hash::sha256d;

	fn relay() -> ThinTypeRelay {
		ThinTypeRelay::new(P2PConfig::default())
	}

	#[test]
	fn in_flight_cap_and_uniqueness() {
		let relay = relay();
		// one entry per (peer, hash, kind)
		let h = sha256d(b"h");
		assert!(relay.add_in_flight(1, &h, ThinType::Graphene));
		assert!(!relay.add_in_flight(1, &h, ThinType::Graphene));
		assert!(relay.add_in_flight(1, &h, ThinType::Xthin));

		// the global cap counts non-received entries across peers
		for i in 0..4u64 {
			let hi = sha256d(&i.to_le_bytes());
			assert!(relay.add_in_flight(2 + i as PeerId, &hi, ThinType::Compact));
		}
		assert!(relay.too_many_in_flight());
		let extra = sha256d(b"extra");
		assert!(!relay.add_in_flight(99, &extra, ThinType::Graphene));

		// marking received frees budget but keeps the entry
		relay.block_was_received(1, &h);
		assert!(!relay.too_many_in_flight());
		assert!(relay.is_in_flight(1, ThinType::Graphene, &h));
		assert!(relay.add_in_flight(99, &extra, ThinType::Graphene));

		relay.clear_in_flight(1, &h);
		assert!(!relay.is_in_flight(1, ThinType::Graphene, &h));
	}

	#[test]
	fn timer_starts_then_expires() {
		let mut config = P2PConfig::default();
		config.preferential_timer_ms = 1; // expire almost immediately
		let relay = ThinTypeRelay::new(config);
		let h = sha256d(b"timer");

		assert!(!relay.has_timer_expired(&h));
		std::thread::sleep(Duration::from_millis(5));
		assert!(relay.has_timer_expired(&h));

		relay.clear_timer(&h);
		assert!(!relay.has_timer_expired(&h)); // restarted
	}

	#[test]
	fn zero_base_disables_preferential_relay() {
		let mut config = P2PConfig::default();
		config.preferential_timer_ms = 0;
		let relay = ThinTypeRelay::new(config);
		let h = sha256d(b"zero");
		assert!(relay.has_timer_expired(&h));
		assert!(!relay.is_timer_enabled());
	}

	#[test]
	fn shared_reconstruction_slot() {
		let relay = relay();
		let h = sha256d(b"slot");
		let slot1 = relay.set_block_to_reconstruct(5, h);
		let slot2 = relay.set_block_to_reconstruct(5, h);
		assert!(Arc::ptr_eq(&slot1, &slot2));

		// byte accounting aborts past the cap
		assert!(relay.add_block_bytes(1000, &slot1).is_ok());
		let over = relay.max_allowed_block_size();
		assert!(relay.add_block_bytes(over, &slot1).is_err());

		relay.clear_all_block_data(5, &h);
		assert!(relay.get_block_to_reconstruct(5, &h).is_none());
	}
}
