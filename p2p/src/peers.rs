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

//! The connection manager: the registry of live peers, inbound-slot
//! mitigation and eviction, per-address connection-attempt tracking, and
//! relay fan-out helpers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use crate::core::core::hash::Hash;
use crate::core::core::inventory::Inv;
use crate::msg::{Command, InvMsg};
use crate::peer::{DecayedCounter, Peer};
use crate::types::{Direction, DosManager, P2PConfig, PeerId};
use crate::util::{Mutex, RwLock};

/// Decayed connection attempts above this earn a ban.
const MAX_CONNECTION_ATTEMPTS: f64 = 4.0;
/// Half-life of the connection-attempt counter, seconds.
const CONNECTION_ATTEMPT_HALF_LIFE: i64 = 60;
/// Decayed evictions above this earn a ban.
const MAX_EVICTIONS: f64 = 15.0;
/// Half-life of the eviction counter, seconds.
const EVICTION_HALF_LIFE: i64 = 30 * 60;
/// Ban length for misbehaving address ranges, seconds.
const MITIGATION_BAN_SECS: i64 = 4 * 60 * 60;
/// Upper bound on xthin-search disconnects per day.
const MAX_XTHIN_SEARCH_DISCONNECTS: u32 = 5;
/// No pong for this long after connect marks a peer slow for eviction.
const SLOW_PING_SECS: i64 = 60;

/// The registry of connected peers and the mitigation state keyed by
/// remote address.
pub struct Peers {
	config: P2PConfig,
	dos: Arc<dyn DosManager>,
	peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
	/// Peers dropped from the registry, held until their refcount drains.
	disconnected: Mutex<Vec<Arc<Peer>>>,
	next_id: AtomicI64,
	connection_attempts: Mutex<HashMap<IpAddr, DecayedCounter>>,
	evictions: Mutex<HashMap<IpAddr, DecayedCounter>>,
	xthin_disconnects_today: AtomicU32,
}

impl Peers {
	/// New empty registry.
	pub fn new(config: P2PConfig, dos: Arc<dyn DosManager>) -> Peers {
		Peers {
			config,
			dos,
			peers: RwLock::new(HashMap::new()),
			disconnected: Mutex::new(Vec::new()),
			next_id: AtomicI64::new(1),
			connection_attempts: Mutex::new(HashMap::new()),
			evictions: Mutex::new(HashMap::new()),
			xthin_disconnects_today: AtomicU32::new(0),
		}
	}

	/// The shared configuration.
	pub fn config(&self) -> &P2PConfig {
		&self.config
	}

	/// Allocate the next peer id.
	pub fn next_peer_id(&self) -> PeerId {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Adds the peer to our internal peer mapping. Note that the peer is
	/// still returned so the server can run it.
	pub fn add_connected(&self, peer: Peer) -> Arc<Peer> {
		debug!("saving newly connected peer {} ({:?})", peer.addr, peer.direction);
		let apeer = Arc::new(peer);
		self.peers.write().insert(apeer.id, apeer.clone());
		apeer
	}

	/// Get a connected peer by id.
	pub fn get_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
		self.peers.read().get(&id).cloned()
	}

	/// All connected peers.
	pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
		self.peers.read().values().cloned().collect()
	}

	/// Number of peers we're currently connected to.
	pub fn peer_count(&self) -> usize {
		self.peers.read().len()
	}

	/// Number of inbound peers.
	pub fn inbound_count(&self) -> usize {
		self.peers
			.read()
			.values()
			.filter(|p| p.direction == Direction::Inbound)
			.count()
	}

	/// Number of outbound (non-feeler) peers.
	pub fn outbound_count(&self) -> usize {
		self.peers
			.read()
			.values()
			.filter(|p| p.direction == Direction::Outbound)
			.count()
	}

	/// Outbound peers capable of xthin relay.
	pub fn xthin_outbound_count(&self) -> usize {
		self.peers
			.read()
			.values()
			.filter(|p| p.direction == Direction::Outbound && p.xthin_capable())
			.count()
	}

	/// Whether the address already has a live connection.
	pub fn is_address_connected(&self, ip: &IpAddr) -> bool {
		self.peers.read().values().any(|p| p.addr.ip() == *ip)
	}

	/// Track a connection attempt from `ip`. More than four attempts
	/// within the decay window bans the address for four hours. Returns
	/// false when the connection must be refused.
	pub fn note_connection_attempt(&self, ip: IpAddr, now_secs: i64) -> bool {
		if self.dos.is_banned(&ip) {
			return false;
		}
		let mut attempts = self.connection_attempts.lock();
		let counter = attempts
			.entry(ip)
			.or_insert_with(|| DecayedCounter::new(CONNECTION_ATTEMPT_HALF_LIFE));
		let value = counter.bump(now_secs, 1.0);
		if value > MAX_CONNECTION_ATTEMPTS && !self.config.is_whitelisted(&ip) {
			warn!("banning {} for excessive connection attempts", ip);
			self.dos
				.ban(&ip, "", "too many connection attempts", MITIGATION_BAN_SECS);
			return false;
		}
		true
	}

	/// Make room for a new inbound connection. When the inbound budget is
	/// full the least useful evictable peer is disconnected; whitelisted
	/// and outbound peers are immune. Returns false when no slot could be
	/// freed.
	pub fn accept_inbound(&self, now_secs: i64) -> bool {
		if self.inbound_count() < self.config.max_inbound() {
			return true;
		}
		self.evict_inbound_peer(now_secs)
	}

	fn evict_inbound_peer(&self, now_secs: i64) -> bool {
		let candidates: Vec<Arc<Peer>> = self
			.peers
			.read()
			.values()
			.filter(|p| {
				p.direction == Direction::Inbound
					&& !self.config.is_whitelisted(&p.addr.ip())
					&& !p.should_disconnect()
			})
			.cloned()
			.collect();

		// the least active peer goes; a peer that never answered a ping
		// after a minute of connection is preferred over any byte count
		let victim = candidates.into_iter().min_by(|a, b| {
			let slow = |p: &Arc<Peer>| {
				p.ping_latency_usec() == 0 && now_secs - p.connected_at > SLOW_PING_SECS
			};
			slow(b)
				.cmp(&slow(a))
				.then(
					a.activity_bytes(now_secs)
						.partial_cmp(&b.activity_bytes(now_secs))
						.unwrap_or(std::cmp::Ordering::Equal),
				)
		});

		match victim {
			Some(peer) => {
				debug!(
					"evicting inbound peer {} (activity {:.0} bytes)",
					peer.addr,
					peer.activity_bytes(now_secs)
				);
				peer.request_disconnect();
				self.note_eviction(peer.addr.ip(), now_secs);
				true
			}
			None => false,
		}
	}

	/// Bump the decayed eviction counter for an address; repeated
	/// evictions earn a four-hour ban.
	pub fn note_eviction(&self, ip: IpAddr, now_secs: i64) {
		let mut evictions = self.evictions.lock();
		let counter = evictions
			.entry(ip)
			.or_insert_with(|| DecayedCounter::new(EVICTION_HALF_LIFE));
		if counter.bump(now_secs, 1.0) > MAX_EVICTIONS && !self.config.is_whitelisted(&ip) {
			warn!("banning {} for excessive evictions", ip);
			self.dos
				.ban(&ip, "", "evicted too often", MITIGATION_BAN_SECS);
		}
	}

	/// During IBD, when all outbound slots are filled but too few of them
	/// speak xthin, drop one non-xthin outbound peer to make room for an
	/// xthin-capable one. Bounded per day.
	pub fn make_room_for_xthin_peer(&self) -> bool {
		if self.outbound_count() < self.config.max_outbound {
			return false;
		}
		if self.xthin_outbound_count() >= self.config.min_xthin_nodes {
			return false;
		}
		if self.xthin_disconnects_today.load(Ordering::Relaxed) >= MAX_XTHIN_SEARCH_DISCONNECTS {
			return false;
		}
		let victim = self
			.peers
			.read()
			.values()
			.find(|p| {
				p.direction == Direction::Outbound
					&& !p.xthin_capable()
					&& !self.config.is_whitelisted(&p.addr.ip())
			})
			.cloned();
		if let Some(peer) = victim {
			debug!("disconnecting non-xthin outbound peer {} during IBD", peer.addr);
			peer.request_disconnect();
			self.xthin_disconnects_today.fetch_add(1, Ordering::Relaxed);
			true
		} else {
			false
		}
	}

	/// Reset the daily xthin-search budget.
	pub fn reset_xthin_disconnect_budget(&self) {
		self.xthin_disconnects_today.store(0, Ordering::Relaxed);
	}

	/// Remove a peer from the registry, holding it in the disconnected
	/// list until every other subsystem dropped its handle.
	pub fn remove(&self, id: PeerId) {
		let removed = self.peers.write().remove(&id);
		if let Some(peer) = removed {
			peer.request_disconnect();
			self.disconnected.lock().push(peer);
		}
	}

	/// Drop fully released disconnected peers; returns how many are still
	/// held elsewhere.
	pub fn sweep_disconnected(&self) -> usize {
		let mut held = self.disconnected.lock();
		held.retain(|p| Arc::strong_count(p) > 1);
		held.len()
	}

	/// Broadcast an inventory announcement to every connected peer that
	/// does not already know the hash.
	pub fn broadcast_inv(&self, inv: Inv, exclude: Option<PeerId>) {
		let mut count = 0;
		for peer in self.connected_peers() {
			if Some(peer.id) == exclude || !peer.is_connected() {
				continue;
			}
			if peer.filter_sent_inventory(&inv.hash) {
				continue;
			}
			if peer
				.send_msg(Command::Inv, &InvMsg { invs: vec![inv] })
				.is_ok()
			{
				count += 1;
			}
		}
		trace!("broadcasted inv {} to {} peers", inv.hash, count);
	}

	/// Relay a transaction announcement. SPV peers only receive hashes
	/// matching their loaded filter; peers without a filter are gated by
	/// their version-message relay flag.
	pub fn relay_transaction(&self, txid: Hash, tx_ser: &[u8], source: Option<PeerId>) {
		let inv = Inv::new(crate::core::core::inventory::InvType::Tx, txid);
		for peer in self.connected_peers() {
			if Some(peer.id) == source || !peer.is_connected() {
				continue;
			}
			{
				let filter = peer.spv_filter.lock();
				match filter.as_ref() {
					Some(f) => {
						if !f.contains(txid.as_bytes()) && !f.contains(tx_ser) {
							continue;
						}
					}
					None => {
						if !peer.info.read().relay_txns {
							continue;
						}
					}
				}
			}
			if peer.filter_sent_inventory(&txid) {
				continue;
			}
			let _ = peer.send_msg(Command::Inv, &InvMsg { invs: vec![inv] });
		}
	}

	/// Ask every peer to stop; used at shutdown.
	pub fn stop_all(&self) {
		for peer in self.connected_peers() {
			peer.request_disconnect();
		}
	}
}

/// Poisson-distributed delay until the next feeler connection.
pub fn next_feeler_delay_secs<R: rand::Rng>(rng: &mut R, mean_secs: f64) -> f64 {
	let u: f64 = rng.gen_range(1e-9, 1.0);
	-u.ln() * mean_secs
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	struct TestDos {
		bans: AtomicUsize,
	}

	impl DosManager for TestDos {
		fn misbehaving(&self, _peer: PeerId, _points: i32, _reason: &str) -> bool {
			false
		}
		fn ban(&self, _addr: &IpAddr, _subver: &str, _reason: &str, _seconds: i64) {
			self.bans.fetch_add(1, Ordering::Relaxed);
		}
		fn is_banned(&self, _addr: &IpAddr) -> bool {
			false
		}
	}

	fn registry(max_connections: usize) -> (Peers, Arc<TestDos>) {
		let dos = Arc::new(TestDos {
			bans: AtomicUsize::new(0),
		});
		let mut config = P2PConfig::default();
		config.max_connections = max_connections;
		config.max_outbound = 2;
		(Peers::new(config, dos.clone()), dos)
	}

	fn make_peer(peers: &Peers, port: u16, direction: Direction) -> Arc<Peer> {
		let id = peers.next_peer_id();
		peers.add_connected(Peer::new(
			id,
			format!("127.0.0.{}:{}", port % 250 + 1, port).parse().unwrap(),
			direction,
			[0xe3, 0xe1, 0xf3, 0xe8],
			2_000_000,
			1_000,
		))
	}

	#[test]
	fn eviction_picks_least_active() {
		let (peers, _) = registry(100);
		let p1 = make_peer(&peers, 1000, Direction::Inbound);
		let p2 = make_peer(&peers, 1001, Direction::Inbound);
		let p3 = make_peer(&peers, 1002, Direction::Outbound);

		let now = 2_000;
		p1.add_activity_bytes(now, 50_000);
		p2.add_activity_bytes(now, 100);
		p3.add_activity_bytes(now, 1);
		// p1 answered a ping, p2 never did and is preferred for eviction
		p1.ping_sent(5, 100);
		p1.pong_received(5, 200);

		assert!(peers.evict_inbound_peer(now));
		assert!(!p1.should_disconnect());
		assert!(p2.should_disconnect());
		// outbound peers are immune however idle
		assert!(!p3.should_disconnect());
	}

	#[test]
	fn repeated_connection_attempts_ban() {
		let (peers, dos) = registry(100);
		let ip: IpAddr = "10.1.2.3".parse().unwrap();
		for _ in 0..4 {
			assert!(peers.note_connection_attempt(ip, 100));
		}
		// fifth attempt within the window crosses the threshold
		assert!(!peers.note_connection_attempt(ip, 100));
		assert_eq!(dos.bans.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn feeler_delay_is_positive() {
		let mut rng = rand::thread_rng();
		for _ in 0..100 {
			let d = next_feeler_delay_secs(&mut rng, 120.0);
			assert!(d > 0.0);
		}
	}
}
