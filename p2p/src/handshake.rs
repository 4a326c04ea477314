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

//! The version handshake: VERSION/VERACK plus the optional extended
//! XVERSION exchange. Handshake messages for one peer are processed under
//! its serial-phase lock so negotiation can never interleave with
//! ordinary dispatch.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::extversion::{self, LocalXVersion, XVersionMap};
use crate::msg::{
	Command, NetAddress, Version, MIN_PEER_PROTO_VERSION, PROTOCOL_VERSION, SENDHEADERS_VERSION,
	USER_AGENT,
};
use crate::peer::{IncomingState, OutgoingState, Peer};
use crate::peers::Peers;
use crate::types::{Capabilities, DosManager, Error, P2PConfig, VERACK_TIMEOUT_SECS};
use crate::util::Mutex;

/// Ring of recently issued handshake nonces, for self-connect detection.
const NONCES_CAP: usize = 100;

/// Handles the handshake negotiation when two peers connect.
pub struct Handshake {
	/// Ring buffer of nonces sent to detect self connections without
	/// requiring a node id.
	nonces: Mutex<VecDeque<u64>>,
	config: P2PConfig,
	local_services: Capabilities,
	local_xversion: LocalXVersion,
}

impl Handshake {
	/// Creates a new handshake handler.
	pub fn new(
		config: P2PConfig,
		local_services: Capabilities,
		local_xversion: LocalXVersion,
	) -> Handshake {
		Handshake {
			nonces: Mutex::new(VecDeque::with_capacity(NONCES_CAP)),
			config,
			local_services,
			local_xversion,
		}
	}

	fn next_nonce(&self) -> u64 {
		let nonce = rand::thread_rng().gen();
		let mut nonces = self.nonces.lock();
		nonces.push_back(nonce);
		if nonces.len() >= NONCES_CAP {
			nonces.pop_front();
		}
		nonce
	}

	fn is_our_nonce(&self, nonce: u64) -> bool {
		self.nonces.lock().contains(&nonce)
	}

	fn now_secs() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0)
	}

	/// Send our VERSION to a peer and arm the VERACK timeout.
	pub fn send_version(&self, peer: &Peer, start_height: i32) -> Result<(), Error> {
		let version = Version {
			version: PROTOCOL_VERSION,
			services: self.local_services.bits(),
			timestamp: Self::now_secs(),
			addr_you: NetAddress::from_socket(peer.addr, 0),
			addr_me: NetAddress {
				services: self.local_services.bits(),
				ip: self.config.host,
				port: self.config.port,
			},
			nonce: self.next_nonce(),
			user_agent: USER_AGENT.to_string(),
			start_height,
			relay: true,
		};
		peer.send_msg(Command::Version, &version)?;
		peer.set_outgoing_state(OutgoingState::SentVersion);
		peer.version_sent_at
			.store(Self::now_secs(), std::sync::atomic::Ordering::Relaxed);
		Ok(())
	}

	/// Process an inbound VERSION.
	pub fn handle_version(
		&self,
		peer: &Peer,
		version: Version,
		dos: &dyn DosManager,
		start_height: i32,
	) -> Result<(), Error> {
		if peer.incoming_state() != IncomingState::WaitVersion {
			dos.misbehaving(peer.id, 1, "duplicate version message");
			return Ok(());
		}

		if version.version < MIN_PEER_PROTO_VERSION {
			dos.misbehaving(peer.id, 100, "obsolete protocol version");
			peer.request_disconnect();
			return Err(Error::ObsoleteVersion(version.version));
		}

		if self.is_our_nonce(version.nonce) {
			debug!("connected to self at {}, disconnecting", peer.addr);
			peer.request_disconnect();
			return Err(Error::PeerWithSelf);
		}

		// nodes advertising the incompatible fork are not peers of ours
		if version.user_agent.contains("Bitcoin SV") || version.user_agent.contains("(SV") {
			dos.misbehaving(peer.id, 100, "SV peer");
			peer.request_disconnect();
			return Err(Error::Misbehaving);
		}

		{
			let mut info = peer.info.write();
			info.version = version.version;
			info.services = Capabilities::from_bits_truncate(version.services);
			info.user_agent = version.user_agent.clone();
			info.start_height = version.start_height;
			info.addr_you = Some(version.addr_you);
			info.advertised_addr = Some(version.addr_me);
			info.relay_txns = version.relay;
		}

		// an inbound peer is still waiting for our version
		if peer.outgoing_state() == OutgoingState::Connected {
			self.send_version(peer, start_height)?;
		}

		let both_xversion = self.local_services.contains(Capabilities::XVERSION)
			&& Capabilities::from_bits_truncate(version.services)
				.contains(Capabilities::XVERSION);
		if both_xversion {
			peer.send_msg(Command::Xversion, &self.local_xversion.to_map())?;
			peer.set_incoming_state(IncomingState::SentVerackAwaitXver);
		} else {
			peer.send_msg(Command::Verack, &crate::msg::Empty)?;
			peer.set_incoming_state(IncomingState::Ready);
		}
		debug!(
			"received version {} from {} ({})",
			version.version, peer.addr, version.user_agent
		);
		Ok(())
	}

	/// Process an inbound XVERSION map and finish our side with a VERACK.
	pub fn handle_xversion(&self, peer: &Peer, map: XVersionMap) -> Result<(), Error> {
		let state = extversion::apply_xversion_map(&map, &self.local_xversion);
		let peer_ignores_checksum = state.peer_ignores_checksum;
		*peer.xver.write() = state;

		if peer_ignores_checksum {
			// the peer tolerates zero-checksum frames from us
			peer.enable_zero_checksum_send();
		}
		if self.local_xversion.ignore_checksum {
			// and we advertised the same, so it may zero frames toward us
			peer.recv_parser.lock().ignore_checksum = true;
		}

		peer.send_msg(Command::Verack, &crate::msg::Empty)?;
		peer.set_incoming_state(IncomingState::Ready);
		debug!("extversion negotiated with peer {}", peer.id);
		Ok(())
	}

	/// Process an inbound VERACK. Follow-ups (sendheaders, sendcmpct) go
	/// out once the connection is fully up.
	pub fn handle_verack(&self, peer: &Peer, dos: &dyn DosManager) -> Result<(), Error> {
		if peer.outgoing_state() == OutgoingState::Ready {
			dos.misbehaving(peer.id, 1, "duplicate verack");
			return Ok(());
		}
		peer.set_outgoing_state(OutgoingState::Ready);

		if peer.info.read().version >= SENDHEADERS_VERSION {
			peer.send_msg(Command::SendHeaders, &crate::msg::Empty)?;
		}
		if self.config.use_compact_blocks {
			peer.send_msg(
				Command::SendCmpct,
				&crate::msg::SendCmpctMsg {
					announce: true,
					version: 1,
				},
			)?;
		}
		Ok(())
	}

	/// Disconnect peers whose VERACK never came. Missing the timeout also
	/// bumps the eviction tracker for the address.
	pub fn check_verack_timeout(&self, peer: &Peer, peers: &Peers, now_secs: i64) {
		let sent_at = peer
			.version_sent_at
			.load(std::sync::atomic::Ordering::Relaxed);
		if sent_at == 0 || peer.outgoing_state() == OutgoingState::Ready {
			return;
		}
		if now_secs - sent_at > VERACK_TIMEOUT_SECS {
			debug!("peer {} never answered our version, disconnecting", peer.id);
			peer.request_disconnect();
			peers.note_eviction(peer.addr.ip(), now_secs);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{Direction, PeerId};
	use std::net::IpAddr;
	use std::sync::atomic::{AtomicI32, Ordering};

	struct CountingDos {
		points: AtomicI32,
	}

	impl DosManager for CountingDos {
		fn misbehaving(&self, _p: PeerId, pts: i32, _r: &str) -> bool {
			self.points.fetch_add(pts, Ordering::Relaxed);
			false
		}
		fn ban(&self, _a: &IpAddr, _s: &str, _r: &str, _secs: i64) {}
		fn is_banned(&self, _a: &IpAddr) -> bool {
			false
		}
	}

	fn test_peer(direction: Direction) -> Peer {
		Peer::new(
			1,
			"127.0.0.1:8333".parse().unwrap(),
			direction,
			P2PConfig::default().magic,
			2_000_000,
			0,
		)
	}

	fn version_msg(services: Capabilities, version: u32, agent: &str) -> Version {
		Version {
			version,
			services: services.bits(),
			timestamp: 0,
			addr_you: NetAddress {
				services: 0,
				ip: "127.0.0.1".parse().unwrap(),
				port: 1,
			},
			addr_me: NetAddress {
				services: services.bits(),
				ip: "127.0.0.1".parse().unwrap(),
				port: 2,
			},
			nonce: 99,
			user_agent: agent.to_string(),
			start_height: 0,
			relay: true,
		}
	}

	fn handshake() -> Handshake {
		Handshake::new(
			P2PConfig::default(),
			Capabilities::NETWORK | Capabilities::CASH | Capabilities::XVERSION,
			LocalXVersion::default(),
		)
	}

	#[test]
	fn plain_version_gets_verack() {
		let hs = handshake();
		let dos = CountingDos {
			points: AtomicI32::new(0),
		};
		let peer = test_peer(Direction::Outbound);
		peer.set_outgoing_state(OutgoingState::SentVersion);

		let v = version_msg(Capabilities::NETWORK, PROTOCOL_VERSION, "/peer:1.0/");
		hs.handle_version(&peer, v, &dos, 0).unwrap();
		assert_eq!(peer.incoming_state(), IncomingState::Ready);
		// one verack queued
		assert_eq!(peer.send_queue.lock().len(), 1);

		hs.handle_verack(&peer, &dos).unwrap();
		assert!(peer.is_connected());
	}

	#[test]
	fn xversion_capable_peer_gets_xversion_first() {
		let hs = handshake();
		let dos = CountingDos {
			points: AtomicI32::new(0),
		};
		let peer = test_peer(Direction::Outbound);
		peer.set_outgoing_state(OutgoingState::SentVersion);

		let v = version_msg(
			Capabilities::NETWORK | Capabilities::XVERSION,
			PROTOCOL_VERSION,
			"/peer:1.0/",
		);
		hs.handle_version(&peer, v, &dos, 0).unwrap();
		assert_eq!(peer.incoming_state(), IncomingState::SentVerackAwaitXver);

		let mut map = XVersionMap::default();
		map.set(crate::extversion::keys::MSG_IGNORE_CHECKSUM, 1);
		hs.handle_xversion(&peer, map).unwrap();
		assert_eq!(peer.incoming_state(), IncomingState::Ready);
		assert!(peer.xver.read().peer_ignores_checksum);
	}

	#[test]
	fn obsolete_version_rejected() {
		let hs = handshake();
		let dos = CountingDos {
			points: AtomicI32::new(0),
		};
		let peer = test_peer(Direction::Inbound);
		let v = version_msg(Capabilities::NETWORK, 1000, "/old:0.1/");
		assert!(hs.handle_version(&peer, v, &dos, 0).is_err());
		assert!(peer.should_disconnect());
		assert_eq!(dos.points.load(Ordering::Relaxed), 100);
	}

	#[test]
	fn sv_peer_rejected() {
		let hs = handshake();
		let dos = CountingDos {
			points: AtomicI32::new(0),
		};
		let peer = test_peer(Direction::Inbound);
		let v = version_msg(Capabilities::NETWORK, PROTOCOL_VERSION, "/Bitcoin SV:1.0/");
		assert!(hs.handle_version(&peer, v, &dos, 0).is_err());
		assert!(peer.should_disconnect());
	}
}
