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

//! P2P server implementation: accepts connections, runs the socket
//! reactor that moves bytes for every peer under the traffic shaper, and
//! hosts the message-handler thread pool feeding the dispatcher. One
//! reactor thread serves all sockets; peers' inbound messages are routed
//! into a handshake tier, a bounded global priority tier and an ordinary
//! tier.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::conn::NetMessage;
use crate::handshake::Handshake;
use crate::msg::{Command, PingPong, MAX_PRIORITY_RECV_QUEUE};
use crate::peer::Peer;
use crate::peers::{next_feeler_delay_secs, Peers};
use crate::protocol::Protocol;
use crate::requests::RequestManager;
use crate::shaper::{LeakyBucket, RECV_SHAPER_MIN_FRAG};
use crate::types::{
	AddressBook, ChainView, Direction, DosManager, Error, P2PConfig, PeerId,
	FEELER_INTERVAL_SECS, TIMEOUT_INTERVAL_SECS,
};
use crate::util::{Condvar, Mutex, StopState};

/// Reactor sweep budget.
const SELECT_TIMEOUT_MS: u64 = 50;
/// Read chunk ceiling per peer per sweep.
const RECV_CHUNK: usize = 64 * 1024;
/// An outstanding ping older than this disconnects the peer, seconds.
const PING_TIMEOUT_SECS: i64 = 20 * 60;
/// How often the maintenance pass runs, milliseconds.
const MAINTENANCE_INTERVAL_MS: u64 = 1_000;

/// P2P server, handling bootstrapping to find and connect to peers,
/// receiving connections from other peers and keeping track of all of
/// them.
pub struct Server {
	config: P2PConfig,
	/// The peer registry.
	pub peers: Arc<Peers>,
	handshake: Arc<Handshake>,
	protocol: Arc<Protocol>,
	requests: Arc<RequestManager>,
	thinrelay: Arc<crate::blockrelay::common::ThinTypeRelay>,
	chain: Arc<dyn ChainView>,
	addrbook: Arc<dyn AddressBook>,
	dos: Arc<dyn DosManager>,
	stop: Arc<StopState>,

	send_shaper: Mutex<LeakyBucket>,
	recv_shaper: Mutex<LeakyBucket>,

	/// Global priority receive tier, bounded.
	priority_recv: Mutex<VecDeque<(PeerId, NetMessage)>>,
	/// Wakes the handler pool when messages arrive.
	handler_signal: (Mutex<()>, Condvar),
}

fn now_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

impl Server {
	/// Creates a new idle p2p server with no peers.
	pub fn new(
		config: P2PConfig,
		peers: Arc<Peers>,
		handshake: Arc<Handshake>,
		protocol: Arc<Protocol>,
		requests: Arc<RequestManager>,
		thinrelay: Arc<crate::blockrelay::common::ThinTypeRelay>,
		chain: Arc<dyn ChainView>,
		addrbook: Arc<dyn AddressBook>,
		dos: Arc<dyn DosManager>,
		stop: Arc<StopState>,
	) -> Server {
		let send_shaper = match config.send_shaper {
			Some((burst, rate)) => LeakyBucket::new(burst, rate),
			None => LeakyBucket::disabled(),
		};
		let recv_shaper = match config.recv_shaper {
			Some((burst, rate)) => LeakyBucket::new(burst, rate),
			None => LeakyBucket::disabled(),
		};
		Server {
			config,
			peers,
			handshake,
			protocol,
			requests,
			thinrelay,
			chain,
			addrbook,
			dos,
			stop,
			send_shaper: Mutex::new(send_shaper),
			recv_shaper: Mutex::new(recv_shaper),
			priority_recv: Mutex::new(VecDeque::new()),
			handler_signal: (Mutex::new(()), Condvar::new()),
		}
	}

	/// Spawn every long-lived thread: the listener, the socket reactor,
	/// the message handlers, the connector/feeler and the maintenance
	/// timer.
	pub fn start(self: Arc<Self>, handler_threads: usize) {
		let server = self.clone();
		let _ = thread::Builder::new()
			.name("p2p-listener".to_string())
			.spawn(move || server.listen_loop());

		let server = self.clone();
		let _ = thread::Builder::new()
			.name("p2p-socket".to_string())
			.spawn(move || server.socket_loop());

		for i in 0..handler_threads.max(1) {
			let server = self.clone();
			let _ = thread::Builder::new()
				.name(format!("msg-handler-{}", i))
				.spawn(move || server.message_handler_loop());
		}

		let server = self.clone();
		let _ = thread::Builder::new()
			.name("p2p-connect".to_string())
			.spawn(move || server.connect_loop());

		let server = self.clone();
		let _ = thread::Builder::new()
			.name("p2p-maintenance".to_string())
			.spawn(move || server.maintenance_loop());
	}

	/// Request all threads to wind down and every peer to drop.
	pub fn stop(&self) {
		self.stop.stop();
		self.peers.stop_all();
	}

	/// Asks the server to connect to a new peer.
	pub fn connect(&self, addr: &SocketAddr, direction: Direction) -> Result<Arc<Peer>, Error> {
		if self.dos.is_banned(&addr.ip()) {
			debug!("peer {} banned, not connecting", addr);
			return Err(Error::Banned);
		}
		if self.peers.is_address_connected(&addr.ip()) {
			return Err(Error::ConnectionClose);
		}

		self.addrbook.attempt(addr);
		let stream = TcpStream::connect_timeout(addr, Duration::from_secs(10))?;
		stream.set_nonblocking(true)?;

		let id = self.peers.next_peer_id();
		let peer = Peer::new(
			id,
			*addr,
			direction,
			self.config.magic,
			self.config.max_message_size(),
			now_secs(),
		);
		peer.set_stream(stream);
		let peer = self.peers.add_connected(peer);
		self.handshake
			.send_version(&peer, self.chain.tip().height as i32)?;
		debug!("connecting to {} as peer {}", addr, id);
		Ok(peer)
	}

	fn listen_loop(&self) {
		let bind_addr = SocketAddr::new(self.config.host, self.config.port);
		let listener = match TcpListener::bind(bind_addr) {
			Ok(l) => l,
			Err(e) => {
				error!("could not bind p2p listener on {}: {}", bind_addr, e);
				return;
			}
		};
		if let Err(e) = listener.set_nonblocking(true) {
			error!("could not configure p2p listener: {}", e);
			return;
		}
		info!("p2p listening on {}", bind_addr);

		let sleep_time = Duration::from_millis(1);
		loop {
			if self.stop.is_stopped() {
				break;
			}
			match listener.accept() {
				Ok((stream, peer_addr)) => {
					if let Err(e) = self.handle_new_peer(stream, peer_addr) {
						debug!("error accepting peer {}: {:?}", peer_addr, e);
					}
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
					// nothing to do, will retry in next iteration
				}
				Err(e) => {
					warn!("couldn't establish new client connection: {:?}", e);
				}
			}
			thread::sleep(sleep_time);
		}
	}

	fn handle_new_peer(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), Error> {
		let now = now_secs();
		if self.dos.is_banned(&peer_addr.ip()) {
			debug!("peer {} banned, refusing connection", peer_addr);
			let _ = stream.shutdown(std::net::Shutdown::Both);
			return Err(Error::Banned);
		}
		if !self.peers.note_connection_attempt(peer_addr.ip(), now) {
			let _ = stream.shutdown(std::net::Shutdown::Both);
			return Err(Error::Banned);
		}
		if !self.peers.accept_inbound(now) {
			debug!("inbound slots full, refusing {}", peer_addr);
			let _ = stream.shutdown(std::net::Shutdown::Both);
			return Err(Error::ConnectionClose);
		}
		stream.set_nonblocking(true)?;

		let id = self.peers.next_peer_id();
		let peer = Peer::new(
			id,
			peer_addr,
			Direction::Inbound,
			self.config.magic,
			self.config.max_message_size(),
			now,
		);
		peer.set_stream(stream);
		self.peers.add_connected(peer);
		debug!("accepted inbound peer {} from {}", id, peer_addr);
		Ok(())
	}

	// ---- socket reactor ----

	fn socket_loop(&self) {
		loop {
			if self.stop.is_stopped() {
				break;
			}
			let peers = self.peers.connected_peers();
			let mut any_progress = false;

			for peer in &peers {
				if peer.should_disconnect() {
					continue;
				}
				match self.recv_for_peer(peer) {
					Ok(progress) => any_progress |= progress,
					Err(e) => self.disconnect_on_error(peer, e),
				}
			}

			// the priority pass: peers with a queued priority frame get
			// to move at most two messages before everyone else
			for peer in &peers {
				if peer.should_disconnect() {
					continue;
				}
				let has_priority = match peer.send_queue.try_lock() {
					Some(queue) => queue.priority_pending(),
					// contended, move on and pick it up next sweep
					None => continue,
				};
				if has_priority {
					if let Err(e) = self.send_for_peer(peer, 2) {
						self.disconnect_on_error(peer, e);
					}
				}
			}

			for peer in &peers {
				if peer.should_disconnect() {
					continue;
				}
				match self.send_for_peer(peer, usize::max_value()) {
					Ok(progress) => any_progress |= progress,
					Err(e) => self.disconnect_on_error(peer, e),
				}
			}

			self.sweep_disconnected();

			if !any_progress {
				thread::sleep(Duration::from_millis(SELECT_TIMEOUT_MS));
			}
		}
	}

	fn disconnect_on_error(&self, peer: &Arc<Peer>, e: Error) {
		match &e {
			Error::BadMagic { legacy_core: true } => {
				// wrong-network peers get a long ban rather than a retry
				self.dos.ban(
					&peer.addr.ip(),
					"BitcoinCore Network application",
					"wrong network magic",
					4 * 60 * 60,
				);
			}
			Error::OversizedMessage(n) => {
				debug!("peer {} declared an oversized message ({} bytes)", peer.id, n);
			}
			_ => {}
		}
		debug!("disconnecting peer {}: {:?}", peer.id, e);
		peer.request_disconnect();
	}

	fn recv_for_peer(&self, peer: &Arc<Peer>) -> Result<bool, Error> {
		let budget = self
			.recv_shaper
			.lock()
			.available(RECV_SHAPER_MIN_FRAG)
			.min(RECV_CHUNK);
		if budget == 0 {
			return Ok(false);
		}

		let mut buf = vec![0u8; budget];
		let read = match peer.with_stream(|s| s.read(&mut buf)) {
			None => return Ok(false),
			Some(Ok(0)) => return Err(Error::ConnectionClose),
			Some(Ok(n)) => n,
			Some(Err(ref e))
				if e.kind() == io::ErrorKind::WouldBlock
					|| e.kind() == io::ErrorKind::Interrupted =>
			{
				return Ok(false);
			}
			Some(Err(e)) => return Err(Error::Connection(e)),
		};

		self.recv_shaper.lock().leak(read);
		let now = now_secs();
		peer.touch_recv(now);

		let mut complete = vec![];
		peer.recv_parser.lock().feed(&buf[..read], &mut complete)?;

		for msg in complete {
			if let Some(cmd) = msg.command {
				if cmd.counts_activity() {
					peer.add_activity_bytes(now, msg.frame_size);
				}
			}
			self.route_message(peer, msg);
		}
		Ok(read > 0)
	}

	/// Route a parsed message to the handshake tier, the bounded global
	/// priority tier, or the peer's ordinary queue.
	fn route_message(&self, peer: &Arc<Peer>, msg: NetMessage) {
		match msg.command {
			Some(cmd) if cmd.is_handshake() => {
				peer.recv_handshake.lock().push_back(msg);
			}
			Some(cmd)
				if cmd.is_priority()
					&& self.chain.is_chain_nearly_syncd()
					&& self.priority_recv.lock().len() < MAX_PRIORITY_RECV_QUEUE =>
			{
				self.priority_recv.lock().push_back((peer.id, msg));
			}
			_ => {
				peer.recv_ordinary.lock().push_back(msg);
			}
		}
		// wake a handler
		self.handler_signal.1.notify_one();
	}

	fn send_for_peer(&self, peer: &Arc<Peer>, max_messages: usize) -> Result<bool, Error> {
		let mut sent_any = false;
		let mut messages_sent = 0;

		loop {
			if messages_sent >= max_messages {
				break;
			}
			if !self.send_shaper.lock().try_leak(0) {
				break;
			}

			let chunk: Option<Vec<u8>> = {
				let mut queue = peer.send_queue.lock();
				queue.promote_one();
				queue
					.front_remaining()
					.map(|b| b[..b.len().min(RECV_CHUNK)].to_vec())
			};
			let chunk = match chunk {
				Some(c) if !c.is_empty() => c,
				_ => break,
			};

			let written = match peer.with_stream(|s| s.write(&chunk)) {
				None => return Ok(sent_any),
				Some(Ok(0)) => return Err(Error::ConnectionClose),
				Some(Ok(n)) => n,
				Some(Err(ref e))
					if e.kind() == io::ErrorKind::WouldBlock
						|| e.kind() == io::ErrorKind::Interrupted =>
				{
					break;
				}
				Some(Err(e)) => return Err(Error::Connection(e)),
			};

			self.send_shaper.lock().leak(written);
			peer.touch_send(now_secs());
			sent_any = true;
			let completed = peer.send_queue.lock().advance(written);
			if completed {
				messages_sent += 1;
			}
			if written < chunk.len() {
				// socket backpressure
				break;
			}
		}
		Ok(sent_any)
	}

	fn sweep_disconnected(&self) {
		for peer in self.peers.connected_peers() {
			if peer.should_disconnect() {
				debug!("dropping peer {} ({})", peer.id, peer.addr);
				if let Some(stream) = peer.take_stream() {
					let _ = stream.shutdown(std::net::Shutdown::Both);
				}
				self.requests.remove_node_state(peer.id);
				self.thinrelay.remove_peer(peer.id);
				self.protocol.forget_peer(peer.id);
				self.peers.remove(peer.id);
			}
		}
	}

	// ---- message handlers ----

	fn message_handler_loop(&self) {
		loop {
			if self.stop.is_stopped() {
				break;
			}

			// the priority tier drains before anything else
			let priority = self.priority_recv.lock().pop_front();
			if let Some((peer_id, msg)) = priority {
				if let Some(peer) = self.peers.get_peer(peer_id) {
					self.process_one(&peer, msg);
				}
				continue;
			}

			// then one message per peer so nobody starves
			let mut worked = false;
			for peer in self.peers.connected_peers() {
				if peer.should_disconnect() {
					continue;
				}
				let handshake_msg = peer.recv_handshake.lock().pop_front();
				if let Some(msg) = handshake_msg {
					self.process_one(&peer, msg);
					worked = true;
					continue;
				}
				// ordinary dispatch only after the handshake phase
				if !peer.is_connected() {
					continue;
				}
				let msg = peer.recv_ordinary.lock().pop_front();
				if let Some(msg) = msg {
					self.process_one(&peer, msg);
					worked = true;
				}
			}

			if !worked {
				let mut guard = self.handler_signal.0.lock();
				self.handler_signal
					.1
					.wait_for(&mut guard, Duration::from_millis(10));
			}
		}
	}

	fn process_one(&self, peer: &Arc<Peer>, msg: NetMessage) {
		// per-peer dispatch is serialized: messages of one peer are
		// handled in arrival order and handshake processing can never
		// interleave with ordinary traffic
		let _serial = peer.serial_phase.lock();
		if let Err(e) = self.protocol.process_message(peer, msg) {
			debug!("error handling message from peer {}: {:?}", peer.id, e);
		}
	}

	// ---- outbound connections and feelers ----

	fn connect_loop(&self) {
		let mut rng = rand::thread_rng();
		let mut next_feeler =
			std::time::Instant::now() + Duration::from_secs_f64(next_feeler_delay_secs(
				&mut rng,
				FEELER_INTERVAL_SECS,
			));

		loop {
			if self.stop.is_stopped() {
				break;
			}
			thread::sleep(Duration::from_millis(500));

			// keep the outbound slots full
			if self.peers.outbound_count() < self.config.max_outbound {
				if let Some(addr) = self.addrbook.select(false) {
					let _ = self.connect(&addr, Direction::Outbound);
				}
			} else if self.chain.is_initial_block_download() {
				// all slots busy: make sure enough of them speak xthin
				self.peers.make_room_for_xthin_peer();
			}

			// short-lived feeler probes on a Poisson cadence
			if std::time::Instant::now() >= next_feeler {
				next_feeler = std::time::Instant::now()
					+ Duration::from_secs_f64(next_feeler_delay_secs(
						&mut rng,
						FEELER_INTERVAL_SECS,
					));
				if let Some(addr) = self.addrbook.select(true) {
					debug!("feeler connection to {}", addr);
					if let Ok(peer) = self.connect(&addr, Direction::Feeler) {
						// the feeler has served its purpose once the
						// handshake finishes; maintenance reaps it
						let _ = peer;
					}
				}
			}
		}
	}

	// ---- periodic maintenance ----

	fn maintenance_loop(&self) {
		loop {
			if self.stop.is_stopped() {
				break;
			}
			thread::sleep(Duration::from_millis(MAINTENANCE_INTERVAL_MS));
			let now = now_secs();
			let now_usec = now * 1_000_000;

			for peer in self.peers.connected_peers() {
				// inactivity in either direction
				if now - peer.last_send() > TIMEOUT_INTERVAL_SECS
					|| now - peer.last_recv() > TIMEOUT_INTERVAL_SECS
				{
					debug!("peer {} inactive, disconnecting", peer.id);
					peer.request_disconnect();
					continue;
				}
				// unanswered ping
				if peer.ping_outstanding_usec(now_usec) > PING_TIMEOUT_SECS * 1_000_000 {
					debug!("peer {} ping timeout, disconnecting", peer.id);
					peer.request_disconnect();
					continue;
				}
				// missing verack
				self.handshake.check_verack_timeout(&peer, &self.peers, now);

				// thin-type download stalls
				if peer.is_connected() {
					self.thinrelay.check_for_download_timeout(&peer);
				}

				// feelers die right after a completed handshake
				if peer.direction == Direction::Feeler && peer.is_connected() {
					self.addrbook.good(&peer.addr);
					peer.request_disconnect();
				}
			}

			// release fully drained disconnected peers
			self.peers.sweep_disconnected();

			// drive the request scheduler
			self.requests.send_requests();
		}
	}

	/// Ping every connected peer; acts as a liveness probe and keeps the
	/// latency samples fresh.
	pub fn ping_all(&self) {
		use rand::Rng;
		let now_usec = now_secs() * 1_000_000;
		for peer in self.peers.connected_peers() {
			if !peer.is_connected() {
				continue;
			}
			let nonce = rand::thread_rng().gen();
			peer.ping_sent(nonce, now_usec);
			let _ = peer.send_msg(Command::Ping, &PingPong { nonce });
		}
	}
}
