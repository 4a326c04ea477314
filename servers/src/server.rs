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

//! Assembles the node: builds every subsystem around one application
//! context (no global singletons), starts the long-lived threads and
//! shuts them down in order.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::common::adapters::WeakBlockRelay;
use crate::common::stats::{NodeStats, PeerStats, ServerStats};
use crate::common::types::ServerConfig;
use crate::p2p;
use crate::p2p::extversion::LocalXVersion;
use crate::p2p::handshake::Handshake;
use crate::p2p::protocol::Protocol;
use crate::p2p::types::{
	AddressBook, Capabilities, ChainView, DosManager, TxMempoolView,
};
use crate::p2p::{Peers, RequestManager, ThinTypeRelay};
use crate::parallel::{ParallelValidation, ScriptVerifier, ValidationKernel};
use crate::util::StopState;

/// Waiting rounds for disconnected peers to release at shutdown.
const SHUTDOWN_DRAIN_ROUNDS: usize = 20;
/// Pause per waiting round.
const SHUTDOWN_DRAIN_PAUSE_MS: u64 = 100;

/// The running node.
pub struct Server {
	config: ServerConfig,
	/// The p2p engine.
	pub p2p: Arc<p2p::Server>,
	/// The peer registry.
	pub peers: Arc<Peers>,
	/// The request scheduler.
	pub requests: Arc<RequestManager>,
	/// The parallel validation dispatcher.
	pub validation: Arc<ParallelValidation>,
	/// Weak-block DAG housekeeping.
	pub weakblocks: Arc<WeakBlockRelay>,
	/// Observability rings.
	pub stats: Arc<NodeStats>,
	dos: Arc<dyn DosManager>,
	stop: Arc<StopState>,
}

impl Server {
	/// Build every subsystem over the provided collaborators and wire
	/// them together.
	pub fn new(
		config: ServerConfig,
		chain: Arc<dyn ChainView>,
		mempool: Arc<dyn TxMempoolView>,
		kernel: Arc<dyn ValidationKernel>,
		verifier: Arc<dyn ScriptVerifier>,
		dos: Arc<dyn DosManager>,
		addrbook: Arc<dyn AddressBook>,
	) -> Arc<Server> {
		let stop = Arc::new(StopState::new());

		let mut services = Capabilities::NETWORK | Capabilities::CASH | Capabilities::XVERSION;
		if config.p2p.use_thinblocks {
			services |= Capabilities::XTHIN;
		}
		if config.p2p.use_graphene {
			services |= Capabilities::GRAPHENE;
		}
		if config.weakblocks_enabled {
			services |= Capabilities::WEAKBLOCKS;
		}

		let peers = Arc::new(Peers::new(config.p2p.clone(), dos.clone()));
		let thinrelay = Arc::new(ThinTypeRelay::new(config.p2p.clone()));
		let requests = Arc::new(RequestManager::new(
			config.p2p.clone(),
			chain.clone(),
			mempool.clone(),
			thinrelay.clone(),
			peers.clone(),
		));
		let validation = ParallelValidation::new(
			kernel,
			verifier,
			requests.clone(),
			peers.clone(),
		);
		let local_xversion = LocalXVersion {
			listen_port: config.p2p.port,
			..LocalXVersion::default()
		};
		let handshake = Arc::new(Handshake::new(
			config.p2p.clone(),
			services,
			local_xversion,
		));
		let protocol = Arc::new(Protocol::new(
			config.p2p.clone(),
			chain.clone(),
			mempool,
			validation.clone(),
			dos.clone(),
			addrbook.clone(),
			peers.clone(),
			requests.clone(),
			thinrelay.clone(),
			handshake.clone(),
		));
		let p2p_server = Arc::new(p2p::Server::new(
			config.p2p.clone(),
			peers.clone(),
			handshake,
			protocol,
			requests.clone(),
			thinrelay,
			chain,
			addrbook,
			dos.clone(),
			stop.clone(),
		));
		let weakblocks = Arc::new(WeakBlockRelay::new(
			config.weakblocks_enabled,
			peers.clone(),
		));

		Arc::new(Server {
			config,
			p2p: p2p_server,
			peers,
			requests,
			validation,
			weakblocks,
			stats: Arc::new(NodeStats::new()),
			dos,
			stop,
		})
	}

	/// Start every long-lived thread.
	pub fn start(self: Arc<Self>) {
		let handler_threads = if self.config.handler_threads > 0 {
			self.config.handler_threads
		} else {
			thread::available_parallelism()
				.map(|n| n.get())
				.unwrap_or(2)
		};
		self.dos.load_banlist();
		self.p2p.clone().start(handler_threads);

		let server = self.clone();
		let _ = thread::Builder::new()
			.name("stat-timer".to_string())
			.spawn(move || server.stat_timer_loop());

		info!("server started with {} message handlers", handler_threads);
	}

	fn stat_timer_loop(&self) {
		let sample_interval = self.config.stat_sample_interval_secs.max(10);
		let weak_interval = self.config.weakblock_expiry_interval_secs.max(60);
		let mut since_sample = 0u64;
		let mut since_weak_sweep = 0u64;
		let mut since_ping = 0u64;

		loop {
			if self.stop.is_stopped() {
				break;
			}
			thread::sleep(Duration::from_secs(1));
			since_sample += 1;
			since_weak_sweep += 1;
			since_ping += 1;

			if since_sample >= sample_interval {
				since_sample = 0;
				self.stats.sample_all();
			}
			if since_weak_sweep >= weak_interval {
				since_weak_sweep = 0;
				self.weakblocks.expire_pass();
				self.peers.reset_xthin_disconnect_budget();
				self.dos.dump_banlist();
			}
			// liveness pings keep latency samples fresh
			if since_ping >= 120 {
				since_ping = 0;
				self.p2p.ping_all();
			}
		}
	}

	/// A consistent snapshot for tests, logs or an operator surface.
	pub fn server_stats(&self) -> ServerStats {
		ServerStats {
			peer_count: self.peers.peer_count(),
			validations_running: self.validation.running(),
			weak_blocks: self.weakblocks.size(),
			overall_block_response_secs: self.requests.overall_response_secs(),
			peer_stats: self
				.peers
				.connected_peers()
				.iter()
				.map(|p| PeerStats::from_peer(p))
				.collect(),
		}
	}

	/// Orderly shutdown: stop the threads, flush the weak store, then
	/// wait bounded time for disconnected peers to be released by every
	/// other subsystem.
	pub fn stop(&self) {
		info!("shutting down");
		self.stop.stop();
		self.p2p.stop();
		self.validation.shutdown();
		self.weakblocks.flush();
		self.dos.dump_banlist();

		for _ in 0..SHUTDOWN_DRAIN_ROUNDS {
			if self.peers.sweep_disconnected() == 0 {
				break;
			}
			thread::sleep(Duration::from_millis(SHUTDOWN_DRAIN_PAUSE_MS));
		}
	}
}
