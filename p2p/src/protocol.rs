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

//! The per-command message dispatcher: called once per complete inbound
//! message, decodes the payload and drives the request manager, the
//! thin-type relay machinery, block validation and the collaborator
//! interfaces. Decode failures fold into a misbehave-or-ignore policy
//! instead of tearing the process down.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::blockrelay::common::{ThinType, ThinTypeRelay};
use crate::blockrelay::compactblock::{
	self, BlockTxn, CompactBlock, CompactResult, GetBlockTxn,
};
use crate::blockrelay::graphene::{
	self, GetGraphene, GetGrapheneRecovery, GetGrapheneTx, GrapheneBlock, GrapheneRecovery,
	GrapheneResult, GrapheneTx,
};
use crate::blockrelay::mempool_sync::{
	GetMempoolSync, GetMempoolSyncTx, MempoolSync, MempoolSyncTx, MEMPOOL_SYNC_MIN_INTERVAL,
};
use crate::blockrelay::thinblock::{
	self, GetXBlockTx, GetXthin, ReconstructResult, XBlockTx, XthinBlock,
};
use crate::conn::{decode_payload, NetMessage};
use crate::core::consensus::{MAX_HEADERS_RESULTS, MAX_INV_SZ};
use crate::core::core::block::Block;
use crate::core::core::hash::{Hash, Hashed};
use crate::core::core::inventory::{Inv, InvType};
use crate::core::core::transaction::{Transaction, TxRef};
use crate::core::ser::{BinReader, Readable};
use crate::handshake::Handshake;
use crate::msg::{
	AddrMsg, Command, FilterLoadMsg, GetHeaders, HeadersMsg, InvMsg, MerkleBlockMsg, PingPong,
	RejectMsg, SendCmpctMsg, Version, XpeditedBlockMsg, PROTOCOL_VERSION,
};
use crate::peer::Peer;
use crate::peers::Peers;
use crate::requests::RequestManager;
use crate::types::{
	AddressBook, BlockValidator, ChainView, DosManager, Error, P2PConfig, RejectCode,
	TxMempoolView,
};
use crate::extversion::XVersionMap;

/// Stashed headers that did not connect, keyed by their prev hash.
const MAX_UNCONNECTED_HEADERS: usize = 256;
/// Unconnected headers older than this are dropped, seconds.
const UNCONNECTED_HEADERS_TIMEOUT_SECS: u64 = 120;
/// Hop bound on expedited block forwarding.
const MAX_EXPEDITED_HOPS: u8 = 3;
/// Concatenated-txn streaming threshold on getdata service, bytes.
const TXN_CONCAT_THRESHOLD: usize = 10_000;

/// The message dispatcher and its collaborators.
pub struct Protocol {
	config: P2PConfig,
	chain: Arc<dyn ChainView>,
	mempool: Arc<dyn TxMempoolView>,
	validator: Arc<dyn BlockValidator>,
	dos: Arc<dyn DosManager>,
	addrbook: Arc<dyn AddressBook>,
	peers: Arc<Peers>,
	requests: Arc<RequestManager>,
	thinrelay: Arc<ThinTypeRelay>,
	handshake: Arc<Handshake>,
	/// Headers whose parent we have not seen yet, keyed by prev hash.
	unconnected_headers: crate::util::Mutex<HashMap<Hash, (Vec<crate::core::core::block::BlockHeader>, Instant)>>,
	/// Salts of xthin blocks we served, so follow-up id requests resolve.
	sent_xthin_salts: crate::util::Mutex<HashMap<(crate::types::PeerId, Hash), u64>>,
	/// Nonces of graphene blocks we served.
	sent_graphene_nonces: crate::util::Mutex<HashMap<(crate::types::PeerId, Hash), u64>>,
}

/// Bound on remembered served thin announcements.
const MAX_SENT_THIN_STATE: usize = 1_000;

impl Protocol {
	/// Wire up the dispatcher.
	pub fn new(
		config: P2PConfig,
		chain: Arc<dyn ChainView>,
		mempool: Arc<dyn TxMempoolView>,
		validator: Arc<dyn BlockValidator>,
		dos: Arc<dyn DosManager>,
		addrbook: Arc<dyn AddressBook>,
		peers: Arc<Peers>,
		requests: Arc<RequestManager>,
		thinrelay: Arc<ThinTypeRelay>,
		handshake: Arc<Handshake>,
	) -> Protocol {
		Protocol {
			config,
			chain,
			mempool,
			validator,
			dos,
			addrbook,
			peers,
			requests,
			thinrelay,
			handshake,
			unconnected_headers: crate::util::Mutex::new(HashMap::new()),
			sent_xthin_salts: crate::util::Mutex::new(HashMap::new()),
			sent_graphene_nonces: crate::util::Mutex::new(HashMap::new()),
		}
	}

	/// Drop any state remembered for a disconnecting peer.
	pub fn forget_peer(&self, id: crate::types::PeerId) {
		self.sent_xthin_salts.lock().retain(|(p, _), _| *p != id);
		self.sent_graphene_nonces.lock().retain(|(p, _), _| *p != id);
	}

	fn remember_sent(map: &crate::util::Mutex<HashMap<(crate::types::PeerId, Hash), u64>>, key: (crate::types::PeerId, Hash), value: u64) {
		let mut map = map.lock();
		if map.len() >= MAX_SENT_THIN_STATE {
			map.clear();
		}
		map.insert(key, value);
	}

	fn now_secs() -> i64 {
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0)
	}

	fn now_usecs() -> i64 {
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_micros() as i64)
			.unwrap_or(0)
	}

	fn pool_entries(&self) -> Vec<(Hash, TxRef)> {
		self.mempool
			.query_hashes()
			.into_iter()
			.filter_map(|h| self.mempool.get(&h).map(|tx| (h, tx)))
			.collect()
	}

	/// Dispatch one complete inbound message. Unknown commands are logged
	/// and ignored; decode failures misbehave according to the command.
	pub fn process_message(&self, peer: &Arc<Peer>, msg: NetMessage) -> Result<(), Error> {
		let command = match msg.command {
			Some(c) => c,
			None => {
				let raw = String::from_utf8_lossy(&msg.raw_command).to_string();
				debug!("ignoring unknown command '{}' from peer {}", raw.trim_end_matches('\0'), peer.id);
				return Ok(());
			}
		};

		let result = self.dispatch(peer, command, &msg);
		if let Err(Error::Serialization(ref e)) = result {
			// handshake-phase decode failures always misbehave and drop
			debug!(
				"failed to deserialize {} from peer {}: {}",
				command.as_str(),
				peer.id,
				e
			);
			if command.is_handshake() {
				self.dos.misbehaving(peer.id, 1, "malformed handshake message");
				peer.request_disconnect();
			} else {
				self.send_reject(
					peer,
					command,
					RejectCode::Malformed,
					"error parsing message",
					None,
				);
			}
		}
		result
	}

	fn dispatch(&self, peer: &Arc<Peer>, command: Command, msg: &NetMessage) -> Result<(), Error> {
		match command {
			Command::Version => {
				let version: Version = decode_payload(msg)?;
				self.handshake
					.handle_version(peer, version, self.dos.as_ref(), self.start_height())?;
				Ok(())
			}
			Command::Verack => {
				self.handshake.handle_verack(peer, self.dos.as_ref())?;
				if peer.is_connected() {
					self.on_successfully_connected(peer);
				}
				Ok(())
			}
			Command::Xversion => {
				let map: XVersionMap = decode_payload(msg)?;
				self.handshake.handle_xversion(peer, map)?;
				if peer.is_connected() {
					self.on_successfully_connected(peer);
				}
				Ok(())
			}
			Command::Xupdate => {
				let map: XVersionMap = decode_payload(msg)?;
				crate::extversion::apply_xupdate(&map, &mut peer.xver.write());
				Ok(())
			}
			Command::Ping => {
				let ping: PingPong = decode_payload(msg)?;
				peer.send_msg(Command::Pong, &ping)?;
				Ok(())
			}
			Command::Pong => {
				let pong: PingPong = decode_payload(msg)?;
				if let Some(latency) = peer.pong_received(pong.nonce, Self::now_usecs()) {
					trace!("peer {} ping {} us", peer.id, latency);
				}
				Ok(())
			}
			Command::Addr => self.handle_addr(peer, msg),
			Command::GetAddr => {
				let addrs = self.addrbook.get_addresses(1000);
				let msg_addrs: Vec<crate::msg::TimedNetAddress> = addrs
					.into_iter()
					.map(|a| crate::msg::TimedNetAddress {
						time: Self::now_secs() as u32,
						addr: crate::msg::NetAddress::from_socket(a, 0),
					})
					.collect();
				peer.send_msg(Command::Addr, &AddrMsg { addrs: msg_addrs })?;
				Ok(())
			}
			Command::Inv => self.handle_inv(peer, msg),
			Command::GetData => self.handle_getdata(peer, msg),
			Command::GetHeaders => self.handle_getheaders(peer, msg),
			Command::Headers => self.handle_headers(peer, msg),
			Command::SendHeaders => {
				peer.prefer_headers.store(true, Ordering::Relaxed);
				Ok(())
			}
			Command::Tx => self.handle_tx(peer, msg),
			Command::Block => self.handle_block(peer, msg),
			Command::Reject => self.handle_reject(peer, msg),
			Command::FilterLoad => {
				let load: FilterLoadMsg = decode_payload(msg)?;
				let filter = crate::bloom::BloomFilter {
					data: load.data,
					n_hash_funcs: load.n_hash_funcs,
					tweak: load.tweak,
					flags: load.flags,
				};
				if !filter.is_within_size_constraints() {
					self.dos.misbehaving(peer.id, 100, "oversized bloom filter");
					return Err(Error::Misbehaving);
				}
				*peer.spv_filter.lock() = Some(filter);
				Ok(())
			}
			Command::FilterAdd => {
				// a bare data element to insert
				let data: Vec<u8> = decode_payload(msg)?;
				if data.len() > 520 {
					self.dos.misbehaving(peer.id, 100, "oversized filteradd");
					return Err(Error::Misbehaving);
				}
				let mut filter = peer.spv_filter.lock();
				match filter.as_mut() {
					Some(f) => {
						f.insert(&data);
						Ok(())
					}
					None => {
						self.dos
							.misbehaving(peer.id, 100, "filteradd without filterload");
						Err(Error::Misbehaving)
					}
				}
			}
			Command::FilterClear => {
				*peer.spv_filter.lock() = None;
				Ok(())
			}
			Command::GetXthin => self.handle_get_xthin(peer, msg),
			Command::XthinBlock => self.handle_xthin_block(peer, msg),
			Command::GetThin => self.handle_get_thin(peer, msg),
			Command::ThinBlock => self.handle_xthin_block(peer, msg),
			Command::GetXBlockTx => self.handle_get_xblocktx(peer, msg),
			Command::XBlockTx => self.handle_xblocktx(peer, msg),
			Command::GetGraphene => self.handle_get_graphene(peer, msg),
			Command::GrapheneBlock => self.handle_graphene_block(peer, msg),
			Command::GetGrapheneTx => self.handle_get_graphene_tx(peer, msg),
			Command::GrapheneTx => self.handle_graphene_tx(peer, msg),
			Command::GetGrapheneRecovery => self.handle_get_graphene_recovery(peer, msg),
			Command::GrapheneRecovery => self.handle_graphene_recovery(peer, msg),
			Command::SendCmpct => {
				let sc: SendCmpctMsg = decode_payload(msg)?;
				peer.compact_announce.store(sc.announce, Ordering::Relaxed);
				peer.compact_version.store(sc.version, Ordering::Relaxed);
				if sc.version > 0 {
					self.thinrelay.add_compact_peer(peer.id);
				}
				Ok(())
			}
			Command::CmpctBlock => self.handle_cmpct_block(peer, msg),
			Command::GetBlockTxn => self.handle_get_block_txn(peer, msg),
			Command::BlockTxn => self.handle_block_txn(peer, msg),
			Command::XpeditedRequest => {
				peer.expedited_blocks.store(true, Ordering::Relaxed);
				debug!("peer {} subscribed to expedited blocks", peer.id);
				Ok(())
			}
			Command::XpeditedBlock => self.handle_expedited_block(peer, msg),
			Command::XpeditedTxn => self.handle_tx(peer, msg),
			Command::GetMempoolSync => self.handle_get_mempool_sync(peer, msg),
			Command::MempoolSync => self.handle_mempool_sync(peer, msg),
			Command::GetMempoolSyncTx => self.handle_get_mempool_sync_tx(peer, msg),
			Command::MempoolSyncTx => self.handle_mempool_sync_tx(peer, msg),
			Command::DsProof => self.handle_dsproof(peer, msg),
			Command::MerkleBlock => {
				// we never request these; harmless to ignore
				Ok(())
			}
		}
	}

	fn start_height(&self) -> i32 {
		self.chain.tip().height as i32
	}

	fn on_successfully_connected(&self, peer: &Arc<Peer>) {
		self.thinrelay.add_peer(peer);
		self.requests.init_node_state(peer.id);
		self.addrbook.good(&peer.addr);
		info!(
			"peer {} ({}) fully connected, agent {}",
			peer.id,
			peer.addr,
			peer.info.read().user_agent
		);
	}

	fn send_reject(
		&self,
		peer: &Arc<Peer>,
		command: Command,
		code: RejectCode,
		reason: &str,
		hash: Option<Hash>,
	) {
		let _ = peer.send_msg(
			Command::Reject,
			&RejectMsg {
				message: command.as_str().to_string(),
				code: code as u8,
				reason: reason.to_string(),
				hash,
			},
		);
	}

	fn handle_addr(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let addr: AddrMsg = decode_payload(msg)?;
		if addr.addrs.len() > 1000 {
			self.dos.misbehaving(peer.id, 20, "oversized addr message");
			return Err(Error::Misbehaving);
		}
		// an inbound peer volunteering addresses may only tell us about
		// itself, curbing NAT-hidden self advertisement for others
		let from_inbound = peer.direction == crate::types::Direction::Inbound;
		let accepted: Vec<std::net::SocketAddr> = addr
			.addrs
			.iter()
			.filter(|a| !from_inbound || a.addr.ip == peer.addr.ip())
			.map(|a| a.addr.socket())
			.collect();
		if !accepted.is_empty() {
			self.addrbook.add(&accepted, &peer.addr.ip());
		}
		Ok(())
	}

	fn handle_inv(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let inv: InvMsg = decode_payload(msg)?;
		if inv.invs.is_empty() || inv.invs.len() > MAX_INV_SZ {
			self.dos.misbehaving(peer.id, 20, "bad inv size");
			return Err(Error::Misbehaving);
		}
		let ibd = self.chain.is_initial_block_download();
		for item in &inv.invs {
			peer.filter_known_inventory(&item.hash);
			match item.kind {
				InvType::Block => {
					self.requests.update_block_availability(peer.id, item.hash);
					if self.chain.lookup(&item.hash).is_none() && !ibd {
						// headers-first: learn the header chain before the body
						let gh = GetHeaders {
							version: PROTOCOL_VERSION,
							locator: self.chain.locator(),
							stop: item.hash,
						};
						peer.send_msg(Command::GetHeaders, &gh)?;
					}
				}
				InvType::Tx => {
					if self.config.blocks_only && !self.config.is_whitelisted(&peer.addr.ip()) {
						continue;
					}
					if !self.mempool.contains(&item.hash) && !ibd {
						self.requests.ask_for(item, peer, 0);
					}
				}
				InvType::DoubleSpendProof => {
					self.requests.ask_for(item, peer, 0);
				}
				_ => {}
			}
		}
		Ok(())
	}

	fn handle_getdata(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let inv: InvMsg = decode_payload(msg)?;
		if inv.invs.is_empty() || inv.invs.len() > MAX_INV_SZ {
			self.dos.misbehaving(peer.id, 20, "bad getdata size");
			return Err(Error::Misbehaving);
		}

		let mut tx_batch: Vec<u8> = vec![];
		let tx_concat = peer.xver.read().txn_concat;

		for item in &inv.invs {
			match item.kind {
				InvType::Block | InvType::CmpctBlock | InvType::FilteredBlock => {
					self.serve_block(peer, item)?;
				}
				InvType::Tx => {
					if let Some(tx) = self.mempool.get(&item.hash) {
						if tx_concat {
							let ser = crate::core::ser::ser_vec(&*tx)?;
							tx_batch.extend_from_slice(&ser);
							if tx_batch.len() >= TXN_CONCAT_THRESHOLD {
								self.send_raw_tx_batch(peer, &mut tx_batch)?;
							}
						} else {
							peer.send_msg(Command::Tx, &*tx)?;
						}
					}
				}
				_ => {}
			}
		}
		if !tx_batch.is_empty() {
			self.send_raw_tx_batch(peer, &mut tx_batch)?;
		}
		Ok(())
	}

	fn send_raw_tx_batch(&self, peer: &Arc<Peer>, batch: &mut Vec<u8>) -> Result<(), Error> {
		struct RawPayload(Vec<u8>);
		impl crate::core::ser::Writeable for RawPayload {
			fn write<W: crate::core::ser::Writer>(
				&self,
				writer: &mut W,
			) -> Result<(), crate::core::ser::Error> {
				writer.write_fixed_bytes(&self.0)
			}
		}
		let payload = RawPayload(std::mem::replace(batch, vec![]));
		peer.send_msg(Command::Tx, &payload)
	}

	fn serve_block(&self, peer: &Arc<Peer>, item: &Inv) -> Result<(), Error> {
		if !self.chain.can_serve_block(&item.hash) {
			debug!("not serving block {} to peer {}", item.hash, peer.id);
			return Ok(());
		}
		let block = match self.chain.read_block(&item.hash) {
			Some(b) => b,
			None => return Ok(()),
		};
		let block_size = block.total_size();

		// historical serving is bounded for non-whitelisted peers
		let week_old = (Self::now_secs() - block.header.time as i64) > 7 * 24 * 3600;
		if week_old && self.config.max_upload_target > 0 {
			let served = peer
				.historical_bytes_served
				.fetch_add(block_size, Ordering::Relaxed)
				+ block_size;
			if served > self.config.max_upload_target
				&& !self.config.is_whitelisted(&peer.addr.ip())
			{
				warn!(
					"peer {} exceeded the historical upload budget, disconnecting",
					peer.id
				);
				peer.request_disconnect();
				return Err(Error::ConnectionClose);
			}
		}

		match item.kind {
			InvType::CmpctBlock => {
				let nonce = rand::thread_rng().gen();
				let compact = compactblock::build_compact(&block, nonce);
				peer.send_msg(Command::CmpctBlock, &compact)?;
			}
			InvType::FilteredBlock => {
				let matched: Vec<TxRef> = {
					let filter = peer.spv_filter.lock();
					match filter.as_ref() {
						Some(f) => block
							.txs
							.iter()
							.filter(|tx| f.contains(tx.txid().as_bytes()))
							.cloned()
							.collect(),
						None => vec![],
					}
				};
				let merkle = MerkleBlockMsg {
					header: block.header,
					total_txs: block.txs.len() as u64,
					matched: matched.iter().map(|tx| tx.txid()).collect(),
				};
				peer.send_msg(Command::MerkleBlock, &merkle)?;
				for tx in matched {
					peer.send_msg(Command::Tx, &*tx)?;
				}
			}
			_ => {
				// historical bulk rides the low-priority tier
				if week_old {
					peer.send_msg_low_priority(Command::Block, &block)?;
				} else {
					peer.send_msg(Command::Block, &block)?;
				}
			}
		}
		Ok(())
	}

	fn handle_getheaders(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let gh: GetHeaders = decode_payload(msg)?;
		let headers = self.chain.locate_headers(&gh.locator, MAX_HEADERS_RESULTS);
		peer.send_msg(Command::Headers, &HeadersMsg { headers })?;
		Ok(())
	}

	fn handle_headers(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let headers: HeadersMsg = decode_payload(msg)?;
		if headers.headers.len() > MAX_HEADERS_RESULTS {
			self.dos.misbehaving(peer.id, 20, "too many headers");
			return Err(Error::Misbehaving);
		}
		if headers.headers.is_empty() {
			return Ok(());
		}

		// continuity: each header must extend the one before it
		for pair in headers.headers.windows(2) {
			if pair[1].prev_block_hash != pair[0].hash() {
				self.dos.misbehaving(peer.id, 20, "non-continuous headers");
				return Err(Error::Misbehaving);
			}
		}

		let first = &headers.headers[0];
		let connects = self.chain.lookup(&first.prev_block_hash).is_some();
		if !connects {
			if self.chain.is_initial_block_download() {
				// a peer that cannot even start from our locator is
				// stalling the initial sync
				debug!("peer {} sent unconnecting headers during IBD", peer.id);
				peer.request_disconnect();
				return Err(Error::ConnectionClose);
			}
			let mut stash = self.unconnected_headers.lock();
			if stash.len() >= MAX_UNCONNECTED_HEADERS {
				// drop the stalest entry
				if let Some(oldest) = stash
					.iter()
					.min_by_key(|(_, (_, t))| *t)
					.map(|(h, _)| *h)
				{
					stash.remove(&oldest);
				}
			}
			stash.insert(
				first.prev_block_hash,
				(headers.headers.clone(), Instant::now()),
			);
			return Ok(());
		}

		let mut last_hash = Hash::default();
		for header in &headers.headers {
			match self.chain.accept_block_header(header) {
				Ok(info) => last_hash = info.hash,
				Err(code) => {
					self.send_reject(
						peer,
						Command::Headers,
						code,
						"invalid header",
						Some(header.hash()),
					);
					self.dos.misbehaving(peer.id, 20, "invalid header");
					return Err(Error::Misbehaving);
				}
			}
		}
		if !last_hash.is_null() {
			self.requests.update_block_availability(peer.id, last_hash);
		}

		// retry any stashed children now connectable, and expire the rest
		{
			let stash_hit = self.unconnected_headers.lock().remove(&last_hash);
			if let Some((children, _)) = stash_hit {
				for header in &children {
					let _ = self.chain.accept_block_header(header);
				}
			}
			self.unconnected_headers
				.lock()
				.retain(|_, (_, t)| t.elapsed().as_secs() < UNCONNECTED_HEADERS_TIMEOUT_SECS);
		}

		// a full batch means there is more where that came from
		if headers.headers.len() == MAX_HEADERS_RESULTS {
			let gh = GetHeaders {
				version: PROTOCOL_VERSION,
				locator: vec![last_hash],
				stop: Hash::default(),
			};
			peer.send_msg(Command::GetHeaders, &gh)?;
		}

		// once close to the tip we can fetch the bodies straight away
		if self.chain.is_chain_nearly_syncd() || self.chain.is_initial_block_download() {
			self.requests.request_next_blocks_to_download(peer);
		}
		Ok(())
	}

	fn handle_tx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if self.config.blocks_only && !self.config.is_whitelisted(&peer.addr.ip()) {
			debug!("ignoring txn from peer {} in blocks-only mode", peer.id);
			return Ok(());
		}
		// consume as many concatenated txns as the payload holds
		let mut slice = &msg.payload[..];
		while !slice.is_empty() {
			let mut reader = BinReader::new(&mut slice);
			let tx = Transaction::read(&mut reader).map_err(Error::Serialization)?;
			let tx = Arc::new(tx);
			let txid = tx.txid();
			self.requests.processing_txn(&txid, peer);
			self.mempool.submit(tx, peer.id);
			let inv = Inv::new(InvType::Tx, txid);
			self.requests.received(&inv, peer);
		}
		Ok(())
	}

	fn handle_block(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let block: Block = decode_payload(msg)?;
		// the frame must hold exactly the declared block, nothing more
		if block.total_size() != msg.payload.len() as u64 {
			self.dos.misbehaving(peer.id, 20, "block size mismatch");
			return Err(Error::Misbehaving);
		}
		let hash = block.hash();
		debug!("received block {} from peer {}", hash, peer.id);
		self.accept_block(peer, hash, block, InvType::Block)
	}

	/// Common tail for a fully received or reconstructed block: forward
	/// through the expedited channel when near-sync, then hand it to the
	/// parallel validator.
	fn accept_block(
		&self,
		peer: &Arc<Peer>,
		hash: Hash,
		block: Block,
		kind: InvType,
	) -> Result<(), Error> {
		self.thinrelay.block_was_received(peer.id, &hash);
		self.thinrelay.clear_timer(&hash);

		if self.chain.is_chain_nearly_syncd() {
			self.forward_expedited(peer, &block, 0);
		}

		self.requests.processing_block(&hash, peer);
		self.validator
			.handle_block(peer.id, block, Inv::new(kind, hash));
		Ok(())
	}

	fn forward_expedited(&self, source: &Arc<Peer>, block: &Block, hops: u8) {
		if hops >= MAX_EXPEDITED_HOPS {
			return;
		}
		for other in self.peers.connected_peers() {
			if other.id == source.id || !other.is_connected() {
				continue;
			}
			if !other.expedited_blocks.load(Ordering::Relaxed) {
				continue;
			}
			if other.filter_sent_inventory(&block.hash()) {
				continue;
			}
			let _ = other.send_msg(
				Command::XpeditedBlock,
				&XpeditedBlockMsg {
					hops: hops + 1,
					block: block.clone(),
				},
			);
		}
	}

	fn handle_expedited_block(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let xb: XpeditedBlockMsg = decode_payload(msg)?;
		let hash = xb.block.hash();
		if self.chain.lookup(&hash).is_some() {
			return Ok(());
		}
		debug!(
			"received expedited block {} ({} hops) from peer {}",
			hash, xb.hops, peer.id
		);
		self.forward_expedited(peer, &xb.block, xb.hops);
		self.requests.processing_block(&hash, peer);
		self.validator
			.handle_block(peer.id, xb.block, Inv::new(InvType::Block, hash));
		Ok(())
	}

	fn handle_reject(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let reject: RejectMsg = decode_payload(msg)?;
		debug!(
			"peer {} rejected our {}: {:#x} {}",
			peer.id, reject.message, reject.code, reject.reason
		);
		if let Some(hash) = reject.hash {
			let kind = if reject.message == "tx" {
				InvType::Tx
			} else {
				InvType::Block
			};
			self.requests
				.rejected(&Inv::new(kind, hash), peer.id, RejectCode::from_u8(reject.code));
		}
		Ok(())
	}

	// ---- xthin ----

	fn handle_get_xthin(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if self.requests.check_for_request_dos(peer, Self::now_secs()) {
			return Err(Error::ConnectionClose);
		}
		let req: GetXthin = decode_payload(msg)?;
		let block = match self.chain.read_block(&req.inv.hash) {
			Some(b) => b,
			None => {
				self.send_reject(
					peer,
					Command::GetXthin,
					RejectCode::Invalid,
					"block not found",
					Some(req.inv.hash),
				);
				return Ok(());
			}
		};
		let salt = rand::thread_rng().gen();
		let xthin = thinblock::build_xthin(&block, &req.filter, salt);
		// fall back to the full block when thin encoding cannot win
		let thin_size = crate::core::ser::ser_vec(&xthin)?.len() as u64;
		if thin_size >= block.total_size() {
			peer.send_msg(Command::Block, &block)?;
		} else {
			Self::remember_sent(&self.sent_xthin_salts, (peer.id, req.inv.hash), salt);
			peer.send_msg(Command::XthinBlock, &xthin)?;
		}
		Ok(())
	}

	fn handle_get_thin(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		// legacy variant without a filter: everything but the coinbase is
		// assumed present
		if self.requests.check_for_request_dos(peer, Self::now_secs()) {
			return Err(Error::ConnectionClose);
		}
		let inv: InvMsg = decode_payload(msg)?;
		for item in inv.invs.iter().take(1) {
			if let Some(block) = self.chain.read_block(&item.hash) {
				let empty = crate::bloom::BloomFilter::new(1, 0.01, 0, 0);
				let salt = rand::thread_rng().gen();
				let thin = thinblock::build_xthin(&block, &empty, salt);
				Self::remember_sent(&self.sent_xthin_salts, (peer.id, item.hash), salt);
				peer.send_msg(Command::ThinBlock, &thin)?;
			}
		}
		Ok(())
	}

	fn handle_xthin_block(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let xthin: XthinBlock = decode_payload(msg)?;
		let hash = xthin.header.hash();
		if !self.thinrelay.is_in_flight(peer.id, ThinType::Xthin, &hash) {
			self.dos
				.misbehaving(peer.id, 10, "unrequested xthin block");
			return Ok(());
		}

		let slot = self.thinrelay.set_block_to_reconstruct(peer.id, hash);
		if self
			.thinrelay
			.add_block_bytes(msg.frame_size, &slot)
			.is_err()
		{
			warn!("xthin block {} exceeded the reassembly budget", hash);
			self.thinrelay.clear_all_block_data(peer.id, &hash);
			self.dos.misbehaving(peer.id, 20, "oversized reassembly");
			return Err(Error::Misbehaving);
		}

		let pool = self.pool_entries();
		let outcome = {
			let mut slot_guard = slot.lock();
			thinblock::reconstruct_xthin(&mut slot_guard, &xthin, &pool)
		};
		match outcome {
			ReconstructResult::Complete(block) => {
				self.accept_block(peer, hash, block, InvType::XthinBlock)
			}
			ReconstructResult::NeedTxs(short_ids) => {
				debug!(
					"xthin {} missing {} txns, requesting from peer {}",
					hash,
					short_ids.len(),
					peer.id
				);
				peer.send_msg(
					Command::GetXBlockTx,
					&GetXBlockTx {
						block_hash: hash,
						short_ids,
					},
				)?;
				Ok(())
			}
			ReconstructResult::Failed => {
				// unusable representation; start over with a full block
				self.refetch_full(peer, hash)
			}
		}
	}

	fn handle_get_xblocktx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if self.requests.check_for_request_dos(peer, Self::now_secs()) {
			return Err(Error::ConnectionClose);
		}
		let req: GetXBlockTx = decode_payload(msg)?;
		let block = match self.chain.read_block(&req.block_hash) {
			Some(b) => b,
			None => return Ok(()),
		};
		let salt = match self
			.sent_xthin_salts
			.lock()
			.get(&(peer.id, req.block_hash))
			.cloned()
		{
			Some(s) => s,
			None => {
				self.dos
					.misbehaving(peer.id, 10, "xblocktx for a block we never served thin");
				return Ok(());
			}
		};
		let wanted: std::collections::HashSet<u64> = req.short_ids.iter().cloned().collect();
		let txs: Vec<Transaction> = block
			.txs
			.iter()
			.filter(|tx| wanted.contains(&thinblock::xthin_short_id(salt, &tx.txid())))
			.map(|t| (**t).clone())
			.collect();
		peer.send_msg(
			Command::XBlockTx,
			&XBlockTx {
				block_hash: req.block_hash,
				txs,
			},
		)?;
		Ok(())
	}

	fn handle_xblocktx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let resp: XBlockTx = decode_payload(msg)?;
		let hash = resp.block_hash;
		let slot = match self.thinrelay.get_block_to_reconstruct(peer.id, &hash) {
			Some(s) => s,
			None => {
				self.dos.misbehaving(peer.id, 10, "unrequested xblocktx");
				return Ok(());
			}
		};
		if self
			.thinrelay
			.add_block_bytes(msg.frame_size, &slot)
			.is_err()
		{
			self.thinrelay.clear_all_block_data(peer.id, &hash);
			self.dos.misbehaving(peer.id, 20, "oversized reassembly");
			return Err(Error::Misbehaving);
		}
		let pool = self.pool_entries();
		let outcome = {
			let mut slot_guard = slot.lock();
			for tx in &resp.txs {
				let tx = Arc::new(tx.clone());
				slot_guard.collected.insert(tx.txid(), tx);
			}
			thinblock::complete_from_slot(&slot_guard, &pool)
		};
		match outcome {
			ReconstructResult::Complete(block) => {
				self.accept_block(peer, hash, block, InvType::XthinBlock)
			}
			ReconstructResult::NeedTxs(_) | ReconstructResult::Failed => {
				self.refetch_full(peer, hash)
			}
		}
	}

	// ---- graphene ----

	fn handle_get_graphene(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if self.requests.check_for_request_dos(peer, Self::now_secs()) {
			return Err(Error::ConnectionClose);
		}
		let req: GetGraphene = decode_payload(msg)?;
		let block = match self.chain.read_block(&req.inv.hash) {
			Some(b) => b,
			None => {
				self.send_reject(
					peer,
					Command::GetGraphene,
					RejectCode::Invalid,
					"block not found",
					Some(req.inv.hash),
				);
				return Ok(());
			}
		};
		let version = peer.xver.read().graphene_version.max(1);
		let nonce = rand::thread_rng().gen();
		let graphene = graphene::build_graphene(&block, &req.mempool_info, version, nonce);
		Self::remember_sent(&self.sent_graphene_nonces, (peer.id, req.inv.hash), nonce);
		peer.send_msg(Command::GrapheneBlock, &graphene)?;
		Ok(())
	}

	fn handle_graphene_block(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let graphene_block: GrapheneBlock = decode_payload(msg)?;
		let hash = graphene_block.header.hash();
		if !self
			.thinrelay
			.is_in_flight(peer.id, ThinType::Graphene, &hash)
		{
			self.dos
				.misbehaving(peer.id, 10, "unrequested graphene block");
			return Ok(());
		}
		let slot = self.thinrelay.set_block_to_reconstruct(peer.id, hash);
		if self
			.thinrelay
			.add_block_bytes(msg.frame_size, &slot)
			.is_err()
		{
			self.thinrelay.clear_all_block_data(peer.id, &hash);
			self.dos.misbehaving(peer.id, 20, "oversized reassembly");
			return Err(Error::Misbehaving);
		}

		let pool = self.pool_entries();
		let outcome = {
			let mut slot_guard = slot.lock();
			graphene::reconstruct_graphene(&mut slot_guard, &graphene_block, &pool)
		};
		self.finish_graphene(peer, hash, outcome)
	}

	fn finish_graphene(
		&self,
		peer: &Arc<Peer>,
		hash: Hash,
		outcome: GrapheneResult,
	) -> Result<(), Error> {
		match outcome {
			GrapheneResult::Complete(block) => {
				self.accept_block(peer, hash, block, InvType::GrapheneBlock)
			}
			GrapheneResult::NeedTxs(short_ids) => {
				debug!(
					"graphene {} missing {} txns, requesting from peer {}",
					hash,
					short_ids.len(),
					peer.id
				);
				peer.send_msg(
					Command::GetGrapheneTx,
					&GetGrapheneTx {
						block_hash: hash,
						short_ids,
					},
				)?;
				Ok(())
			}
			GrapheneResult::NeedRecovery => {
				debug!("graphene {} failed to peel, requesting recovery", hash);
				peer.send_msg(
					Command::GetGrapheneRecovery,
					&GetGrapheneRecovery { block_hash: hash },
				)?;
				Ok(())
			}
		}
	}

	fn handle_get_graphene_tx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if self.requests.check_for_request_dos(peer, Self::now_secs()) {
			return Err(Error::ConnectionClose);
		}
		let req: GetGrapheneTx = decode_payload(msg)?;
		let block = match self.chain.read_block(&req.block_hash) {
			Some(b) => b,
			None => return Ok(()),
		};
		let nonce = match self
			.sent_graphene_nonces
			.lock()
			.get(&(peer.id, req.block_hash))
			.cloned()
		{
			Some(n) => n,
			None => {
				self.dos
					.misbehaving(peer.id, 10, "grblktx for a block we never served graphene");
				return Ok(());
			}
		};
		let wanted: std::collections::HashSet<u64> = req.short_ids.iter().cloned().collect();
		let txs: Vec<Transaction> = block
			.txs
			.iter()
			.filter(|tx| wanted.contains(&graphene::graphene_short_id(nonce, &tx.txid())))
			.map(|t| (**t).clone())
			.collect();
		peer.send_msg(
			Command::GrapheneTx,
			&GrapheneTx {
				block_hash: req.block_hash,
				txs,
			},
		)?;
		Ok(())
	}

	fn handle_graphene_tx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let resp: GrapheneTx = decode_payload(msg)?;
		let hash = resp.block_hash;
		let slot = match self.thinrelay.get_block_to_reconstruct(peer.id, &hash) {
			Some(s) => s,
			None => {
				self.dos.misbehaving(peer.id, 10, "unrequested graphene txns");
				return Ok(());
			}
		};
		if self
			.thinrelay
			.add_block_bytes(msg.frame_size, &slot)
			.is_err()
		{
			self.thinrelay.clear_all_block_data(peer.id, &hash);
			self.dos.misbehaving(peer.id, 20, "oversized reassembly");
			return Err(Error::Misbehaving);
		}
		let pool = self.pool_entries();
		let outcome = {
			let mut slot_guard = slot.lock();
			graphene::add_txs(&mut slot_guard, &resp.txs, &pool)
		};
		match outcome {
			GrapheneResult::NeedRecovery => self.refetch_full(peer, hash),
			other => self.finish_graphene(peer, hash, other),
		}
	}

	fn handle_get_graphene_recovery(
		&self,
		peer: &Arc<Peer>,
		msg: &NetMessage,
	) -> Result<(), Error> {
		let req: GetGrapheneRecovery = decode_payload(msg)?;
		if let Some(block) = self.chain.read_block(&req.block_hash) {
			let recovery = GrapheneRecovery {
				block_hash: req.block_hash,
				tx_hashes: block.txs.iter().map(|t| t.txid()).collect(),
			};
			peer.send_msg(Command::GrapheneRecovery, &recovery)?;
		}
		Ok(())
	}

	fn handle_graphene_recovery(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let resp: GrapheneRecovery = decode_payload(msg)?;
		let hash = resp.block_hash;
		let slot = match self.thinrelay.get_block_to_reconstruct(peer.id, &hash) {
			Some(s) => s,
			None => return Ok(()),
		};
		let pool = self.pool_entries();
		let outcome = {
			let mut slot_guard = slot.lock();
			let (nonce, n_txs) = match slot_guard.graphene.as_ref() {
				Some(d) => (d.nonce, d.n_block_txs),
				None => (0, resp.tx_hashes.len() as u64),
			};
			let n_txs = if n_txs == 0 {
				resp.tx_hashes.len() as u64
			} else {
				n_txs
			};
			graphene::apply_recovery(&mut slot_guard, &resp, nonce, n_txs, &pool)
		};
		match outcome {
			GrapheneResult::NeedRecovery => self.refetch_full(peer, hash),
			other => self.finish_graphene(peer, hash, other),
		}
	}

	// ---- compact ----

	fn handle_cmpct_block(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let compact: CompactBlock = decode_payload(msg)?;
		let hash = compact.header.hash();
		// compact blocks may also arrive unsolicited as announcements
		let solicited = self
			.thinrelay
			.is_in_flight(peer.id, ThinType::Compact, &hash);
		if !solicited && self.chain.lookup(&hash).is_some() {
			return Ok(());
		}

		let slot = self.thinrelay.set_block_to_reconstruct(peer.id, hash);
		if self
			.thinrelay
			.add_block_bytes(msg.frame_size, &slot)
			.is_err()
		{
			self.thinrelay.clear_all_block_data(peer.id, &hash);
			self.dos.misbehaving(peer.id, 20, "oversized reassembly");
			return Err(Error::Misbehaving);
		}

		let pool = self.pool_entries();
		let outcome = {
			let mut slot_guard = slot.lock();
			compactblock::reconstruct_compact(&mut slot_guard, &compact, &pool)
		};
		match outcome {
			CompactResult::Complete(block) => {
				self.accept_block(peer, hash, block, InvType::CmpctBlock)
			}
			CompactResult::NeedTxs(indexes) => {
				debug!(
					"compact block {} missing {} txns, requesting from peer {}",
					hash,
					indexes.len(),
					peer.id
				);
				peer.send_msg(
					Command::GetBlockTxn,
					&GetBlockTxn {
						block_hash: hash,
						indexes,
					},
				)?;
				Ok(())
			}
			CompactResult::Failed => self.refetch_full(peer, hash),
		}
	}

	fn handle_get_block_txn(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if self.requests.check_for_request_dos(peer, Self::now_secs()) {
			return Err(Error::ConnectionClose);
		}
		let req: GetBlockTxn = decode_payload(msg)?;
		let block = match self.chain.read_block(&req.block_hash) {
			Some(b) => b,
			None => return Ok(()),
		};
		let mut txs = vec![];
		for idx in &req.indexes {
			match block.txs.get(*idx as usize) {
				Some(tx) => txs.push((**tx).clone()),
				None => {
					self.dos
						.misbehaving(peer.id, 100, "getblocktxn index out of range");
					return Err(Error::Misbehaving);
				}
			}
		}
		peer.send_msg(
			Command::BlockTxn,
			&BlockTxn {
				block_hash: req.block_hash,
				txs,
			},
		)?;
		Ok(())
	}

	fn handle_block_txn(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let resp: BlockTxn = decode_payload(msg)?;
		let hash = resp.block_hash;
		let slot = match self.thinrelay.get_block_to_reconstruct(peer.id, &hash) {
			Some(s) => s,
			None => {
				self.dos.misbehaving(peer.id, 10, "unrequested blocktxn");
				return Ok(());
			}
		};
		if self
			.thinrelay
			.add_block_bytes(msg.frame_size, &slot)
			.is_err()
		{
			self.thinrelay.clear_all_block_data(peer.id, &hash);
			self.dos.misbehaving(peer.id, 20, "oversized reassembly");
			return Err(Error::Misbehaving);
		}
		let outcome = {
			let mut slot_guard = slot.lock();
			compactblock::fill_compact_gaps(&mut slot_guard, &resp.txs)
		};
		match outcome {
			CompactResult::Complete(block) => {
				self.accept_block(peer, hash, block, InvType::CmpctBlock)
			}
			_ => self.refetch_full(peer, hash),
		}
	}

	// ---- mempool sync ----

	fn handle_get_mempool_sync(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if !self.config.use_mempool_sync {
			return Ok(());
		}
		let req: GetMempoolSync = decode_payload(msg)?;
		{
			let mut last = peer.last_mempool_sync.lock();
			if let Some(t) = *last {
				if t.elapsed() < MEMPOOL_SYNC_MIN_INTERVAL {
					debug!("rate limiting mempool sync for peer {}", peer.id);
					return Ok(());
				}
			}
			*last = Some(Instant::now());
		}
		let cheap_hashes: Vec<u64> = self
			.mempool
			.query_hashes()
			.iter()
			.map(|h| h.cheap_hash())
			.collect();
		peer.send_msg(
			Command::MempoolSync,
			&MempoolSync {
				nonce: req.nonce,
				cheap_hashes,
			},
		)?;
		Ok(())
	}

	fn handle_mempool_sync(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let resp: MempoolSync = decode_payload(msg)?;
		let ours = self.mempool.query_hashes();
		// we want what they have and we don't
		let theirs: std::collections::HashSet<u64> = resp.cheap_hashes.iter().cloned().collect();
		let have: std::collections::HashSet<u64> = ours.iter().map(|h| h.cheap_hash()).collect();
		let missing: Vec<u64> = theirs.difference(&have).cloned().collect();
		if !missing.is_empty() {
			peer.send_msg(
				Command::GetMempoolSyncTx,
				&GetMempoolSyncTx {
					cheap_hashes: missing,
				},
			)?;
		}
		Ok(())
	}

	fn handle_get_mempool_sync_tx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let req: GetMempoolSyncTx = decode_payload(msg)?;
		let wanted: std::collections::HashSet<u64> = req.cheap_hashes.iter().cloned().collect();
		let mut txs = vec![];
		for txid in self.mempool.query_hashes() {
			if wanted.contains(&txid.cheap_hash()) {
				if let Some(tx) = self.mempool.get(&txid) {
					txs.push((*tx).clone());
				}
			}
		}
		peer.send_msg(Command::MempoolSyncTx, &MempoolSyncTx { txs })?;
		Ok(())
	}

	fn handle_mempool_sync_tx(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		let resp: MempoolSyncTx = decode_payload(msg)?;
		for tx in resp.txs {
			self.mempool.submit(Arc::new(tx), peer.id);
		}
		Ok(())
	}

	fn handle_dsproof(&self, peer: &Arc<Peer>, msg: &NetMessage) -> Result<(), Error> {
		if let Some(spent_tx) = self.mempool.add_double_spend_proof(&msg.payload) {
			let proof_hash = crate::core::core::hash::sha256d(&msg.payload);
			debug!(
				"valid double-spend proof {} against txn {}",
				proof_hash,
				spent_tx.txid()
			);
			// peers filtering on the double-spent txn hear about it too
			let inv = Inv::new(InvType::DoubleSpendProof, proof_hash);
			for other in self.peers.connected_peers() {
				if other.id == peer.id || !other.is_connected() {
					continue;
				}
				let wants = {
					let filter = other.spv_filter.lock();
					match filter.as_ref() {
						Some(f) => f.contains(spent_tx.txid().as_bytes()),
						None => true,
					}
				};
				if wants && !other.filter_sent_inventory(&proof_hash) {
					let _ = other.send_msg(Command::Inv, &InvMsg { invs: vec![inv] });
				}
			}
		}
		Ok(())
	}

	/// A thin representation could not be completed: clear its state and
	/// ask another source for the full block.
	fn refetch_full(&self, peer: &Arc<Peer>, hash: Hash) -> Result<(), Error> {
		warn!(
			"reconstruction of {} from peer {} failed, refetching full block",
			hash, peer.id
		);
		self.thinrelay.clear_all_block_data(peer.id, &hash);
		let inv = Inv::new(InvType::Block, hash);
		self.requests.block_rejected(&inv, peer.id);
		self.requests.ask_for(&inv, peer, 0);
		Ok(())
	}
}
