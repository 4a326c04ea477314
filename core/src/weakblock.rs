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

//! The weak-block store: a DAG of blocks satisfying a reduced
//! proof-of-work target, used to piggyback mempool hints on the wire. A
//! weak block commits to the weak block it extends through an OP_RETURN
//! tag in its coinbase. The store tracks chain tips, answers the
//! longest-weak-chain query and expires content with a two-pass
//! mark-and-sweep.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::block::Block;
use crate::core::hash::{Hash, ZERO_HASH};

const OP_RETURN: u8 = 0x6a;

/// A stored weak block.
pub struct Weakblock {
	/// The underlying block.
	pub block: Block,
	hash: Hash,
}

impl Weakblock {
	/// The block hash.
	pub fn hash(&self) -> Hash {
		self.hash
	}
}

/// Weak blocks are shared between the store, its tip vector and callers.
pub type WeakblockRef = Arc<Weakblock>;

/// Extract the weak-block commitment from a block's coinbase, if any.
/// The committing output script is exactly 36 bytes:
/// OP_RETURN, size byte 0x22, 'W', 'B', then the 32-byte parent hash.
pub fn extract_commitment(block: &Block) -> Hash {
	let coinbase = match block.txs.first() {
		Some(cb) => cb,
		None => return ZERO_HASH,
	};
	for out in &coinbase.outputs {
		let cand = &out.script_pubkey;
		if cand.len() == 36
			&& cand[0] == OP_RETURN
			&& cand[1] == 0x22
			&& cand[2] == b'W'
			&& cand[3] == b'B'
		{
			let hash = Hash::from_vec(&cand[4..36]);
			debug!(
				"found candidate weak block hash {} in block {}",
				hash,
				block.hash()
			);
			return hash;
		}
	}
	ZERO_HASH
}

/// Whether `block` extends `underlying`: the underlying block's
/// transactions, coinbase excluded, must be a prefix of the block's.
pub fn extends(block: &Block, underlying: &Block) -> bool {
	if underlying.txs.len() > block.txs.len() {
		return false;
	}
	for i in 1..underlying.txs.len() {
		if underlying.txs[i].txid() != block.txs[i].txid() {
			return false;
		}
	}
	true
}

/// The weak-block DAG store.
pub struct WeakStore {
	hash_to_weak: HashMap<Hash, WeakblockRef>,
	cheap_hash_to_weak: HashMap<u64, WeakblockRef>,
	/// child hash -> parent hash
	extends_map: HashMap<Hash, Hash>,
	chain_tips: Vec<WeakblockRef>,
	to_remove: HashSet<Hash>,
	/// children whose commitment named a parent not yet seen, by parent
	pending_parent: HashMap<Hash, Vec<Hash>>,
	height_cache: RefCell<HashMap<Hash, i32>>,
}

impl WeakStore {
	/// A new empty store.
	pub fn new() -> WeakStore {
		WeakStore {
			hash_to_weak: HashMap::new(),
			cheap_hash_to_weak: HashMap::new(),
			extends_map: HashMap::new(),
			chain_tips: vec![],
			to_remove: HashSet::new(),
			pending_parent: HashMap::new(),
			height_cache: RefCell::new(HashMap::new()),
		}
	}

	/// Track a new weak block. Returns None if the hash is already stored.
	/// A commitment naming an unknown parent, or one the block does not in
	/// fact extend, starts a new chain root.
	pub fn store(&mut self, block: &Block) -> Option<WeakblockRef> {
		let blockhash = block.hash();
		let underlyinghash = extract_commitment(block);

		if self.hash_to_weak.contains_key(&blockhash) {
			debug!("ignoring attempt to store weak block {} twice", blockhash);
			return None;
		}

		let mut underlying = if underlyinghash.is_null() {
			None
		} else {
			self.hash_to_weak.get(&underlyinghash).cloned()
		};

		if !underlyinghash.is_null() && underlying.is_none() {
			debug!(
				"weak block {} with unknown underlying block {}, assuming start of new chain",
				blockhash, underlyinghash
			);
			self.pending_parent
				.entry(underlyinghash)
				.or_insert_with(Vec::new)
				.push(blockhash);
		} else if let Some(ref u) = underlying {
			if !extends(block, &u.block) {
				warn!(
					"block {} does not extend weak block {}, even though it says so; \
					 assuming start of new chain",
					blockhash, underlyinghash
				);
				underlying = None;
			}
		}

		let wb = Arc::new(Weakblock {
			block: block.clone(),
			hash: blockhash,
		});

		self.hash_to_weak.insert(blockhash, wb.clone());

		let cheap = blockhash.cheap_hash();
		if self.cheap_hash_to_weak.contains_key(&cheap) {
			warn!("weak block cheap hash collision for weak block {}", blockhash);
		}
		self.cheap_hash_to_weak.insert(cheap, wb.clone());

		if let Some(ref u) = underlying {
			self.extends_map.insert(blockhash, underlyinghash);
			debug!(
				"weak block {} is referring to underlying weak block {}",
				blockhash, underlyinghash
			);
			let parent_hash = u.hash();
			self.chain_tips.retain(|t| t.hash() != parent_hash);
		}
		self.chain_tips.push(wb.clone());

		// Late-arriving parent: link any children that committed to this
		// hash before it was seen, so the rebuilt DAG does not depend on
		// delivery order.
		if let Some(children) = self.pending_parent.remove(&blockhash) {
			let mut linked_any = false;
			for child_hash in children {
				if let Some(child) = self.hash_to_weak.get(&child_hash).cloned() {
					if extends(&child.block, block) {
						self.extends_map.insert(child_hash, blockhash);
						linked_any = true;
					}
				}
			}
			if linked_any {
				self.chain_tips.retain(|t| t.hash() != blockhash);
			}
		}

		self.height_cache.borrow_mut().clear();

		debug!(
			"tracking weak block {} (short: {:x}) of {} transaction(s), parent: {}",
			blockhash,
			cheap,
			wb.block.txs.len(),
			wb.block.header.prev_block_hash
		);
		Some(wb)
	}

	/// The weak height of a stored block: 0 for a chain root, one more than
	/// the parent otherwise, -1 once marked for removal.
	pub fn weak_height(&self, hash: &Hash) -> i32 {
		if let Some(h) = self.height_cache.borrow().get(hash) {
			return *h;
		}

		let height = if self.to_remove.contains(hash) {
			-1
		} else if let Some(parent_hash) = self.extends_map.get(hash).cloned() {
			if self.hash_to_weak.contains_key(&parent_hash) {
				let prev = self.weak_height(&parent_hash);
				if prev >= 0 {
					1 + prev
				} else {
					-1
				}
			} else {
				error!("weak_height: underlying weak block {} not found", parent_hash);
				-1
			}
		} else {
			0
		};

		self.height_cache.borrow_mut().insert(*hash, height);
		height
	}

	/// The tip of the weak-block DAG: the chain tip with the largest weak
	/// height, if any tip is not marked for removal.
	pub fn tip(&self) -> Option<WeakblockRef> {
		let mut max_height = -1;
		let mut longest = None;
		for wb in &self.chain_tips {
			let h = self.weak_height(&wb.hash());
			if h > max_height {
				max_height = h;
				longest = Some(wb.clone());
			}
		}
		longest
	}

	/// Expire old content. A thorough call wipes everything. Otherwise every
	/// block currently marked is deleted, then every survivor is marked, so
	/// two successive calls with no intervening store fully flush the store.
	pub fn expire_old(&mut self, thorough: bool) {
		if thorough {
			self.hash_to_weak.clear();
			self.cheap_hash_to_weak.clear();
			self.extends_map.clear();
			self.chain_tips.clear();
			self.to_remove.clear();
			self.pending_parent.clear();
			self.height_cache.borrow_mut().clear();
			return;
		}

		let marked: Vec<Hash> = self.to_remove.drain().collect();
		for hash in marked {
			let wb = match self.hash_to_weak.remove(&hash) {
				Some(wb) => wb,
				None => continue,
			};

			// cheap hashes might collide, only drop our own binding
			if let Some(existing) = self.cheap_hash_to_weak.get(&hash.cheap_hash()) {
				if existing.hash() == hash {
					self.cheap_hash_to_weak.remove(&hash.cheap_hash());
				}
			}

			self.extends_map.remove(&hash);
			self.extends_map.retain(|_, parent| *parent != hash);
			self.pending_parent.remove(&hash);
			let wb_hash = wb.hash();
			self.chain_tips.retain(|t| t.hash() != wb_hash);
		}

		for hash in self.hash_to_weak.keys() {
			self.to_remove.insert(*hash);
		}
		self.height_cache.borrow_mut().clear();
	}

	/// Look up a weak block by full hash.
	pub fn by_hash(&self, hash: &Hash) -> Option<WeakblockRef> {
		self.hash_to_weak.get(hash).cloned()
	}

	/// Look up a weak block by cheap hash. The latest binding wins on
	/// collision; the full hash remains authoritative.
	pub fn by_cheap_hash(&self, cheap: u64) -> Option<WeakblockRef> {
		self.cheap_hash_to_weak.get(&cheap).cloned()
	}

	/// The parent of a stored weak block, if it extends one.
	pub fn parent(&self, hash: &Hash) -> Option<WeakblockRef> {
		self.extends_map
			.get(hash)
			.and_then(|p| self.hash_to_weak.get(p))
			.cloned()
	}

	/// Number of weak blocks stored.
	pub fn size(&self) -> usize {
		self.hash_to_weak.len()
	}

	/// Whether the store holds nothing.
	pub fn is_empty(&self) -> bool {
		self.size() == 0
	}

	/// Current chain tips.
	pub fn chain_tips(&self) -> &[WeakblockRef] {
		&self.chain_tips
	}

	/// Internal invariants; panics on violation. Diagnostic use only.
	pub fn consistency_check(&self) {
		debug!("doing internal weak store consistency check");
		assert!(!self.hash_to_weak.contains_key(&ZERO_HASH));
		assert!(!self.extends_map.contains_key(&ZERO_HASH));
		assert!(self.extends_map.len() <= self.hash_to_weak.len());
		assert!(self.chain_tips.len() <= self.hash_to_weak.len());
		assert!(self.cheap_hash_to_weak.len() <= self.hash_to_weak.len());
		for (child, parent) in &self.extends_map {
			assert!(self.hash_to_weak.contains_key(child));
			assert!(self.hash_to_weak.contains_key(parent));
		}
		for wb in &self.chain_tips {
			assert!(self.hash_to_weak.contains_key(&wb.hash()));
		}
		// no cycles: every parent walk must terminate
		for child in self.extends_map.keys() {
			let mut cursor = *child;
			let mut steps = 0;
			while let Some(parent) = self.extends_map.get(&cursor) {
				cursor = *parent;
				steps += 1;
				assert!(steps <= self.hash_to_weak.len(), "cycle in extends map");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::block::BlockHeader;
	use crate::core::transaction::{OutPoint, Transaction, TxIn, TxOut};
	use crate::core::hash::sha256d;
	use rand::prelude::*;
	use rand::SeedableRng;

	fn random_tx(rng: &mut StdRng) -> Arc<Transaction> {
		Arc::new(Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint {
					hash: sha256d(&rng.gen::<u64>().to_le_bytes()),
					n: rng.gen_range(0, 4),
				},
				script_sig: vec![],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: rng.gen_range(1, 1000),
				script_pubkey: vec![],
			}],
			lock_time: 0,
		})
	}

	// coinbase carrying the weak commitment tag
	fn weakblock_cb(weakref: Hash) -> Arc<Transaction> {
		let mut script = vec![OP_RETURN, 0x22, b'W', b'B'];
		script.extend_from_slice(weakref.as_bytes());
		Arc::new(Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint::null(),
				script_sig: vec![0x03, 0xa0, 0x86, 0x01],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![
				TxOut {
					value: 100_000_000,
					script_pubkey: vec![],
				},
				TxOut {
					value: 0,
					script_pubkey: script,
				},
			],
			lock_time: 0,
		})
	}

	fn plain_block(rng: &mut StdRng, ntx: usize) -> Block {
		let mut header = BlockHeader::default();
		header.nonce = rng.gen();
		let mut block = Block::with_header(header);
		for _ in 0..ntx {
			block.txs.push(random_tx(rng));
		}
		block
	}

	// extend `underlying` to `ntx` transactions, committing to its hash
	fn weak_extend_block(rng: &mut StdRng, underlying: &Block, ntx: usize) -> Block {
		assert!(ntx >= underlying.txs.len());
		let mut header = BlockHeader::default();
		header.nonce = rng.gen();
		let mut block = Block::with_header(header);
		block.txs.push(weakblock_cb(underlying.hash()));
		for i in 1..underlying.txs.len() {
			block.txs.push(underlying.txs[i].clone());
		}
		while block.txs.len() < ntx {
			block.txs.push(random_tx(rng));
		}
		block
	}

	#[test]
	fn default_state() {
		let store = WeakStore::new();
		assert!(store.tip().is_none());
		assert_eq!(store.size(), 0);
		assert!(store.is_empty());
		store.consistency_check();
	}

	#[test]
	fn commitment_extraction() {
		let mut rng = StdRng::seed_from_u64(1);
		let b0 = plain_block(&mut rng, 3);
		assert!(extract_commitment(&b0).is_null());

		let b1 = weak_extend_block(&mut rng, &b0, 5);
		assert_eq!(extract_commitment(&b1), b0.hash());
	}

	#[test]
	fn tip_flips_to_longer_weak_chain() {
		let mut rng = StdRng::seed_from_u64(2);
		let mut store = WeakStore::new();

		let b0 = plain_block(&mut rng, 1);
		let b1 = weak_extend_block(&mut rng, &b0, 100);
		let b2 = weak_extend_block(&mut rng, &b1, 200);

		assert!(store.by_hash(&b0.hash()).is_none());
		assert!(store.by_cheap_hash(b0.hash().cheap_hash()).is_none());

		store.store(&b0).unwrap();
		assert_eq!(store.tip().unwrap().hash(), b0.hash());
		assert_eq!(store.size(), 1);

		store.store(&b1).unwrap();
		assert_eq!(store.tip().unwrap().hash(), b1.hash());

		store.store(&b2).unwrap();
		assert_eq!(store.tip().unwrap().hash(), b2.hash());
		assert_eq!(store.weak_height(&b2.hash()), 2);
		assert_eq!(store.chain_tips().len(), 1);

		// duplicate store is rejected
		assert!(store.store(&b2).is_none());

		// a second fork from b1 overtakes once it grows longer
		let b1_1 = weak_extend_block(&mut rng, &b1, 300);
		store.store(&b1_1).unwrap();
		assert_eq!(store.tip().unwrap().hash(), b2.hash());
		assert_eq!(store.chain_tips().len(), 2);

		let b1_2 = weak_extend_block(&mut rng, &b1_1, 300);
		store.store(&b1_2).unwrap();
		assert_eq!(store.tip().unwrap().hash(), b1_2.hash());
		assert_eq!(store.weak_height(&b1_2.hash()), 3);

		store.consistency_check();
	}

	#[test]
	fn two_pass_sweep_flushes() {
		let mut rng = StdRng::seed_from_u64(3);
		let mut store = WeakStore::new();

		let b0 = plain_block(&mut rng, 1);
		let b1 = weak_extend_block(&mut rng, &b0, 10);
		store.store(&b0).unwrap();
		store.store(&b1).unwrap();

		// first pass only marks
		store.expire_old(false);
		assert_eq!(store.size(), 2);
		for wb in store.chain_tips() {
			assert_eq!(store.weak_height(&wb.hash()), -1);
		}
		assert!(store.tip().is_none());

		// a store between the passes survives the second one
		let b2 = plain_block(&mut rng, 2);
		store.store(&b2).unwrap();
		store.expire_old(false);
		assert_eq!(store.size(), 1);
		assert_eq!(store.by_hash(&b2.hash()).unwrap().hash(), b2.hash());
		store.consistency_check();

		store.expire_old(false);
		assert!(store.is_empty());
		assert_eq!(store.chain_tips().len(), 0);
		store.consistency_check();
	}

	#[test]
	fn thorough_expiry_wipes() {
		let mut rng = StdRng::seed_from_u64(4);
		let mut store = WeakStore::new();
		let b0 = plain_block(&mut rng, 1);
		store.store(&b0).unwrap();
		store.expire_old(true);
		assert!(store.is_empty());
		store.consistency_check();
	}

	#[test]
	fn dag_rebuild_is_delivery_order_independent() {
		let mut rng = StdRng::seed_from_u64(5);

		for dag_size in 0..20usize {
			// build a random DAG of roots and extensions
			let mut blocks: Vec<Block> = vec![];
			for _ in 0..dag_size {
				if blocks.is_empty() || rng.gen::<bool>() {
					blocks.push(plain_block(&mut rng, 5));
				} else {
					let u = rng.gen_range(0, blocks.len());
					let ntx = blocks[u].txs.len() + rng.gen_range(0, 20);
					let block = weak_extend_block(&mut rng, &blocks[u].clone(), ntx);
					blocks.push(block);
				}
			}

			let mut store = WeakStore::new();
			blocks.shuffle(&mut rng);
			for b in &blocks {
				assert!(store.store(b).is_some());
			}
			store.consistency_check();

			let heights0: HashMap<Hash, i32> = blocks
				.iter()
				.map(|b| (b.hash(), store.weak_height(&b.hash())))
				.collect();
			let tips0: HashSet<Hash> =
				store.chain_tips().iter().map(|wb| wb.hash()).collect();

			for _ in 0..10 {
				let mut store = WeakStore::new();
				blocks.shuffle(&mut rng);
				for b in &blocks {
					assert!(store.store(b).is_some());
				}
				store.consistency_check();

				let heights: HashMap<Hash, i32> = blocks
					.iter()
					.map(|b| (b.hash(), store.weak_height(&b.hash())))
					.collect();
				let tips: HashSet<Hash> =
					store.chain_tips().iter().map(|wb| wb.hash()).collect();

				assert_eq!(heights, heights0);
				assert_eq!(tips, tips0);
			}
		}
	}
}
