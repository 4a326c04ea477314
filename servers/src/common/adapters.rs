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

//! Glue between the networking layer and the node-level subsystems.

use std::sync::Arc;

use crate::core::core::block::Block;
use crate::core::core::hash::Hash;
use crate::core::weakblock::{WeakStore, WeakblockRef};
use crate::p2p::Peers;
use crate::util::Mutex;

/// Owns the weak-block DAG and its periodic housekeeping. Weak blocks
/// arrive through the expedited channel once the kernel classifies a
/// block as weak-only; real blocks commit to a weak parent through the
/// coinbase tag the store extracts.
pub struct WeakBlockRelay {
	store: Mutex<WeakStore>,
	enabled: bool,
	peers: Arc<Peers>,
}

impl WeakBlockRelay {
	/// New relay over an empty store.
	pub fn new(enabled: bool, peers: Arc<Peers>) -> WeakBlockRelay {
		WeakBlockRelay {
			store: Mutex::new(WeakStore::new()),
			enabled,
			peers,
		}
	}

	/// Whether the subsystem accepts weak blocks at all.
	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	/// Track a newly received weak block and announce it onward to
	/// weak-block-capable peers.
	pub fn weak_block_received(&self, block: &Block) -> Option<WeakblockRef> {
		if !self.enabled {
			return None;
		}
		let stored = self.store.lock().store(block)?;
		debug!(
			"tracking weak block {} ({} txns)",
			stored.hash(),
			stored.block.txs.len()
		);
		self.peers.broadcast_inv(
			crate::core::core::inventory::Inv::new(
				crate::core::core::inventory::InvType::Block,
				stored.hash(),
			),
			None,
		);
		Some(stored)
	}

	/// The current weak chain tip, if any.
	pub fn tip(&self) -> Option<WeakblockRef> {
		self.store.lock().tip()
	}

	/// Look up a weak block by hash.
	pub fn by_hash(&self, hash: &Hash) -> Option<WeakblockRef> {
		self.store.lock().by_hash(hash)
	}

	/// Look up a weak block by cheap hash.
	pub fn by_cheap_hash(&self, cheap: u64) -> Option<WeakblockRef> {
		self.store.lock().by_cheap_hash(cheap)
	}

	/// Number of weak blocks tracked.
	pub fn size(&self) -> usize {
		self.store.lock().size()
	}

	/// One mark-and-sweep pass; two passes with nothing stored in
	/// between flush the store completely.
	pub fn expire_pass(&self) {
		let mut store = self.store.lock();
		store.expire_old(false);
		debug!("weak block sweep pass, {} blocks remain", store.size());
	}

	/// Wipe everything, for shutdown or reorg recovery.
	pub fn flush(&self) {
		self.store.lock().expire_old(true);
	}
}
