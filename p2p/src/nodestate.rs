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

//! Per-peer chain availability: what the peer is assumed to have, used by
//! the request manager to route block downloads.

use crate::core::core::hash::Hash;
use crate::types::BlockIndexInfo;

/// Which blocks a peer is assumed to have.
#[derive(Debug, Clone, Default)]
pub struct BlockAvailability {
	/// The best block we know the peer knows.
	pub best_known_block: Option<BlockIndexInfo>,
	/// A hash the peer announced that we could not resolve yet.
	pub last_unknown_hash: Option<Hash>,
	/// The last block we share with the peer on its best chain.
	pub last_common_block: Option<BlockIndexInfo>,
}

impl BlockAvailability {
	/// Record that the peer announced `hash`. When the hash resolves to a
	/// known index entry with more work than the current best-known, it
	/// becomes the best-known; otherwise it is stashed for later
	/// promotion.
	pub fn update(&mut self, hash: Hash, lookup: impl Fn(&Hash) -> Option<BlockIndexInfo>) {
		self.process_pending(&lookup);
		match lookup(&hash) {
			Some(info) => {
				if self
					.best_known_block
					.map(|best| info.work >= best.work)
					.unwrap_or(true)
				{
					self.best_known_block = Some(info);
				}
			}
			None => self.last_unknown_hash = Some(hash),
		}
	}

	/// Promote the stashed unknown hash if it has since become known.
	pub fn process_pending(&mut self, lookup: impl Fn(&Hash) -> Option<BlockIndexInfo>) {
		if let Some(hash) = self.last_unknown_hash {
			if let Some(info) = lookup(&hash) {
				if self
					.best_known_block
					.map(|best| info.work >= best.work)
					.unwrap_or(true)
				{
					self.best_known_block = Some(info);
				}
				self.last_unknown_hash = None;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::hash::sha256d;

	fn info(hash: Hash, work: u128) -> BlockIndexInfo {
		BlockIndexInfo {
			hash,
			prev_hash: Hash::default(),
			height: 0,
			work,
			time: 0,
		}
	}

	#[test]
	fn unknown_hash_promotes_once_resolvable() {
		let h1 = sha256d(b"b1");
		let h2 = sha256d(b"b2");
		let mut avail = BlockAvailability::default();

		// unknown at first: stashed
		avail.update(h1, |_| None);
		assert!(avail.best_known_block.is_none());
		assert_eq!(avail.last_unknown_hash, Some(h1));

		// once resolvable it becomes the best known
		avail.process_pending(|h| if *h == h1 { Some(info(h1, 10)) } else { None });
		assert_eq!(avail.best_known_block.unwrap().hash, h1);
		assert!(avail.last_unknown_hash.is_none());

		// lower-work announcements do not displace the best known
		avail.update(h2, |h| {
			if *h == h2 {
				Some(info(h2, 5))
			} else {
				Some(info(h1, 10))
			}
		});
		assert_eq!(avail.best_known_block.unwrap().hash, h1);
	}
}
