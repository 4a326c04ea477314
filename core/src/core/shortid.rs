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

//! 64-bit short transaction ids. The thin-type block families refer to
//! transactions by a SipHash-2-4 keyed digest of the txid so announcements
//! stay small; collisions are tolerated and resolved by re-requesting.

use siphasher::sip::SipHasher24;
use std::hash::Hasher;

use crate::core::hash::{sha256, Hash};

/// SipHash-2-4 of the txid under the provided key pair.
pub fn short_id(k0: u64, k1: u64, txid: &Hash) -> u64 {
	let mut hasher = SipHasher24::new_with_keys(k0, k1);
	hasher.write(txid.as_bytes());
	hasher.finish()
}

/// SipHash-2-4 of an arbitrary 64-bit value, used by the IBLT cell
/// placement and checksum math.
pub fn short_id_u64(k0: u64, k1: u64, value: u64) -> u64 {
	let mut hasher = SipHasher24::new_with_keys(k0, k1);
	hasher.write(&value.to_le_bytes());
	hasher.finish()
}

/// Derive the short-id key pair from a block header hash and a per-message
/// nonce: the first 16 bytes of SHA-256(header_hash || nonce), little-endian.
pub fn short_id_keys(header_hash: &Hash, nonce: u64) -> (u64, u64) {
	let mut data = Vec::with_capacity(40);
	data.extend_from_slice(header_hash.as_bytes());
	data.extend_from_slice(&nonce.to_le_bytes());
	let digest = sha256(&data);

	let mut k0_bytes = [0u8; 8];
	let mut k1_bytes = [0u8; 8];
	k0_bytes.copy_from_slice(&digest[0..8]);
	k1_bytes.copy_from_slice(&digest[8..16]);
	(u64::from_le_bytes(k0_bytes), u64::from_le_bytes(k1_bytes))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::hash::sha256d;

	#[test]
	fn short_id_is_key_dependent() {
		let txid = sha256d(b"some txn");
		let a = short_id(1, 2, &txid);
		let b = short_id(1, 3, &txid);
		let c = short_id(1, 2, &txid);
		assert_ne!(a, b);
		assert_eq!(a, c);
	}

	#[test]
	fn key_derivation_is_nonce_dependent() {
		let h = sha256d(b"header");
		assert_ne!(short_id_keys(&h, 1), short_id_keys(&h, 2));
		assert_eq!(short_id_keys(&h, 7), short_id_keys(&h, 7));
	}
}
