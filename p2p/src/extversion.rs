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

//! The extended-version handshake: after VERSION/VERACK, peers that both
//! advertise the XVERSION service bit exchange one message holding a
//! serialized u64 -> u64 map. Unknown keys (including legacy ones) are
//! parsed and ignored. An XUPDATE may later mutate keys in the changeable
//! set; everything else is immutable after XVERSION.

use std::collections::BTreeMap;

use crate::core::ser::{self, Readable, Reader, Writeable, Writer};

/// Version of the extversion scheme itself: 10000*major + 100*minor + rev.
pub const XVERSION_VALUE: u64 = 100;

/// Keys recognised in the extended-version map.
pub mod keys {
	/// Version of the extversion scheme itself.
	pub const XVERSION_VERSION: u64 = 0x0000_0000_0000_0000;
	/// Listening port (low 16 bits meaningful).
	pub const LISTEN_PORT: u64 = 0x0000_0002_0000_0000;
	/// Highest graphene version supported.
	pub const GRAPHENE_MAX_VERSION: u64 = 0x0000_0002_0000_0001;
	/// Set when the peer may send zero-checksum frames.
	pub const MSG_IGNORE_CHECKSUM: u64 = 0x0000_0002_0000_0002;
	/// Xthin version.
	pub const XTHIN_VERSION: u64 = 0x0000_0002_0000_0003;
	/// Graphene fast-filter preference (0 either, 1 fast, 2 regular).
	pub const GRAPHENE_FAST_FILTER_PREF: u64 = 0x0000_0002_0000_0004;
	/// Lowest graphene version supported.
	pub const GRAPHENE_MIN_VERSION: u64 = 0x0000_0002_0000_0005;
	/// Mempool synchronization supported.
	pub const MEMPOOL_SYNC: u64 = 0x0000_0002_0000_0006;
	/// Lowest mempool-sync version supported.
	pub const MEMPOOL_SYNC_MIN_VERSION: u64 = 0x0000_0002_0000_0007;
	/// Highest mempool-sync version supported.
	pub const MEMPOOL_SYNC_MAX_VERSION: u64 = 0x0000_0002_0000_0008;
	/// Mempool ancestor count limit.
	pub const MEMPOOL_ANCESTOR_COUNT_LIMIT: u64 = 0x0000_0002_0000_0009;
	/// Mempool ancestor size limit, bytes.
	pub const MEMPOOL_ANCESTOR_SIZE_LIMIT: u64 = 0x0000_0002_0000_000a;
	/// Mempool descendant count limit.
	pub const MEMPOOL_DESCENDANT_COUNT_LIMIT: u64 = 0x0000_0002_0000_000b;
	/// Mempool descendant size limit, bytes.
	pub const MEMPOOL_DESCENDANT_SIZE_LIMIT: u64 = 0x0000_0002_0000_000c;
	/// Transaction concatenation supported.
	pub const TXN_CONCATENATION: u64 = 0x0000_0002_0000_000d;
	/// Electrum server TCP port.
	pub const ELECTRUM_SERVER_PORT_TCP: u64 = 0x0000_0002_0000_f00d;
	/// Electrum protocol version.
	pub const ELECTRUM_PROTOCOL_VERSION: u64 = 0x0000_0002_0000_f00e;
	/// Electrum websocket port.
	pub const ELECTRUM_WS_SERVER_PORT_TCP: u64 = 0x0000_0002_0000_f00f;
}

/// Keys an XUPDATE may change after the handshake. Currently none.
pub fn is_changeable_key(_key: u64) -> bool {
	false
}

/// The serialized extended-version map.
#[derive(Debug, Clone, Default)]
pub struct XVersionMap(pub BTreeMap<u64, u64>);

impl XVersionMap {
	/// Value for a key, zero when not provided.
	pub fn get(&self, key: u64) -> u64 {
		self.0.get(&key).cloned().unwrap_or(0)
	}

	/// Set a key.
	pub fn set(&mut self, key: u64, value: u64) {
		self.0.insert(key, value);
	}
}

impl Writeable for XVersionMap {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_var_int(self.0.len() as u64)?;
		for (k, v) in &self.0 {
			writer.write_u64(*k)?;
			writer.write_u64(*v)?;
		}
		Ok(())
	}
}

impl Readable for XVersionMap {
	fn read<R: Reader>(reader: &mut R) -> Result<XVersionMap, ser::Error> {
		let len = reader.read_var_int()?;
		if len > 1024 {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut map = BTreeMap::new();
		for _ in 0..len {
			let k = reader.read_u64()?;
			let v = reader.read_u64()?;
			// last write wins on duplicate keys; unknown keys are kept so
			// the negotiation layer can ignore them silently
			map.insert(k, v);
		}
		Ok(XVersionMap(map))
	}
}

/// Everything negotiated with one peer through the extended handshake.
#[derive(Debug, Clone)]
pub struct ExtState {
	/// Whether the peer completed an XVERSION exchange.
	pub negotiated: bool,
	/// The peer's announced listening port, if any.
	pub listen_port: u16,
	/// Graphene version window advertised by the peer.
	pub graphene_min: u64,
	/// See `graphene_min`.
	pub graphene_max: u64,
	/// Graphene version both sides agreed on, zero when disabled.
	pub graphene_version: u64,
	/// Graphene fast-filter preference.
	pub fast_filter_pref: u64,
	/// Xthin version the peer speaks, zero when unsupported.
	pub xthin_version: u64,
	/// Whether the peer accepts zero-checksum frames from us.
	pub peer_ignores_checksum: bool,
	/// Mempool-sync version agreed on, zero when disabled.
	pub mempool_sync_version: u64,
	/// Peer mempool policy limits (ancestors/descendants, count and bytes).
	pub ancestor_count_limit: u64,
	/// See `ancestor_count_limit`.
	pub ancestor_size_limit: u64,
	/// See `ancestor_count_limit`.
	pub descendant_count_limit: u64,
	/// See `ancestor_count_limit`.
	pub descendant_size_limit: u64,
	/// Whether the peer handles concatenated transactions in one message.
	pub txn_concat: bool,
}

impl Default for ExtState {
	fn default() -> ExtState {
		ExtState {
			negotiated: false,
			listen_port: 0,
			graphene_min: 0,
			graphene_max: 0,
			graphene_version: 0,
			fast_filter_pref: 0,
			xthin_version: 0,
			peer_ignores_checksum: false,
			mempool_sync_version: 0,
			ancestor_count_limit: 0,
			ancestor_size_limit: 0,
			descendant_count_limit: 0,
			descendant_size_limit: 0,
			txn_concat: false,
		}
	}
}

/// Our own advertised version windows.
#[derive(Debug, Clone, Copy)]
pub struct LocalXVersion {
	/// Our listening port.
	pub listen_port: u16,
	/// Graphene window we support.
	pub graphene_min: u64,
	/// See `graphene_min`.
	pub graphene_max: u64,
	/// Xthin version we speak.
	pub xthin_version: u64,
	/// Mempool-sync window we support.
	pub mempool_sync_min: u64,
	/// See `mempool_sync_min`.
	pub mempool_sync_max: u64,
	/// Whether we tolerate zero-checksum frames.
	pub ignore_checksum: bool,
	/// Whether we consume concatenated transactions.
	pub txn_concat: bool,
}

impl Default for LocalXVersion {
	fn default() -> LocalXVersion {
		LocalXVersion {
			listen_port: 0,
			graphene_min: 0,
			graphene_max: 4,
			xthin_version: 2,
			mempool_sync_min: 0,
			mempool_sync_max: 1,
			ignore_checksum: true,
			txn_concat: true,
		}
	}
}

impl LocalXVersion {
	/// The map we send in our own XVERSION message.
	pub fn to_map(&self) -> XVersionMap {
		let mut map = XVersionMap::default();
		map.set(keys::XVERSION_VERSION, XVERSION_VALUE);
		map.set(keys::LISTEN_PORT, self.listen_port as u64);
		map.set(keys::GRAPHENE_MIN_VERSION, self.graphene_min);
		map.set(keys::GRAPHENE_MAX_VERSION, self.graphene_max);
		map.set(keys::XTHIN_VERSION, self.xthin_version);
		map.set(keys::MEMPOOL_SYNC, 1);
		map.set(keys::MEMPOOL_SYNC_MIN_VERSION, self.mempool_sync_min);
		map.set(keys::MEMPOOL_SYNC_MAX_VERSION, self.mempool_sync_max);
		map.set(keys::MSG_IGNORE_CHECKSUM, self.ignore_checksum as u64);
		map.set(keys::TXN_CONCATENATION, self.txn_concat as u64);
		map
	}
}

/// Negotiate a version from overlapping [min, max] windows, or zero when
/// the windows do not intersect.
fn negotiate_window(self_min: u64, self_max: u64, peer_min: u64, peer_max: u64) -> u64 {
	let chosen = self_max.min(peer_max);
	if self_min.max(peer_min) <= chosen {
		chosen
	} else {
		0
	}
}

/// Fold a received XVERSION map into the per-peer extended state.
pub fn apply_xversion_map(map: &XVersionMap, local: &LocalXVersion) -> ExtState {
	let mut state = ExtState::default();
	state.negotiated = true;
	state.listen_port = map.get(keys::LISTEN_PORT) as u16;
	state.graphene_min = map.get(keys::GRAPHENE_MIN_VERSION);
	state.graphene_max = map.get(keys::GRAPHENE_MAX_VERSION);
	state.graphene_version = negotiate_window(
		local.graphene_min,
		local.graphene_max,
		state.graphene_min,
		state.graphene_max,
	);
	state.fast_filter_pref = map.get(keys::GRAPHENE_FAST_FILTER_PREF);
	state.xthin_version = map.get(keys::XTHIN_VERSION);
	state.peer_ignores_checksum = map.get(keys::MSG_IGNORE_CHECKSUM) != 0;
	state.mempool_sync_version = if map.get(keys::MEMPOOL_SYNC) != 0 {
		negotiate_window(
			local.mempool_sync_min,
			local.mempool_sync_max,
			map.get(keys::MEMPOOL_SYNC_MIN_VERSION),
			map.get(keys::MEMPOOL_SYNC_MAX_VERSION),
		)
	} else {
		0
	};
	state.ancestor_count_limit = map.get(keys::MEMPOOL_ANCESTOR_COUNT_LIMIT);
	state.ancestor_size_limit = map.get(keys::MEMPOOL_ANCESTOR_SIZE_LIMIT);
	state.descendant_count_limit = map.get(keys::MEMPOOL_DESCENDANT_COUNT_LIMIT);
	state.descendant_size_limit = map.get(keys::MEMPOOL_DESCENDANT_SIZE_LIMIT);
	state.txn_concat = map.get(keys::TXN_CONCATENATION) != 0;
	state
}

/// Apply an XUPDATE: only changeable keys may mutate, everything else is
/// logged and dropped. The changeable set is currently empty, so this
/// parses and discards while keeping the peers talking.
pub fn apply_xupdate(map: &XVersionMap, _state: &mut ExtState) {
	for (k, v) in &map.0 {
		if is_changeable_key(*k) {
			debug!("xupdate: key {:#x} updated to {}", k, v);
		} else {
			debug!("xupdate: ignoring immutable key {:#x}", k);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::ser::{deserialize, ser_vec};

	#[test]
	fn map_round_trip_with_unknown_keys() {
		let mut map = XVersionMap::default();
		map.set(keys::XVERSION_VERSION, XVERSION_VALUE);
		map.set(keys::GRAPHENE_MAX_VERSION, 4);
		map.set(0xdead_beef_dead_beef, 77); // unknown key, kept silently

		let bytes = ser_vec(&map).unwrap();
		let map2: XVersionMap = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(map2.get(keys::GRAPHENE_MAX_VERSION), 4);
		assert_eq!(map2.get(0xdead_beef_dead_beef), 77);
		assert_eq!(map2.get(keys::XTHIN_VERSION), 0);
	}

	#[test]
	fn graphene_window_negotiation() {
		let local = LocalXVersion::default(); // 0..=4

		let mut map = XVersionMap::default();
		map.set(keys::GRAPHENE_MIN_VERSION, 2);
		map.set(keys::GRAPHENE_MAX_VERSION, 6);
		let state = apply_xversion_map(&map, &local);
		assert_eq!(state.graphene_version, 4);

		// disjoint windows disable graphene
		let mut map = XVersionMap::default();
		map.set(keys::GRAPHENE_MIN_VERSION, 5);
		map.set(keys::GRAPHENE_MAX_VERSION, 9);
		let state = apply_xversion_map(&map, &local);
		assert_eq!(state.graphene_version, 0);
	}

	#[test]
	fn checksum_and_concat_flags() {
		let local = LocalXVersion::default();
		let mut map = XVersionMap::default();
		map.set(keys::MSG_IGNORE_CHECKSUM, 1);
		map.set(keys::TXN_CONCATENATION, 1);
		let state = apply_xversion_map(&map, &local);
		assert!(state.peer_ignores_checksum);
		assert!(state.txn_concat);
	}
}
