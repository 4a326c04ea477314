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

//! Xthin block relay. The requester sends a bloom filter of what it
//! already has; the sender answers with the header, every txid folded to
//! a salted 64-bit short id, and the transactions the filter missed
//! inlined. Gaps are fetched with get_xblocktx.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bloom::BloomFilter;
use crate::core::core::block::{Block, BlockHeader};
use crate::core::core::hash::Hash;
use crate::core::core::inventory::Inv;
use crate::core::core::shortid;
use crate::core::core::transaction::{Transaction, TxRef};
use crate::core::ser::{self, read_vec, write_vec, Readable, Reader, Writeable, Writer};

use super::common::ReconstructionSlot;

/// Most short ids a single xthin message may carry.
const MAX_XTHIN_IDS: u64 = 8_000_000;

/// Salted 64-bit short id of a txid.
pub fn xthin_short_id(salt: u64, txid: &Hash) -> u64 {
	shortid::short_id(salt, salt.rotate_left(32), txid)
}

/// Request for an xthin block: the inventory item plus a bloom filter of
/// the transactions the requester already has.
#[derive(Debug, Clone)]
pub struct GetXthin {
	/// What is being requested.
	pub inv: Inv,
	/// The requester's have-set.
	pub filter: BloomFilter,
}

impl Writeable for GetXthin {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.inv.write(writer)?;
		self.filter.write(writer)
	}
}

impl Readable for GetXthin {
	fn read<R: Reader>(reader: &mut R) -> Result<GetXthin, ser::Error> {
		Ok(GetXthin {
			inv: Inv::read(reader)?,
			filter: BloomFilter::read(reader)?,
		})
	}
}

/// An xthin block: header, salted short ids in block order, and the
/// transactions the requester's filter did not cover.
#[derive(Debug, Clone)]
pub struct XthinBlock {
	/// Block header.
	pub header: BlockHeader,
	/// Salt the short ids were keyed with.
	pub salt: u64,
	/// Short ids of every transaction, block order, coinbase included.
	pub tx_short_ids: Vec<u64>,
	/// Transactions the requester was missing, coinbase always included.
	pub missing: Vec<Transaction>,
}

impl Writeable for XthinBlock {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.header.write(writer)?;
		writer.write_u64(self.salt)?;
		writer.write_var_int(self.tx_short_ids.len() as u64)?;
		for id in &self.tx_short_ids {
			writer.write_u64(*id)?;
		}
		write_vec(writer, &self.missing)
	}
}

impl Readable for XthinBlock {
	fn read<R: Reader>(reader: &mut R) -> Result<XthinBlock, ser::Error> {
		let header = BlockHeader::read(reader)?;
		let salt = reader.read_u64()?;
		let len = reader.read_var_int()?;
		if len > MAX_XTHIN_IDS {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut tx_short_ids = Vec::with_capacity(len.min(100_000) as usize);
		for _ in 0..len {
			tx_short_ids.push(reader.read_u64()?);
		}
		let missing = read_vec(reader, MAX_XTHIN_IDS)?;
		Ok(XthinBlock {
			header,
			salt,
			tx_short_ids,
			missing,
		})
	}
}

/// Request for transactions an xthin block referenced but the requester
/// could not resolve.
#[derive(Debug, Clone)]
pub struct GetXBlockTx {
	/// The block being reconstructed.
	pub block_hash: Hash,
	/// Short ids still missing.
	pub short_ids: Vec<u64>,
}

impl Writeable for GetXBlockTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		writer.write_var_int(self.short_ids.len() as u64)?;
		for id in &self.short_ids {
			writer.write_u64(*id)?;
		}
		Ok(())
	}
}

impl Readable for GetXBlockTx {
	fn read<R: Reader>(reader: &mut R) -> Result<GetXBlockTx, ser::Error> {
		let block_hash = Hash::read(reader)?;
		let len = reader.read_var_int()?;
		if len > MAX_XTHIN_IDS {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut short_ids = Vec::with_capacity(len.min(100_000) as usize);
		for _ in 0..len {
			short_ids.push(reader.read_u64()?);
		}
		Ok(GetXBlockTx {
			block_hash,
			short_ids,
		})
	}
}

/// The transactions answering a get_xblocktx.
#[derive(Debug, Clone)]
pub struct XBlockTx {
	/// The block being reconstructed.
	pub block_hash: Hash,
	/// The requested transactions.
	pub txs: Vec<Transaction>,
}

impl Writeable for XBlockTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		write_vec(writer, &self.txs)
	}
}

impl Readable for XBlockTx {
	fn read<R: Reader>(reader: &mut R) -> Result<XBlockTx, ser::Error> {
		Ok(XBlockTx {
			block_hash: Hash::read(reader)?,
			txs: read_vec(reader, MAX_XTHIN_IDS)?,
		})
	}
}

/// Per-slot xthin reconstruction state.
#[derive(Debug, Clone)]
pub struct ThinBlockData {
	/// The salt the announcement used.
	pub salt: u64,
	/// Short ids in block order.
	pub tx_short_ids: Vec<u64>,
}

/// Build an xthin block for a requester whose have-set is `filter`.
pub fn build_xthin(block: &Block, filter: &BloomFilter, salt: u64) -> XthinBlock {
	let mut tx_short_ids = Vec::with_capacity(block.txs.len());
	let mut missing = vec![];
	for (i, tx) in block.txs.iter().enumerate() {
		let txid = tx.txid();
		tx_short_ids.push(xthin_short_id(salt, &txid));
		// the coinbase can never be in anyone's mempool
		if i == 0 || !filter.contains(txid.as_bytes()) {
			missing.push((**tx).clone());
		}
	}
	XthinBlock {
		header: block.header,
		salt,
		tx_short_ids,
		missing,
	}
}

/// Outcome of a reconstruction attempt.
pub enum ReconstructResult {
	/// The full block was rebuilt.
	Complete(Block),
	/// These short ids still need fetching.
	NeedTxs(Vec<u64>),
	/// The representation is unusable (short-id collision or corrupt
	/// data); fall back to another scheme or a full block.
	Failed,
}

/// Fold an xthin announcement into the slot and attempt reconstruction
/// against the mempool txids in `pool`.
pub fn reconstruct_xthin(
	slot: &mut ReconstructionSlot,
	xthin: &XthinBlock,
	pool: &[(Hash, TxRef)],
) -> ReconstructResult {
	slot.header = Some(xthin.header);
	slot.thin = Some(ThinBlockData {
		salt: xthin.salt,
		tx_short_ids: xthin.tx_short_ids.clone(),
	});
	for tx in &xthin.missing {
		let tx = Arc::new(tx.clone());
		slot.collected.insert(tx.txid(), tx);
	}

	// index everything we can resolve by short id; a collision within the
	// pool poisons the id, forcing a re-fetch by the sender's copy
	let mut by_short_id: HashMap<u64, Option<TxRef>> = HashMap::new();
	for (txid, tx) in pool {
		match by_short_id.entry(xthin_short_id(xthin.salt, txid)) {
			std::collections::hash_map::Entry::Occupied(mut e) => {
				*e.get_mut() = None;
			}
			std::collections::hash_map::Entry::Vacant(e) => {
				e.insert(Some(tx.clone()));
			}
		}
	}
	for (txid, tx) in &slot.collected {
		by_short_id.insert(xthin_short_id(xthin.salt, txid), Some(tx.clone()));
	}

	let mut txs = Vec::with_capacity(xthin.tx_short_ids.len());
	let mut need = vec![];
	for id in &xthin.tx_short_ids {
		match by_short_id.get(id) {
			Some(Some(tx)) => txs.push(tx.clone()),
			Some(None) => need.push(*id),
			None => need.push(*id),
		}
	}
	if !need.is_empty() {
		return ReconstructResult::NeedTxs(need);
	}
	ReconstructResult::Complete(Block {
		header: xthin.header,
		txs,
	})
}

/// Retry completion after more transactions arrived (via xblocktx or a
/// sibling scheme) using the short ids remembered in the slot.
pub fn complete_from_slot(slot: &ReconstructionSlot, pool: &[(Hash, TxRef)]) -> ReconstructResult {
	let (header, data) = match (slot.header, slot.thin.as_ref()) {
		(Some(h), Some(d)) => (h, d),
		_ => return ReconstructResult::Failed,
	};
	let mut by_short_id: HashMap<u64, TxRef> = HashMap::new();
	for (txid, tx) in pool {
		by_short_id.insert(xthin_short_id(data.salt, txid), tx.clone());
	}
	for (txid, tx) in &slot.collected {
		by_short_id.insert(xthin_short_id(data.salt, txid), tx.clone());
	}
	let mut txs = Vec::with_capacity(data.tx_short_ids.len());
	let mut need = vec![];
	for id in &data.tx_short_ids {
		match by_short_id.get(id) {
			Some(tx) => txs.push(tx.clone()),
			None => need.push(*id),
		}
	}
	if !need.is_empty() {
		return ReconstructResult::NeedTxs(need);
	}
	ReconstructResult::Complete(Block { header, txs })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::transaction::{OutPoint, TxIn, TxOut};
	use crate::core::core::hash::sha256d;
	use crate::core::ser::{deserialize, ser_vec};

	fn tx(seed: u64) -> TxRef {
		Arc::new(Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint {
					hash: sha256d(&seed.to_le_bytes()),
					n: 0,
				},
				script_sig: vec![],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: 1,
				script_pubkey: vec![],
			}],
			lock_time: 0,
		})
	}

	fn coinbase() -> TxRef {
		Arc::new(Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint::null(),
				script_sig: vec![1],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: 50,
				script_pubkey: vec![],
			}],
			lock_time: 0,
		})
	}

	#[test]
	fn xthin_round_trip_and_reconstruct() {
		let txs: Vec<TxRef> = vec![coinbase(), tx(1), tx(2), tx(3)];
		let block = Block {
			header: BlockHeader::default(),
			txs: txs.clone(),
		};

		// requester has tx1 and tx2 in its pool, misses tx3
		let mut filter = BloomFilter::new(10, 0.000001, 99, 0);
		filter.insert(txs[1].txid().as_bytes());
		filter.insert(txs[2].txid().as_bytes());

		let xthin = build_xthin(&block, &filter, 7);
		assert_eq!(xthin.tx_short_ids.len(), 4);
		// coinbase plus (at least) tx3 travel inline
		assert!(xthin.missing.len() >= 2);

		let bytes = ser_vec(&xthin).unwrap();
		let xthin2: XthinBlock = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(xthin2.tx_short_ids, xthin.tx_short_ids);

		let pool: Vec<(Hash, TxRef)> = txs[1..3]
			.iter()
			.map(|t| (t.txid(), t.clone()))
			.collect();
		let mut slot = super::super::common::ReconstructionSlot {
			header: None,
			collected: HashMap::new(),
			thin: None,
			graphene: None,
			compact: None,
			total_bytes: 0,
		};
		match reconstruct_xthin(&mut slot, &xthin2, &pool) {
			ReconstructResult::Complete(b) => {
				assert_eq!(b.txs.len(), 4);
				assert_eq!(b.hash(), block.hash());
				for (a, b) in b.txs.iter().zip(block.txs.iter()) {
					assert_eq!(a.txid(), b.txid());
				}
			}
			_ => panic!("expected complete reconstruction"),
		}
	}

	#[test]
	fn missing_txs_are_requested() {
		let txs: Vec<TxRef> = vec![coinbase(), tx(10), tx(11)];
		let block = Block {
			header: BlockHeader::default(),
			txs: txs.clone(),
		};
		// requester pretends to have everything, sender inlines only coinbase
		let mut filter = BloomFilter::new(10, 0.000001, 3, 0);
		for t in &txs[1..] {
			filter.insert(t.txid().as_bytes());
		}
		let xthin = build_xthin(&block, &filter, 21);

		// but its pool is actually empty
		let mut slot = super::super::common::ReconstructionSlot {
			header: None,
			collected: HashMap::new(),
			thin: None,
			graphene: None,
			compact: None,
			total_bytes: 0,
		};
		match reconstruct_xthin(&mut slot, &xthin, &[]) {
			ReconstructResult::NeedTxs(need) => assert_eq!(need.len(), 2),
			_ => panic!("expected missing transactions"),
		}
	}
}
