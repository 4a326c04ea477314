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

//! Compact block relay: the sender prefills the coinbase (and any hinted
//! differences) and refers to everything else by a keyed short id; the
//! receiver resolves ids against its mempool and fetches gaps by index
//! via getblocktxn.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::core::block::{Block, BlockHeader};
use crate::core::core::hash::{Hash, Hashed};
use crate::core::core::shortid;
use crate::core::core::transaction::{Transaction, TxRef};
use crate::core::ser::{self, read_vec, write_vec, Readable, Reader, Writeable, Writer};

use super::common::ReconstructionSlot;

/// Largest tx count fields accepted off the wire.
const MAX_COMPACT_TXS: u64 = 8_000_000;

/// Compact short ids keep only the low 48 bits on the wire.
const SHORT_ID_MASK: u64 = 0xffff_ffff_ffff;

/// Compact short id of a txid under a header/nonce key pair.
pub fn compact_short_id(header_hash: &Hash, nonce: u64, txid: &Hash) -> u64 {
	let (k0, k1) = shortid::short_id_keys(header_hash, nonce);
	shortid::short_id(k0, k1, txid) & SHORT_ID_MASK
}

/// A transaction shipped inline with its absolute index in the block.
#[derive(Debug, Clone)]
pub struct PrefilledTx {
	/// Index in the block.
	pub index: u64,
	/// The transaction.
	pub tx: Transaction,
}

impl Writeable for PrefilledTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_var_int(self.index)?;
		self.tx.write(writer)
	}
}

impl Readable for PrefilledTx {
	fn read<R: Reader>(reader: &mut R) -> Result<PrefilledTx, ser::Error> {
		Ok(PrefilledTx {
			index: reader.read_var_int()?,
			tx: Transaction::read(reader)?,
		})
	}
}

/// A compact block announcement.
#[derive(Debug, Clone)]
pub struct CompactBlock {
	/// Block header.
	pub header: BlockHeader,
	/// Nonce keying the short ids.
	pub nonce: u64,
	/// 48-bit short ids for every non-prefilled transaction, block order.
	pub short_ids: Vec<u64>,
	/// Inlined transactions with their block indexes.
	pub prefilled: Vec<PrefilledTx>,
}

impl Writeable for CompactBlock {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.header.write(writer)?;
		writer.write_u64(self.nonce)?;
		writer.write_var_int(self.short_ids.len() as u64)?;
		for id in &self.short_ids {
			// 48-bit little-endian
			let bytes = id.to_le_bytes();
			writer.write_fixed_bytes(&bytes[0..6])?;
		}
		write_vec(writer, &self.prefilled)
	}
}

impl Readable for CompactBlock {
	fn read<R: Reader>(reader: &mut R) -> Result<CompactBlock, ser::Error> {
		let header = BlockHeader::read(reader)?;
		let nonce = reader.read_u64()?;
		let len = reader.read_var_int()?;
		if len > MAX_COMPACT_TXS {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut short_ids = Vec::with_capacity(len.min(100_000) as usize);
		for _ in 0..len {
			let bytes = reader.read_fixed_bytes(6)?;
			let mut raw = [0u8; 8];
			raw[0..6].copy_from_slice(&bytes);
			short_ids.push(u64::from_le_bytes(raw));
		}
		let prefilled = read_vec(reader, MAX_COMPACT_TXS)?;
		Ok(CompactBlock {
			header,
			nonce,
			short_ids,
			prefilled,
		})
	}
}

/// Request for block transactions by absolute index.
#[derive(Debug, Clone)]
pub struct GetBlockTxn {
	/// The block being reconstructed.
	pub block_hash: Hash,
	/// Absolute indexes of the wanted transactions.
	pub indexes: Vec<u64>,
}

impl Writeable for GetBlockTxn {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		writer.write_var_int(self.indexes.len() as u64)?;
		// differentially encoded
		let mut last = 0u64;
		for (i, idx) in self.indexes.iter().enumerate() {
			let diff = if i == 0 { *idx } else { idx - last - 1 };
			writer.write_var_int(diff)?;
			last = *idx;
		}
		Ok(())
	}
}

impl Readable for GetBlockTxn {
	fn read<R: Reader>(reader: &mut R) -> Result<GetBlockTxn, ser::Error> {
		let block_hash = Hash::read(reader)?;
		let len = reader.read_var_int()?;
		if len > MAX_COMPACT_TXS {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut indexes = Vec::with_capacity(len.min(100_000) as usize);
		let mut last = 0u64;
		for i in 0..len {
			let diff = reader.read_var_int()?;
			let idx = if i == 0 { diff } else { last + 1 + diff };
			indexes.push(idx);
			last = idx;
		}
		Ok(GetBlockTxn { block_hash, indexes })
	}
}

/// Transactions answering a getblocktxn, in request order.
#[derive(Debug, Clone)]
pub struct BlockTxn {
	/// The block being reconstructed.
	pub block_hash: Hash,
	/// The requested transactions.
	pub txs: Vec<Transaction>,
}

impl Writeable for BlockTxn {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		write_vec(writer, &self.txs)
	}
}

impl Readable for BlockTxn {
	fn read<R: Reader>(reader: &mut R) -> Result<BlockTxn, ser::Error> {
		Ok(BlockTxn {
			block_hash: Hash::read(reader)?,
			txs: read_vec(reader, MAX_COMPACT_TXS)?,
		})
	}
}

/// Per-slot compact reconstruction state: the block layout with holes.
#[derive(Debug, Clone)]
pub struct CompactData {
	/// Nonce keying the short ids.
	pub nonce: u64,
	/// One entry per block position, None where unresolved.
	pub layout: Vec<Option<TxRef>>,
}

/// Build a compact block, prefilling the coinbase.
pub fn build_compact(block: &Block, nonce: u64) -> CompactBlock {
	let header_hash = block.header.hash();
	let mut short_ids = Vec::with_capacity(block.txs.len().saturating_sub(1));
	for tx in block.txs.iter().skip(1) {
		short_ids.push(compact_short_id(&header_hash, nonce, &tx.txid()));
	}
	CompactBlock {
		header: block.header,
		nonce,
		short_ids,
		prefilled: vec![PrefilledTx {
			index: 0,
			tx: (*block.txs[0]).clone(),
		}],
	}
}

/// Outcome of a compact decode attempt.
pub enum CompactResult {
	/// Fully reconstructed.
	Complete(Block),
	/// Fetch these absolute indexes via getblocktxn.
	NeedTxs(Vec<u64>),
	/// Short-id collision made the mapping ambiguous; refetch as full.
	Failed,
}

/// Fold a compact announcement into the slot and resolve short ids
/// against the pool.
pub fn reconstruct_compact(
	slot: &mut ReconstructionSlot,
	compact: &CompactBlock,
	pool: &[(Hash, TxRef)],
) -> CompactResult {
	let header_hash = compact.header.hash();
	slot.header = Some(compact.header);

	let total = compact.short_ids.len() + compact.prefilled.len();
	let mut layout: Vec<Option<TxRef>> = vec![None; total];
	for pf in &compact.prefilled {
		if pf.index as usize >= total {
			return CompactResult::Failed;
		}
		let tx = Arc::new(pf.tx.clone());
		slot.collected.insert(tx.txid(), tx.clone());
		layout[pf.index as usize] = Some(tx);
	}

	let mut by_short_id: HashMap<u64, Option<TxRef>> = HashMap::new();
	for (txid, tx) in pool {
		match by_short_id.entry(compact_short_id(&header_hash, compact.nonce, txid)) {
			std::collections::hash_map::Entry::Occupied(mut e) => {
				// collision: the id becomes untrustworthy
				*e.get_mut() = None;
			}
			std::collections::hash_map::Entry::Vacant(e) => {
				e.insert(Some(tx.clone()));
			}
		}
	}
	for (txid, tx) in &slot.collected {
		by_short_id.insert(
			compact_short_id(&header_hash, compact.nonce, txid),
			Some(tx.clone()),
		);
	}

	let mut short_iter = compact.short_ids.iter();
	let mut need = vec![];
	for (idx, item) in layout.iter_mut().enumerate() {
		if item.is_some() {
			continue;
		}
		let id = match short_iter.next() {
			Some(id) => id,
			None => return CompactResult::Failed,
		};
		match by_short_id.get(id) {
			Some(Some(tx)) => *item = Some(tx.clone()),
			_ => need.push(idx as u64),
		}
	}

	slot.compact = Some(CompactData {
		nonce: compact.nonce,
		layout: layout.clone(),
	});

	if !need.is_empty() {
		return CompactResult::NeedTxs(need);
	}
	let txs: Vec<TxRef> = layout.into_iter().map(|t| t.unwrap()).collect();
	CompactResult::Complete(Block {
		header: compact.header,
		txs,
	})
}

/// Fill layout holes with the transactions a blocktxn returned, in
/// index order. Completes the block when every hole is plugged.
pub fn fill_compact_gaps(slot: &mut ReconstructionSlot, txs: &[Transaction]) -> CompactResult {
	let header = match slot.header {
		Some(h) => h,
		None => return CompactResult::Failed,
	};
	let data = match slot.compact.as_mut() {
		Some(d) => d,
		None => return CompactResult::Failed,
	};
	let mut supplied = txs.iter();
	for item in data.layout.iter_mut() {
		if item.is_none() {
			match supplied.next() {
				Some(tx) => {
					let tx = Arc::new(tx.clone());
					slot.collected.insert(tx.txid(), tx.clone());
					*item = Some(tx);
				}
				None => return CompactResult::Failed,
			}
		}
	}
	let txs: Vec<TxRef> = data.layout.iter().cloned().map(|t| t.unwrap()).collect();
	CompactResult::Complete(Block { header, txs })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::transaction::{OutPoint, TxIn, TxOut};
	use crate::core::core::hash::sha256d;
	use crate::core::ser::{deserialize, ser_vec};
	use std::collections::HashMap as StdHashMap;

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
				script_sig: vec![3],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: 50,
				script_pubkey: vec![],
			}],
			lock_time: 0,
		})
	}

	fn empty_slot() -> ReconstructionSlot {
		ReconstructionSlot {
			header: None,
			collected: StdHashMap::new(),
			thin: None,
			graphene: None,
			compact: None,
			total_bytes: 0,
		}
	}

	#[test]
	fn getblocktxn_differential_round_trip() {
		let msg = GetBlockTxn {
			block_hash: sha256d(b"blk"),
			indexes: vec![1, 4, 5, 9],
		};
		let bytes = ser_vec(&msg).unwrap();
		let msg2: GetBlockTxn = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(msg2.indexes, msg.indexes);
	}

	#[test]
	fn compact_reconstructs_from_pool() {
		let txs: Vec<TxRef> = vec![coinbase(), tx(1), tx(2)];
		let block = Block {
			header: BlockHeader::default(),
			txs: txs.clone(),
		};
		let compact = build_compact(&block, 11);
		let bytes = ser_vec(&compact).unwrap();
		let compact: CompactBlock = deserialize(&mut &bytes[..]).unwrap();

		let pool: Vec<(Hash, TxRef)> = txs[1..].iter().map(|t| (t.txid(), t.clone())).collect();
		let mut slot = empty_slot();
		match reconstruct_compact(&mut slot, &compact, &pool) {
			CompactResult::Complete(b) => {
				assert_eq!(b.hash(), block.hash());
				let ids: Vec<Hash> = b.txs.iter().map(|t| t.txid()).collect();
				let want: Vec<Hash> = block.txs.iter().map(|t| t.txid()).collect();
				assert_eq!(ids, want);
			}
			_ => panic!("expected complete reconstruction"),
		}
	}

	#[test]
	fn compact_gap_fill_via_blocktxn() {
		let missing = tx(7);
		let txs: Vec<TxRef> = vec![coinbase(), tx(1), missing.clone(), tx(2)];
		let block = Block {
			header: BlockHeader::default(),
			txs: txs.clone(),
		};
		let compact = build_compact(&block, 5);

		// pool misses index 2
		let pool: Vec<(Hash, TxRef)> = vec![
			(txs[1].txid(), txs[1].clone()),
			(txs[3].txid(), txs[3].clone()),
		];
		let mut slot = empty_slot();
		let need = match reconstruct_compact(&mut slot, &compact, &pool) {
			CompactResult::NeedTxs(need) => need,
			_ => panic!("expected a gap"),
		};
		assert_eq!(need, vec![2]);

		match fill_compact_gaps(&mut slot, &[(*missing).clone()]) {
			CompactResult::Complete(b) => assert_eq!(b.hash(), block.hash()),
			_ => panic!("expected completion"),
		}
	}
}
