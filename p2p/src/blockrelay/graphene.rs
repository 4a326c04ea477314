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

//! Graphene block relay. The sender describes its block as an IBLT plus a
//! bloom filter over salted short ids; a receiver whose mempool holds most
//! of the block subtracts its own id set from the IBLT and peels out the
//! symmetric difference. A failed peel falls back to the recovery
//! round-trip, a successful one fetches any still-missing ids directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bloom::BloomFilter;
use crate::core::blockorder;
use crate::core::core::block::{Block, BlockHeader};
use crate::core::core::hash::{Hash, Hashed};
use crate::core::core::shortid;
use crate::core::core::transaction::{Transaction, TxRef};
use crate::core::ser::{self, read_vec, write_vec, Readable, Reader, Writeable, Writer};

use super::common::ReconstructionSlot;

/// Hash functions per IBLT key.
const IBLT_N_HASH: u32 = 3;
/// Checksum key salt inside each cell.
const IBLT_CHECK_KEY: u64 = 0x6272_6c74_6368_6b73;
/// Cells allocated per expected symmetric-difference entry.
const IBLT_OVERHEAD: f64 = 1.5;
/// Largest IBLT accepted off the wire, in cells.
const MAX_IBLT_CELLS: u64 = 4_000_000;
/// Largest transaction count fields we accept.
const MAX_GRAPHENE_TXS: u64 = 8_000_000;

/// Derive the graphene short id of a txid under a message nonce.
pub fn graphene_short_id(nonce: u64, txid: &Hash) -> u64 {
	shortid::short_id(nonce, nonce ^ 0x5851_f42d_4c95_7f2d, txid)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct IbltCell {
	count: i32,
	key_sum: u64,
	check_sum: u64,
}

impl Writeable for IbltCell {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_i32(self.count)?;
		writer.write_u64(self.key_sum)?;
		writer.write_u64(self.check_sum)
	}
}

impl Readable for IbltCell {
	fn read<R: Reader>(reader: &mut R) -> Result<IbltCell, ser::Error> {
		Ok(IbltCell {
			count: reader.read_i32()?,
			key_sum: reader.read_u64()?,
			check_sum: reader.read_u64()?,
		})
	}
}

/// An invertible bloom lookup table over 64-bit keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iblt {
	cells: Vec<IbltCell>,
	salt: u64,
}

impl Iblt {
	/// An IBLT sized to decode about `expected_diff` differences.
	pub fn new(expected_diff: usize, salt: u64) -> Iblt {
		let cells = ((expected_diff.max(1) as f64 * IBLT_OVERHEAD).ceil() as usize)
			.max(IBLT_N_HASH as usize * 2);
		Iblt {
			cells: vec![IbltCell::default(); cells],
			salt,
		}
	}

	/// Number of cells.
	pub fn len(&self) -> usize {
		self.cells.len()
	}

	fn positions(&self, key: u64) -> Vec<usize> {
		(0..IBLT_N_HASH as u64)
			.map(|i| (shortid::short_id_u64(self.salt, i, key) as usize) % self.cells.len())
			.collect()
	}

	fn check(&self, key: u64) -> u64 {
		shortid::short_id_u64(self.salt, IBLT_CHECK_KEY, key)
	}

	/// Add a key.
	pub fn insert(&mut self, key: u64) {
		let check = self.check(key);
		for pos in self.positions(key) {
			let cell = &mut self.cells[pos];
			cell.count += 1;
			cell.key_sum ^= key;
			cell.check_sum ^= check;
		}
	}

	/// Remove a key (possibly driving cells negative).
	pub fn erase(&mut self, key: u64) {
		let check = self.check(key);
		for pos in self.positions(key) {
			let cell = &mut self.cells[pos];
			cell.count -= 1;
			cell.key_sum ^= key;
			cell.check_sum ^= check;
		}
	}

	/// Cell-wise subtraction; both tables must share size and salt.
	pub fn subtract(&self, other: &Iblt) -> Option<Iblt> {
		if self.cells.len() != other.cells.len() || self.salt != other.salt {
			return None;
		}
		let mut out = self.clone();
		for (cell, o) in out.cells.iter_mut().zip(other.cells.iter()) {
			cell.count -= o.count;
			cell.key_sum ^= o.key_sum;
			cell.check_sum ^= o.check_sum;
		}
		Some(out)
	}

	/// Peel the table, returning the keys present only on the positive
	/// side and only on the negative side. Fails when the table does not
	/// fully empty.
	pub fn decode(&self) -> Result<(HashSet<u64>, HashSet<u64>), ()> {
		let mut work = self.clone();
		let mut positive = HashSet::new();
		let mut negative = HashSet::new();

		loop {
			let pure = work.cells.iter().position(|c| {
				(c.count == 1 || c.count == -1) && work.check(c.key_sum) == c.check_sum
			});
			match pure {
				Some(idx) => {
					let cell = work.cells[idx];
					let key = cell.key_sum;
					if cell.count == 1 {
						positive.insert(key);
						work.erase(key);
					} else {
						negative.insert(key);
						// inserting cancels a negative entry
						work.insert(key);
					}
				}
				None => break,
			}
		}

		if work.cells.iter().all(|c| *c == IbltCell::default()) {
			Ok((positive, negative))
		} else {
			Err(())
		}
	}
}

impl Writeable for Iblt {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u64(self.salt)?;
		write_vec(writer, &self.cells)
	}
}

impl Readable for Iblt {
	fn read<R: Reader>(reader: &mut R) -> Result<Iblt, ser::Error> {
		let salt = reader.read_u64()?;
		let cells: Vec<IbltCell> = read_vec(reader, MAX_IBLT_CELLS)?;
		if cells.is_empty() {
			return Err(ser::Error::CorruptedData);
		}
		Ok(Iblt { cells, salt })
	}
}

/// The mempool summary a requester sends along with get_grblk so the
/// sender can size its structures.
#[derive(Debug, Clone, Copy)]
pub struct MempoolInfo {
	/// Transactions in the requester's pool.
	pub tx_count: u64,
	/// Requester's bloom/fast-filter preference for this request.
	pub filter_pref: u64,
}

impl Writeable for MempoolInfo {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u64(self.tx_count)?;
		writer.write_u64(self.filter_pref)
	}
}

impl Readable for MempoolInfo {
	fn read<R: Reader>(reader: &mut R) -> Result<MempoolInfo, ser::Error> {
		Ok(MempoolInfo {
			tx_count: reader.read_u64()?,
			filter_pref: reader.read_u64()?,
		})
	}
}

/// Request for a graphene block.
#[derive(Debug, Clone)]
pub struct GetGraphene {
	/// The block wanted.
	pub inv: crate::core::core::inventory::Inv,
	/// Requester mempool summary.
	pub mempool_info: MempoolInfo,
}

impl Writeable for GetGraphene {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.inv.write(writer)?;
		self.mempool_info.write(writer)
	}
}

impl Readable for GetGraphene {
	fn read<R: Reader>(reader: &mut R) -> Result<GetGraphene, ser::Error> {
		Ok(GetGraphene {
			inv: crate::core::core::inventory::Inv::read(reader)?,
			mempool_info: MempoolInfo::read(reader)?,
		})
	}
}

/// A graphene block announcement.
#[derive(Debug, Clone)]
pub struct GrapheneBlock {
	/// Block header.
	pub header: BlockHeader,
	/// Negotiated graphene version this message speaks.
	pub version: u64,
	/// Nonce keying the short ids.
	pub nonce: u64,
	/// Number of transactions in the block.
	pub n_block_txs: u64,
	/// IBLT over the block's short ids.
	pub iblt: Iblt,
	/// Bloom filter over the block's short ids.
	pub filter: BloomFilter,
	/// Transactions the receiver can never have (coinbase at least).
	pub additional: Vec<Transaction>,
}

impl Writeable for GrapheneBlock {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.header.write(writer)?;
		writer.write_u64(self.version)?;
		writer.write_u64(self.nonce)?;
		writer.write_u64(self.n_block_txs)?;
		self.iblt.write(writer)?;
		self.filter.write(writer)?;
		write_vec(writer, &self.additional)
	}
}

impl Readable for GrapheneBlock {
	fn read<R: Reader>(reader: &mut R) -> Result<GrapheneBlock, ser::Error> {
		Ok(GrapheneBlock {
			header: BlockHeader::read(reader)?,
			version: reader.read_u64()?,
			nonce: reader.read_u64()?,
			n_block_txs: reader.read_u64()?,
			iblt: Iblt::read(reader)?,
			filter: BloomFilter::read(reader)?,
			additional: read_vec(reader, MAX_GRAPHENE_TXS)?,
		})
	}
}

/// Request for transactions whose short ids could not be resolved.
#[derive(Debug, Clone)]
pub struct GetGrapheneTx {
	/// The block being reconstructed.
	pub block_hash: Hash,
	/// Missing short ids.
	pub short_ids: Vec<u64>,
}

impl Writeable for GetGrapheneTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		writer.write_var_int(self.short_ids.len() as u64)?;
		for id in &self.short_ids {
			writer.write_u64(*id)?;
		}
		Ok(())
	}
}

impl Readable for GetGrapheneTx {
	fn read<R: Reader>(reader: &mut R) -> Result<GetGrapheneTx, ser::Error> {
		let block_hash = Hash::read(reader)?;
		let len = reader.read_var_int()?;
		if len > MAX_GRAPHENE_TXS {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut short_ids = Vec::with_capacity(len.min(100_000) as usize);
		for _ in 0..len {
			short_ids.push(reader.read_u64()?);
		}
		Ok(GetGrapheneTx {
			block_hash,
			short_ids,
		})
	}
}

/// Transactions answering a get_grblktx.
#[derive(Debug, Clone)]
pub struct GrapheneTx {
	/// The block being reconstructed.
	pub block_hash: Hash,
	/// The requested transactions.
	pub txs: Vec<Transaction>,
}

impl Writeable for GrapheneTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		write_vec(writer, &self.txs)
	}
}

impl Readable for GrapheneTx {
	fn read<R: Reader>(reader: &mut R) -> Result<GrapheneTx, ser::Error> {
		Ok(GrapheneTx {
			block_hash: Hash::read(reader)?,
			txs: read_vec(reader, MAX_GRAPHENE_TXS)?,
		})
	}
}

/// Recovery request after a failed peel: asks for the full txid list.
#[derive(Debug, Clone)]
pub struct GetGrapheneRecovery {
	/// The block that failed to decode.
	pub block_hash: Hash,
}

impl Writeable for GetGrapheneRecovery {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)
	}
}

impl Readable for GetGrapheneRecovery {
	fn read<R: Reader>(reader: &mut R) -> Result<GetGrapheneRecovery, ser::Error> {
		Ok(GetGrapheneRecovery {
			block_hash: Hash::read(reader)?,
		})
	}
}

/// Recovery answer: the block's full txid list.
#[derive(Debug, Clone)]
pub struct GrapheneRecovery {
	/// The block being recovered.
	pub block_hash: Hash,
	/// Every txid in the block, block order.
	pub tx_hashes: Vec<Hash>,
}

impl Writeable for GrapheneRecovery {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.block_hash.write(writer)?;
		write_vec(writer, &self.tx_hashes)
	}
}

impl Readable for GrapheneRecovery {
	fn read<R: Reader>(reader: &mut R) -> Result<GrapheneRecovery, ser::Error> {
		Ok(GrapheneRecovery {
			block_hash: Hash::read(reader)?,
			tx_hashes: read_vec(reader, MAX_GRAPHENE_TXS)?,
		})
	}
}

/// Per-slot graphene reconstruction state.
#[derive(Debug, Clone)]
pub struct GrapheneData {
	/// Nonce keying the short ids.
	pub nonce: u64,
	/// Expected transaction count.
	pub n_block_txs: u64,
	/// Short ids resolved to txids so far.
	pub resolved: HashMap<u64, Hash>,
	/// Short ids known missing.
	pub missing: HashSet<u64>,
}

/// Build a graphene block for a receiver advertising `mempool_info`.
pub fn build_graphene(
	block: &Block,
	mempool_info: &MempoolInfo,
	version: u64,
	nonce: u64,
) -> GrapheneBlock {
	let n = block.txs.len();
	// expected symmetric difference grows with the receiver pool surplus
	let expected_diff = ((mempool_info.tx_count as i64 - n as i64).abs() as usize).max(4);
	let mut iblt = Iblt::new(expected_diff, nonce);
	let mut filter = BloomFilter::new(n.max(1), 1.0 / (mempool_info.tx_count.max(10) as f64), nonce as u32, 0);
	for tx in &block.txs {
		let id = graphene_short_id(nonce, &tx.txid());
		iblt.insert(id);
		filter.insert(&id.to_le_bytes());
	}
	GrapheneBlock {
		header: block.header,
		version,
		nonce,
		n_block_txs: n as u64,
		iblt,
		filter,
		additional: vec![(*block.txs[0]).clone()],
	}
}

/// Outcome of a graphene decode attempt.
pub enum GrapheneResult {
	/// Fully reconstructed.
	Complete(Block),
	/// Fetch these short ids via get_grblktx.
	NeedTxs(Vec<u64>),
	/// The IBLT did not peel; fall back to the recovery round-trip.
	NeedRecovery,
}

/// Fold a graphene announcement into the slot and attempt the IBLT
/// subtraction against the receiver's pool.
pub fn reconstruct_graphene(
	slot: &mut ReconstructionSlot,
	graphene: &GrapheneBlock,
	pool: &[(Hash, TxRef)],
) -> GrapheneResult {
	slot.header = Some(graphene.header);
	for tx in &graphene.additional {
		let tx = Arc::new(tx.clone());
		slot.collected.insert(tx.txid(), tx);
	}

	// candidate set: pool entries passing the sender's bloom filter
	let mut candidates: HashMap<u64, Hash> = HashMap::new();
	let mut our_iblt = Iblt::new(
		graphene.iblt.len(),
		graphene.nonce,
	);
	// match cell geometry exactly for subtraction
	our_iblt.cells = vec![IbltCell::default(); graphene.iblt.cells.len()];
	for (txid, _) in pool {
		let id = graphene_short_id(graphene.nonce, txid);
		if graphene.filter.contains(&id.to_le_bytes()) {
			candidates.insert(id, *txid);
			our_iblt.insert(id);
		}
	}
	for txid in slot.collected.keys() {
		let id = graphene_short_id(graphene.nonce, txid);
		if candidates.insert(id, *txid).is_none() {
			our_iblt.insert(id);
		}
	}

	let diff = match graphene.iblt.subtract(&our_iblt) {
		Some(d) => d,
		None => return GrapheneResult::NeedRecovery,
	};
	let (in_block_only, in_pool_only) = match diff.decode() {
		Ok(sets) => sets,
		Err(()) => {
			debug!(
				"graphene iblt for {} failed to peel, requesting recovery",
				graphene.header.hash()
			);
			return GrapheneResult::NeedRecovery;
		}
	};

	// block id set = candidates minus pool-only plus block-only
	let mut resolved: HashMap<u64, Hash> = candidates
		.iter()
		.filter(|(id, _)| !in_pool_only.contains(*id))
		.map(|(id, txid)| (*id, *txid))
		.collect();
	let missing: HashSet<u64> = in_block_only
		.iter()
		.filter(|id| !resolved.contains_key(*id))
		.cloned()
		.collect();

	for txid in slot.collected.keys() {
		resolved.insert(graphene_short_id(graphene.nonce, txid), *txid);
	}

	slot.graphene = Some(GrapheneData {
		nonce: graphene.nonce,
		n_block_txs: graphene.n_block_txs,
		resolved: resolved.clone(),
		missing: missing.clone(),
	});

	if !missing.is_empty() {
		return GrapheneResult::NeedTxs(missing.into_iter().collect());
	}

	assemble_graphene_block(slot, pool)
		.map(GrapheneResult::Complete)
		.unwrap_or(GrapheneResult::NeedRecovery)
}

/// Assemble the final block once every short id resolved: coinbase first,
/// then canonical order by txid.
pub fn assemble_graphene_block(
	slot: &ReconstructionSlot,
	pool: &[(Hash, TxRef)],
) -> Option<Block> {
	let header = slot.header?;
	let data = slot.graphene.as_ref()?;

	let pool_map: HashMap<Hash, TxRef> = pool.iter().map(|(h, t)| (*h, t.clone())).collect();
	let mut txs: Vec<TxRef> = Vec::with_capacity(data.resolved.len());
	for txid in data.resolved.values() {
		let tx = slot
			.collected
			.get(txid)
			.cloned()
			.or_else(|| pool_map.get(txid).cloned())?;
		txs.push(tx);
	}
	if (txs.len() as u64) != data.n_block_txs {
		return None;
	}
	blockorder::topo_canonical_sort(&mut txs);
	Some(Block { header, txs })
}

/// Fold freshly arrived transactions into the slot and retry assembly.
pub fn add_txs(
	slot: &mut ReconstructionSlot,
	txs: &[Transaction],
	pool: &[(Hash, TxRef)],
) -> GrapheneResult {
	for tx in txs {
		let tx = Arc::new(tx.clone());
		slot.collected.insert(tx.txid(), tx);
	}
	let nonce = match slot.graphene.as_ref() {
		Some(d) => d.nonce,
		None => return GrapheneResult::NeedRecovery,
	};
	let collected: Vec<Hash> = slot.collected.keys().cloned().collect();
	if let Some(data) = slot.graphene.as_mut() {
		for txid in collected {
			let id = graphene_short_id(nonce, &txid);
			data.missing.remove(&id);
			data.resolved.insert(id, txid);
		}
		if !data.missing.is_empty() {
			return GrapheneResult::NeedTxs(data.missing.iter().cloned().collect());
		}
	}
	assemble_graphene_block(slot, pool)
		.map(GrapheneResult::Complete)
		.unwrap_or(GrapheneResult::NeedRecovery)
}

/// Apply a recovery answer (the full txid list) after a failed peel: the
/// id set becomes exact and anything not resolvable locally is fetched.
pub fn apply_recovery(
	slot: &mut ReconstructionSlot,
	recovery: &GrapheneRecovery,
	nonce: u64,
	n_block_txs: u64,
	pool: &[(Hash, TxRef)],
) -> GrapheneResult {
	let pool_map: HashMap<Hash, TxRef> = pool.iter().map(|(h, t)| (*h, t.clone())).collect();
	let mut resolved = HashMap::new();
	let mut missing = HashSet::new();
	for txid in &recovery.tx_hashes {
		let id = graphene_short_id(nonce, txid);
		if slot.collected.contains_key(txid) || pool_map.contains_key(txid) {
			resolved.insert(id, *txid);
		} else {
			missing.insert(id);
		}
	}
	slot.graphene = Some(GrapheneData {
		nonce,
		n_block_txs,
		resolved,
		missing: missing.clone(),
	});
	if !missing.is_empty() {
		return GrapheneResult::NeedTxs(missing.into_iter().collect());
	}
	assemble_graphene_block(slot, pool)
		.map(GrapheneResult::Complete)
		.unwrap_or(GrapheneResult::NeedRecovery)
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
				script_sig: vec![2],
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
	fn iblt_peels_symmetric_difference() {
		let mut a = Iblt::new(8, 42);
		let mut b = Iblt::new(8, 42);
		// shared keys
		for k in 100u64..140 {
			a.insert(k);
			b.insert(k);
		}
		a.insert(7777);
		a.insert(8888);
		b.insert(9999);

		let diff = a.subtract(&b).unwrap();
		let (only_a, only_b) = diff.decode().unwrap();
		assert_eq!(only_a, [7777u64, 8888].iter().cloned().collect());
		assert_eq!(only_b, [9999u64].iter().cloned().collect());
	}

	#[test]
	fn iblt_round_trip() {
		let mut iblt = Iblt::new(4, 9);
		iblt.insert(1);
		iblt.insert(2);
		let bytes = ser_vec(&iblt).unwrap();
		let iblt2: Iblt = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(iblt, iblt2);
	}

	#[test]
	fn graphene_full_mempool_reconstructs() {
		let txs: Vec<TxRef> = vec![coinbase(), tx(1), tx(2), tx(3), tx(4)];
		let mut block = Block {
			header: BlockHeader::default(),
			txs: txs.clone(),
		};
		crate::core::blockorder::topo_canonical_sort(&mut block.txs);

		// receiver has every non-coinbase txn plus a couple of extras
		let mut pool: Vec<(Hash, TxRef)> = txs[1..].iter().map(|t| (t.txid(), t.clone())).collect();
		for seed in 50u64..52 {
			let t = tx(seed);
			pool.push((t.txid(), t));
		}

		let info = MempoolInfo {
			tx_count: pool.len() as u64,
			filter_pref: 0,
		};
		let graphene = build_graphene(&block, &info, 2, 777);
		let bytes = ser_vec(&graphene).unwrap();
		let graphene: GrapheneBlock = deserialize(&mut &bytes[..]).unwrap();

		let mut slot = ReconstructionSlot {
			header: None,
			collected: HashMap::new(),
			thin: None,
			graphene: None,
			compact: None,
			total_bytes: 0,
		};
		match reconstruct_graphene(&mut slot, &graphene, &pool) {
			GrapheneResult::Complete(b) => {
				assert_eq!(b.txs.len(), block.txs.len());
				assert_eq!(b.hash(), block.hash());
			}
			GrapheneResult::NeedTxs(need) => panic!("unexpected missing ids: {:?}", need),
			GrapheneResult::NeedRecovery => panic!("unexpected peel failure"),
		}
	}

	#[test]
	fn graphene_missing_txs_are_fetched() {
		let missing_tx = tx(99);
		let txs: Vec<TxRef> = vec![coinbase(), tx(1), missing_tx.clone()];
		let mut block = Block {
			header: BlockHeader::default(),
			txs: txs.clone(),
		};
		crate::core::blockorder::topo_canonical_sort(&mut block.txs);

		// pool misses tx(99)
		let pool: Vec<(Hash, TxRef)> = txs[1..2].iter().map(|t| (t.txid(), t.clone())).collect();
		let info = MempoolInfo {
			tx_count: pool.len() as u64,
			filter_pref: 0,
		};
		let graphene = build_graphene(&block, &info, 2, 123);

		let mut slot = ReconstructionSlot {
			header: None,
			collected: HashMap::new(),
			thin: None,
			graphene: None,
			compact: None,
			total_bytes: 0,
		};
		match reconstruct_graphene(&mut slot, &graphene, &pool) {
			GrapheneResult::NeedTxs(need) => {
				assert_eq!(need.len(), 1);
				assert_eq!(need[0], graphene_short_id(123, &missing_tx.txid()));
			}
			GrapheneResult::Complete(_) => panic!("should be missing a txn"),
			GrapheneResult::NeedRecovery => panic!("peel should succeed"),
		}
	}
}
