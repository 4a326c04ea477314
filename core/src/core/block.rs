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

//! Blocks and block headers.

use std::sync::Arc;

use crate::core::hash::{Hash, Hashed};
use crate::core::transaction::{Transaction, TxRef};
use crate::ser::{self, Readable, Reader, Writeable, Writer};

/// Ceiling on the declared transaction count accepted from the wire.
const MAX_BLOCK_TXS: u64 = 8_000_000;

/// The header of a block, hashed for proof of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
	/// Format version.
	pub version: i32,
	/// Hash of the previous block on the chain this block extends.
	pub prev_block_hash: Hash,
	/// Merkle root of the block's transactions.
	pub merkle_root: Hash,
	/// Timestamp (epoch seconds).
	pub time: u32,
	/// Compact difficulty target.
	pub bits: u32,
	/// Proof-of-work nonce.
	pub nonce: u32,
}

impl Default for BlockHeader {
	fn default() -> BlockHeader {
		BlockHeader {
			version: 1,
			prev_block_hash: Hash::default(),
			merkle_root: Hash::default(),
			time: 0,
			bits: 0,
			nonce: 0,
		}
	}
}

impl Writeable for BlockHeader {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_i32(self.version)?;
		self.prev_block_hash.write(writer)?;
		self.merkle_root.write(writer)?;
		writer.write_u32(self.time)?;
		writer.write_u32(self.bits)?;
		writer.write_u32(self.nonce)
	}
}

impl Readable for BlockHeader {
	fn read<R: Reader>(reader: &mut R) -> Result<BlockHeader, ser::Error> {
		Ok(BlockHeader {
			version: reader.read_i32()?,
			prev_block_hash: Hash::read(reader)?,
			merkle_root: Hash::read(reader)?,
			time: reader.read_u32()?,
			bits: reader.read_u32()?,
			nonce: reader.read_u32()?,
		})
	}
}

impl Hashed for BlockHeader {}

/// A full block: a header plus the ordered transaction set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
	/// The block header.
	pub header: BlockHeader,
	/// Transactions, coinbase first.
	pub txs: Vec<TxRef>,
}

impl Block {
	/// An empty block on the given header.
	pub fn with_header(header: BlockHeader) -> Block {
		Block {
			header,
			txs: vec![],
		}
	}

	/// The block hash (hash of the header).
	pub fn hash(&self) -> Hash {
		self.header.hash()
	}

	/// Serialized size of the whole block in bytes.
	pub fn total_size(&self) -> u64 {
		ser::ser_vec(self).map(|v| v.len() as u64).unwrap_or(0)
	}
}

impl Writeable for Block {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.header.write(writer)?;
		writer.write_var_int(self.txs.len() as u64)?;
		for tx in &self.txs {
			tx.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for Block {
	fn read<R: Reader>(reader: &mut R) -> Result<Block, ser::Error> {
		let header = BlockHeader::read(reader)?;
		let len = reader.read_var_int()?;
		if len > MAX_BLOCK_TXS {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut txs = Vec::with_capacity(len.min(10_000) as usize);
		for _ in 0..len {
			txs.push(Arc::new(Transaction::read(reader)?));
		}
		Ok(Block { header, txs })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::transaction::{OutPoint, TxIn, TxOut};
	use crate::ser::{deserialize, ser_vec};

	#[test]
	fn block_ser_round_trip() {
		let coinbase = Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint::null(),
				script_sig: vec![0x01, 0x02],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: 25_0000_0000,
				script_pubkey: vec![0x6a],
			}],
			lock_time: 0,
		};
		let block = Block {
			header: BlockHeader::default(),
			txs: vec![Arc::new(coinbase)],
		};
		let bytes = ser_vec(&block).unwrap();
		let block2: Block = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(block, block2);
		assert_eq!(block.hash(), block2.hash());
	}
}
