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

//! Transactions

use std::sync::Arc;

use crate::core::hash::{Hash, Hashed, ZERO_HASH};
use crate::ser::{self, read_vec, write_vec, Readable, Reader, Writeable, Writer};

/// Transactions are shared widely between the mempool view, blocks under
/// reconstruction and the weak-block store, so they travel refcounted.
pub type TxRef = Arc<Transaction>;

/// Ceiling on inputs/outputs accepted from the wire for a single txn.
const MAX_TX_PUTS: u64 = 1_000_000;

/// A reference to an output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
	/// The txid of the transaction holding the output.
	pub hash: Hash,
	/// The index of the output within that transaction.
	pub n: u32,
}

impl OutPoint {
	/// The null outpoint, only valid in a coinbase input.
	pub fn null() -> OutPoint {
		OutPoint {
			hash: ZERO_HASH,
			n: u32::max_value(),
		}
	}

	/// Whether this is the null (coinbase) outpoint.
	pub fn is_null(&self) -> bool {
		self.hash.is_null() && self.n == u32::max_value()
	}
}

impl Writeable for OutPoint {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.hash.write(writer)?;
		writer.write_u32(self.n)
	}
}

impl Readable for OutPoint {
	fn read<R: Reader>(reader: &mut R) -> Result<OutPoint, ser::Error> {
		let hash = Hash::read(reader)?;
		let n = reader.read_u32()?;
		Ok(OutPoint { hash, n })
	}
}

/// A transaction input spending a previous output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
	/// The output being spent.
	pub prevout: OutPoint,
	/// The unlocking script.
	pub script_sig: Vec<u8>,
	/// Sequence number.
	pub sequence: u32,
}

impl Writeable for TxIn {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.prevout.write(writer)?;
		writer.write_bytes(&self.script_sig)?;
		writer.write_u32(self.sequence)
	}
}

impl Readable for TxIn {
	fn read<R: Reader>(reader: &mut R) -> Result<TxIn, ser::Error> {
		let prevout = OutPoint::read(reader)?;
		let script_sig = reader.read_bytes()?;
		let sequence = reader.read_u32()?;
		Ok(TxIn {
			prevout,
			script_sig,
			sequence,
		})
	}
}

/// A transaction output carrying value to a locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
	/// Amount in satoshi.
	pub value: i64,
	/// The locking script.
	pub script_pubkey: Vec<u8>,
}

impl Writeable for TxOut {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_i64(self.value)?;
		writer.write_bytes(&self.script_pubkey)
	}
}

impl Readable for TxOut {
	fn read<R: Reader>(reader: &mut R) -> Result<TxOut, ser::Error> {
		let value = reader.read_i64()?;
		let script_pubkey = reader.read_bytes()?;
		Ok(TxOut {
			value,
			script_pubkey,
		})
	}
}

/// A full transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
	/// Format version.
	pub version: i32,
	/// Inputs.
	pub inputs: Vec<TxIn>,
	/// Outputs.
	pub outputs: Vec<TxOut>,
	/// Earliest block/time this txn may be mined.
	pub lock_time: u32,
}

impl Transaction {
	/// The transaction id: double SHA-256 of the serialization.
	pub fn txid(&self) -> Hash {
		self.hash()
	}

	/// Whether this is a coinbase transaction (single null-prevout input).
	pub fn is_coinbase(&self) -> bool {
		self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
	}

	/// Serialized size in bytes.
	pub fn total_size(&self) -> u64 {
		ser::ser_vec(self).map(|v| v.len() as u64).unwrap_or(0)
	}
}

impl Writeable for Transaction {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_i32(self.version)?;
		write_vec(writer, &self.inputs)?;
		write_vec(writer, &self.outputs)?;
		writer.write_u32(self.lock_time)
	}
}

impl Readable for Transaction {
	fn read<R: Reader>(reader: &mut R) -> Result<Transaction, ser::Error> {
		let version = reader.read_i32()?;
		let inputs = read_vec(reader, MAX_TX_PUTS)?;
		let outputs = read_vec(reader, MAX_TX_PUTS)?;
		let lock_time = reader.read_u32()?;
		Ok(Transaction {
			version,
			inputs,
			outputs,
			lock_time,
		})
	}
}

impl Hashed for Transaction {}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ser::{deserialize, ser_vec};

	fn simple_tx() -> Transaction {
		Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint::null(),
				script_sig: vec![0x51],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: 50_0000_0000,
				script_pubkey: vec![0x76, 0xa9],
			}],
			lock_time: 0,
		}
	}

	#[test]
	fn coinbase_detection() {
		let tx = simple_tx();
		assert!(tx.is_coinbase());
	}

	#[test]
	fn tx_ser_round_trip() {
		let tx = simple_tx();
		let bytes = ser_vec(&tx).unwrap();
		let tx2: Transaction = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(tx, tx2);
		assert_eq!(tx.txid(), tx2.txid());
	}
}
