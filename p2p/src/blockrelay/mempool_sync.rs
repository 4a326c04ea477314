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

//! Peer-initiated mempool synchronization: a peer asks for our pool's
//! txid set (as cheap hashes), diffs it against its own and fetches the
//! transactions it misses. Served at most once per peer per 30 seconds.

use std::time::Duration;

use crate::core::core::hash::Hash;
use crate::core::core::transaction::Transaction;
use crate::core::ser::{self, read_vec, write_vec, Readable, Reader, Writeable, Writer};

/// Minimum spacing of mempool-sync requests per peer.
pub const MEMPOOL_SYNC_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Largest txid set exchanged in one sync round.
const MAX_SYNC_HASHES: u64 = 1_000_000;

/// Request for a mempool snapshot.
#[derive(Debug, Clone, Copy)]
pub struct GetMempoolSync {
	/// Negotiated mempool-sync version.
	pub version: u64,
	/// Round-trip pairing nonce.
	pub nonce: u64,
}

impl Writeable for GetMempoolSync {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u64(self.version)?;
		writer.write_u64(self.nonce)
	}
}

impl Readable for GetMempoolSync {
	fn read<R: Reader>(reader: &mut R) -> Result<GetMempoolSync, ser::Error> {
		Ok(GetMempoolSync {
			version: reader.read_u64()?,
			nonce: reader.read_u64()?,
		})
	}
}

/// A mempool snapshot: every pool txid folded to its cheap hash.
#[derive(Debug, Clone)]
pub struct MempoolSync {
	/// Pairing nonce echoed from the request.
	pub nonce: u64,
	/// Cheap hashes of the pool's txids.
	pub cheap_hashes: Vec<u64>,
}

impl Writeable for MempoolSync {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u64(self.nonce)?;
		writer.write_var_int(self.cheap_hashes.len() as u64)?;
		for h in &self.cheap_hashes {
			writer.write_u64(*h)?;
		}
		Ok(())
	}
}

impl Readable for MempoolSync {
	fn read<R: Reader>(reader: &mut R) -> Result<MempoolSync, ser::Error> {
		let nonce = reader.read_u64()?;
		let len = reader.read_var_int()?;
		if len > MAX_SYNC_HASHES {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut cheap_hashes = Vec::with_capacity(len.min(100_000) as usize);
		for _ in 0..len {
			cheap_hashes.push(reader.read_u64()?);
		}
		Ok(MempoolSync { nonce, cheap_hashes })
	}
}

/// Request for the transactions behind a set of cheap hashes.
#[derive(Debug, Clone)]
pub struct GetMempoolSyncTx {
	/// The wanted cheap hashes.
	pub cheap_hashes: Vec<u64>,
}

impl Writeable for GetMempoolSyncTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_var_int(self.cheap_hashes.len() as u64)?;
		for h in &self.cheap_hashes {
			writer.write_u64(*h)?;
		}
		Ok(())
	}
}

impl Readable for GetMempoolSyncTx {
	fn read<R: Reader>(reader: &mut R) -> Result<GetMempoolSyncTx, ser::Error> {
		let len = reader.read_var_int()?;
		if len > MAX_SYNC_HASHES {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut cheap_hashes = Vec::with_capacity(len.min(100_000) as usize);
		for _ in 0..len {
			cheap_hashes.push(reader.read_u64()?);
		}
		Ok(GetMempoolSyncTx { cheap_hashes })
	}
}

/// Transactions answering a get_mpsynctx.
#[derive(Debug, Clone)]
pub struct MempoolSyncTx {
	/// The requested transactions.
	pub txs: Vec<Transaction>,
}

impl Writeable for MempoolSyncTx {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		write_vec(writer, &self.txs)
	}
}

impl Readable for MempoolSyncTx {
	fn read<R: Reader>(reader: &mut R) -> Result<MempoolSyncTx, ser::Error> {
		Ok(MempoolSyncTx {
			txs: read_vec(reader, MAX_SYNC_HASHES)?,
		})
	}
}

/// The cheap hashes in `ours` that `theirs` does not list.
pub fn diff_missing(ours: &[Hash], theirs: &[u64]) -> Vec<u64> {
	let theirs: std::collections::HashSet<u64> = theirs.iter().cloned().collect();
	ours.iter()
		.map(|h| h.cheap_hash())
		.filter(|ch| !theirs.contains(ch))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::hash::sha256d;
	use crate::core::ser::{deserialize, ser_vec};

	#[test]
	fn sync_messages_round_trip() {
		let snapshot = MempoolSync {
			nonce: 3,
			cheap_hashes: vec![1, 2, 3, 0xffff_ffff_ffff_ffff],
		};
		let bytes = ser_vec(&snapshot).unwrap();
		let snapshot2: MempoolSync = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(snapshot2.cheap_hashes, snapshot.cheap_hashes);
	}

	#[test]
	fn diff_finds_missing() {
		let a = sha256d(b"a");
		let b = sha256d(b"b");
		let theirs = vec![a.cheap_hash()];
		let missing = diff_missing(&[a, b], &theirs);
		assert_eq!(missing, vec![b.cheap_hash()]);
	}
}
