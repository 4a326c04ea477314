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

//! Hash Function
//!
//! Primary hash function used in the protocol: double SHA-256.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::ser::{self, Readable, Reader, Writeable, Writer};

/// A hash to uniquely (or close enough) identify one of the main blockchain
/// constructs. Used pervasively for blocks and transactions.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

/// The all-zero hash, used as the null sentinel throughout.
pub const ZERO_HASH: Hash = Hash([0; 32]);

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// displayed in the customary reversed byte order
		for b in self.0.iter().rev() {
			write!(f, "{:02x}", b)?;
		}
		Ok(())
	}
}

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl Hash {
	/// Builds a hash from a byte slice, which must be 32 bytes long.
	pub fn from_vec(v: &[u8]) -> Hash {
		let mut a = [0; 32];
		a.copy_from_slice(&v[0..32]);
		Hash(a)
	}

	/// The hash as a byte slice.
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	/// Whether this is the all-zero null hash.
	pub fn is_null(&self) -> bool {
		self.0.iter().all(|b| *b == 0)
	}

	/// The low 64 bits, used where a full hash would waste bandwidth.
	/// Collisions are tolerated by every consumer.
	pub fn cheap_hash(&self) -> u64 {
		let mut n = 0u64;
		for i in (0..8).rev() {
			n = (n << 8) | self.0[i] as u64;
		}
		n
	}
}

impl Writeable for Hash {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_fixed_bytes(&self.0)
	}
}

impl Readable for Hash {
	fn read<R: Reader>(reader: &mut R) -> Result<Hash, ser::Error> {
		let bytes = reader.read_fixed_bytes(32)?;
		Ok(Hash::from_vec(&bytes))
	}
}

/// Double SHA-256 of the provided data.
pub fn sha256d(data: &[u8]) -> Hash {
	let first = Sha256::digest(data);
	let second = Sha256::digest(&first);
	Hash::from_vec(&second)
}

/// Single SHA-256 of the provided data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
	let digest = Sha256::digest(data);
	let mut out = [0u8; 32];
	out.copy_from_slice(&digest);
	out
}

/// A trait for types identified by the double SHA-256 of their byte
/// serialization.
pub trait Hashed: Writeable {
	/// The double SHA-256 of this type's serialization.
	fn hash(&self) -> Hash
	where
		Self: Sized,
	{
		let data = crate::ser::ser_vec(self).expect("serialization of in-memory value");
		sha256d(&data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_and_cheap() {
		assert!(ZERO_HASH.is_null());
		assert_eq!(ZERO_HASH.cheap_hash(), 0);

		let mut bytes = [0u8; 32];
		bytes[0] = 0x01;
		bytes[7] = 0x80;
		let h = Hash(bytes);
		assert!(!h.is_null());
		assert_eq!(h.cheap_hash(), 0x8000_0000_0000_0001);
	}

	#[test]
	fn sha256d_known_vector() {
		// double SHA-256 of the empty string
		let h = sha256d(b"");
		assert_eq!(
			format!("{}", h),
			"56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
		);
	}
}
