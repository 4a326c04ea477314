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

//! The murmur3-based bloom filter used both for SPV transaction relay
//! (filterload/filteradd/filterclear) and as the have-set a receiver sends
//! along with an xthin request.

use crate::core::ser::{self, Readable, Reader, Writeable, Writer};

/// Largest filter accepted off the wire, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Most hash functions a filter may use.
pub const MAX_HASH_FUNCS: u32 = 50;

const LN2_SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;

/// A fixed-size bloom filter over arbitrary byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
	/// The filter bits.
	pub data: Vec<u8>,
	/// Number of hash functions applied per element.
	pub n_hash_funcs: u32,
	/// Random tweak folded into every hash.
	pub tweak: u32,
	/// Update flags (SPV relay semantics).
	pub flags: u8,
}

impl BloomFilter {
	/// Size a filter for the expected element count and false-positive
	/// rate, clamped to the wire maximums.
	pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: u8) -> BloomFilter {
		let elements = elements.max(1);
		let bits = (-1.0 / LN2_SQUARED * elements as f64 * fp_rate.ln()).ceil();
		let size = ((bits / 8.0) as usize).max(1).min(MAX_BLOOM_FILTER_SIZE);
		let n_hash_funcs = ((size as f64 * 8.0 / elements as f64) * std::f64::consts::LN_2)
			.max(1.0)
			.min(MAX_HASH_FUNCS as f64) as u32;
		BloomFilter {
			data: vec![0u8; size],
			n_hash_funcs,
			tweak,
			flags,
		}
	}

	/// Whether the filter respects the wire size limits; oversized filters
	/// are a misbehaviour.
	pub fn is_within_size_constraints(&self) -> bool {
		self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.n_hash_funcs <= MAX_HASH_FUNCS
	}

	fn bit_index(&self, n: u32, data: &[u8]) -> usize {
		let seed = (n as u64 * 0xfba4_c795 + self.tweak as u64) as u32;
		murmur3_32(data, seed) as usize % (self.data.len() * 8)
	}

	/// Add an element.
	pub fn insert(&mut self, data: &[u8]) {
		if self.data.is_empty() {
			return;
		}
		for n in 0..self.n_hash_funcs {
			let idx = self.bit_index(n, data);
			self.data[idx >> 3] |= 1 << (idx & 7);
		}
	}

	/// Whether the element may be in the set (false positives possible).
	pub fn contains(&self, data: &[u8]) -> bool {
		if self.data.is_empty() || self.n_hash_funcs == 0 {
			return false;
		}
		for n in 0..self.n_hash_funcs {
			let idx = self.bit_index(n, data);
			if self.data[idx >> 3] & (1 << (idx & 7)) == 0 {
				return false;
			}
		}
		true
	}

	/// Clear all bits.
	pub fn clear(&mut self) {
		for b in self.data.iter_mut() {
			*b = 0;
		}
	}
}

impl Writeable for BloomFilter {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_bytes(&self.data)?;
		writer.write_u32(self.n_hash_funcs)?;
		writer.write_u32(self.tweak)?;
		writer.write_u8(self.flags)
	}
}

impl Readable for BloomFilter {
	fn read<R: Reader>(reader: &mut R) -> Result<BloomFilter, ser::Error> {
		let data = reader.read_bytes()?;
		if data.len() > MAX_BLOOM_FILTER_SIZE {
			return Err(ser::Error::TooLargeRead(data.len() as u64));
		}
		Ok(BloomFilter {
			data,
			n_hash_funcs: reader.read_u32()?,
			tweak: reader.read_u32()?,
			flags: reader.read_u8()?,
		})
	}
}

/// MurmurHash3 (x86, 32-bit), as used by the filter wire format.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
	const C1: u32 = 0xcc9e_2d51;
	const C2: u32 = 0x1b87_3593;

	let mut h1 = seed;
	let mut chunks = data.chunks_exact(4);
	for chunk in &mut chunks {
		let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		k1 = k1.wrapping_mul(C1);
		k1 = k1.rotate_left(15);
		k1 = k1.wrapping_mul(C2);
		h1 ^= k1;
		h1 = h1.rotate_left(13);
		h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
	}

	let rem = chunks.remainder();
	if !rem.is_empty() {
		let mut k1 = 0u32;
		for (i, b) in rem.iter().enumerate() {
			k1 |= (*b as u32) << (8 * i);
		}
		k1 = k1.wrapping_mul(C1);
		k1 = k1.rotate_left(15);
		k1 = k1.wrapping_mul(C2);
		h1 ^= k1;
	}

	h1 ^= data.len() as u32;
	h1 ^= h1 >> 16;
	h1 = h1.wrapping_mul(0x85eb_ca6b);
	h1 ^= h1 >> 13;
	h1 = h1.wrapping_mul(0xc2b2_ae35);
	h1 ^= h1 >> 16;
	h1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn murmur_known_vectors() {
		assert_eq!(murmur3_32(b"", 0), 0);
		assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
		assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
	}

	#[test]
	fn filter_insert_and_query() {
		let mut filter = BloomFilter::new(100, 0.01, 5, 0);
		assert!(filter.is_within_size_constraints());

		for i in 0u32..100 {
			filter.insert(&i.to_le_bytes());
		}
		for i in 0u32..100 {
			assert!(filter.contains(&i.to_le_bytes()));
		}
		// false positive rate sanity: most absent elements miss
		let misses = (1000u32..2000)
			.filter(|i| !filter.contains(&i.to_le_bytes()))
			.count();
		assert!(misses > 900);

		filter.clear();
		assert!(!filter.contains(&1u32.to_le_bytes()));
	}
}
