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

//! Inventory items, the currency of inv/getdata exchanges.

use std::fmt;

use crate::core::hash::Hash;
use crate::ser::{self, Readable, Reader, Writeable, Writer};

/// The kind of object an inventory item names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
	/// A transaction.
	Tx,
	/// A full block.
	Block,
	/// A bloom-filtered block for SPV peers.
	FilteredBlock,
	/// A compact block.
	CmpctBlock,
	/// An xthin block.
	XthinBlock,
	/// A graphene block.
	GrapheneBlock,
	/// A double-spend proof.
	DoubleSpendProof,
}

impl InvType {
	/// Wire value of this inventory type.
	pub fn to_u32(self) -> u32 {
		match self {
			InvType::Tx => 1,
			InvType::Block => 2,
			InvType::FilteredBlock => 3,
			InvType::CmpctBlock => 4,
			InvType::XthinBlock => 5,
			InvType::GrapheneBlock => 6,
			InvType::DoubleSpendProof => 0x9472_1BA7,
		}
	}

	/// Parse a wire value.
	pub fn from_u32(n: u32) -> Option<InvType> {
		match n {
			1 => Some(InvType::Tx),
			2 => Some(InvType::Block),
			3 => Some(InvType::FilteredBlock),
			4 => Some(InvType::CmpctBlock),
			5 => Some(InvType::XthinBlock),
			6 => Some(InvType::GrapheneBlock),
			0x9472_1BA7 => Some(InvType::DoubleSpendProof),
			_ => None,
		}
	}

	/// Whether this type names a block representation (any flavour).
	pub fn is_block_type(self) -> bool {
		match self {
			InvType::Block
			| InvType::FilteredBlock
			| InvType::CmpctBlock
			| InvType::XthinBlock
			| InvType::GrapheneBlock => true,
			_ => false,
		}
	}
}

/// An inventory item: a typed object hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inv {
	/// What kind of object.
	pub kind: InvType,
	/// Its hash.
	pub hash: Hash,
}

impl Inv {
	/// Convenience constructor.
	pub fn new(kind: InvType, hash: Hash) -> Inv {
		Inv { kind, hash }
	}
}

impl fmt::Display for Inv {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?} {}", self.kind, self.hash)
	}
}

impl Writeable for Inv {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u32(self.kind.to_u32())?;
		self.hash.write(writer)
	}
}

impl Readable for Inv {
	fn read<R: Reader>(reader: &mut R) -> Result<Inv, ser::Error> {
		let kind = InvType::from_u32(reader.read_u32()?).ok_or(ser::Error::CorruptedData)?;
		let hash = Hash::read(reader)?;
		Ok(Inv { kind, hash })
	}
}
