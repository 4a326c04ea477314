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

//! Serialization and deserialization layer specialized for binary encoding.
//! Ensures consistency and safety. Integers are little-endian and collection
//! lengths use the compact-size encoding, matching the wire the node speaks.
//!
//! To use it simply implement `Writeable` or `Readable` and then use the
//! `serialize` or `deserialize` functions on them as appropriate.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::{fmt, string};

/// Largest single allocation a length prefix may ask for. Anything bigger
/// is corrupt or hostile; message-level caps are enforced above this layer.
const MAX_ALLOC_SIZE: u64 = 64 * 1024 * 1024;

/// Possible errors deriving from serializing or deserializing.
#[derive(Debug)]
pub enum Error {
	/// Wraps an io error produced when reading or writing
	IOErr(io::Error),
	/// Expected a given value that wasn't found
	UnexpectedData {
		/// What we wanted
		expected: Vec<u8>,
		/// What we got
		received: Vec<u8>,
	},
	/// Data wasn't in a consumable format
	CorruptedData,
	/// A length prefix asks for more data than we are willing to allocate
	TooLargeRead(u64),
	/// A compact-size used a longer encoding than necessary
	NonCanonicalVarInt,
	/// A string was not valid utf8
	BadString,
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::IOErr(e)
	}
}

impl From<string::FromUtf8Error> for Error {
	fn from(_: string::FromUtf8Error) -> Error {
		Error::BadString
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Error::IOErr(ref e) => write!(f, "io error: {}", e),
			Error::UnexpectedData {
				ref expected,
				ref received,
			} => write!(f, "expected {:?}, got {:?}", expected, received),
			Error::CorruptedData => f.write_str("corrupted data"),
			Error::TooLargeRead(n) => write!(f, "length prefix too large: {}", n),
			Error::NonCanonicalVarInt => f.write_str("non-canonical compact size"),
			Error::BadString => f.write_str("string not valid utf8"),
		}
	}
}

impl std::error::Error for Error {}

/// Implementations defined how different numbers and binary structures are
/// written to an underlying stream or container (depending on implementation).
pub trait Writer {
	/// Writes a u8 as bytes
	fn write_u8(&mut self, n: u8) -> Result<(), Error>;
	/// Writes a u16 as bytes
	fn write_u16(&mut self, n: u16) -> Result<(), Error>;
	/// Writes a u32 as bytes
	fn write_u32(&mut self, n: u32) -> Result<(), Error>;
	/// Writes a u64 as bytes
	fn write_u64(&mut self, n: u64) -> Result<(), Error>;
	/// Writes an i32 as bytes
	fn write_i32(&mut self, n: i32) -> Result<(), Error>;
	/// Writes an i64 as bytes
	fn write_i64(&mut self, n: i64) -> Result<(), Error>;
	/// Writes a fixed number of bytes. The reader is expected to know the
	/// actual length on read.
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error>;

	/// Writes a compact-size length.
	fn write_var_int(&mut self, n: u64) -> Result<(), Error> {
		if n < 0xfd {
			self.write_u8(n as u8)
		} else if n <= 0xffff {
			self.write_u8(0xfd)?;
			self.write_u16(n as u16)
		} else if n <= 0xffff_ffff {
			self.write_u8(0xfe)?;
			self.write_u32(n as u32)
		} else {
			self.write_u8(0xff)?;
			self.write_u64(n)
		}
	}

	/// Writes a variable length byte vector, length prefixed as compact-size.
	fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.write_var_int(bytes.len() as u64)?;
		self.write_fixed_bytes(bytes)
	}
}

/// Implementations defined how different numbers and binary structures are
/// read from an underlying stream or container (depending on implementation).
pub trait Reader {
	/// Read a u8 from the underlying Read
	fn read_u8(&mut self) -> Result<u8, Error>;
	/// Read a u16 from the underlying Read
	fn read_u16(&mut self) -> Result<u16, Error>;
	/// Read a u32 from the underlying Read
	fn read_u32(&mut self) -> Result<u32, Error>;
	/// Read a u64 from the underlying Read
	fn read_u64(&mut self) -> Result<u64, Error>;
	/// Read an i32 from the underlying Read
	fn read_i32(&mut self) -> Result<i32, Error>;
	/// Read an i64 from the underlying Read
	fn read_i64(&mut self) -> Result<i64, Error>;
	/// Read a fixed number of bytes from the underlying reader.
	fn read_fixed_bytes(&mut self, length: usize) -> Result<Vec<u8>, Error>;

	/// Read a compact-size length, rejecting non-canonical encodings.
	fn read_var_int(&mut self) -> Result<u64, Error> {
		let first = self.read_u8()?;
		let n = match first {
			0xfd => {
				let v = self.read_u16()? as u64;
				if v < 0xfd {
					return Err(Error::NonCanonicalVarInt);
				}
				v
			}
			0xfe => {
				let v = self.read_u32()? as u64;
				if v <= 0xffff {
					return Err(Error::NonCanonicalVarInt);
				}
				v
			}
			0xff => {
				let v = self.read_u64()?;
				if v <= 0xffff_ffff {
					return Err(Error::NonCanonicalVarInt);
				}
				v
			}
			n => n as u64,
		};
		Ok(n)
	}

	/// Read a compact-size prefixed byte vector.
	fn read_bytes(&mut self) -> Result<Vec<u8>, Error> {
		let len = self.read_var_int()?;
		if len > MAX_ALLOC_SIZE {
			return Err(Error::TooLargeRead(len));
		}
		self.read_fixed_bytes(len as usize)
	}

	/// Consumes a byte from the reader, producing an error if it doesn't have
	/// the expected value
	fn expect_u8(&mut self, val: u8) -> Result<u8, Error> {
		let b = self.read_u8()?;
		if b == val {
			Ok(b)
		} else {
			Err(Error::UnexpectedData {
				expected: vec![val],
				received: vec![b],
			})
		}
	}
}

/// Trait that every type that can be serialized as binary must implement.
/// Writes directly to a Writer, a utility type thinly wrapping an
/// underlying Write implementation.
pub trait Writeable {
	/// Write the data held by this Writeable to the provided writer
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error>;
}

/// Trait that every type that can be deserialized from binary must implement.
/// Reads directly to a Reader, a utility type thinly wrapping an
/// underlying Read implementation.
pub trait Readable: Sized {
	/// Reads the data necessary to this Readable from the provided reader
	fn read<R: Reader>(reader: &mut R) -> Result<Self, Error>;
}

/// Deserializes a Readable from any std::io::Read implementation.
pub fn deserialize<T: Readable, R: Read>(source: &mut R) -> Result<T, Error> {
	let mut reader = BinReader { source };
	T::read(&mut reader)
}

/// Serializes a Writeable into any std::io::Write implementation.
pub fn serialize<T: Writeable, W: Write>(sink: &mut W, thing: &T) -> Result<(), Error> {
	let mut writer = BinWriter { sink };
	thing.write(&mut writer)
}

/// Utility function to serialize a writeable directly in memory using a
/// Vec<u8>.
pub fn ser_vec<T: Writeable>(thing: &T) -> Result<Vec<u8>, Error> {
	let mut vec = Vec::new();
	serialize(&mut vec, thing)?;
	Ok(vec)
}

/// Utility to read a vector of Readables, compact-size length prefixed,
/// enforcing a caller-provided count ceiling.
pub fn read_vec<T: Readable, R: Reader>(reader: &mut R, max: u64) -> Result<Vec<T>, Error> {
	let len = reader.read_var_int()?;
	if len > max {
		return Err(Error::TooLargeRead(len));
	}
	let mut v = Vec::with_capacity(len.min(10_000) as usize);
	for _ in 0..len {
		v.push(T::read(reader)?);
	}
	Ok(v)
}

/// Utility to write a vector of Writeables, compact-size length prefixed.
pub fn write_vec<T: Writeable, W: Writer>(writer: &mut W, v: &[T]) -> Result<(), Error> {
	writer.write_var_int(v.len() as u64)?;
	for item in v {
		item.write(writer)?;
	}
	Ok(())
}

/// Utility wrapper for an underlying byte Reader. Defines higher level
/// methods to read numbers, byte vectors, hashes, etc.
pub struct BinReader<'a, R: Read> {
	source: &'a mut R,
}

impl<'a, R: Read> BinReader<'a, R> {
	/// Wrap the provided source.
	pub fn new(source: &'a mut R) -> BinReader<'a, R> {
		BinReader { source }
	}
}

impl<'a, R: Read> Reader for BinReader<'a, R> {
	fn read_u8(&mut self) -> Result<u8, Error> {
		self.source.read_u8().map_err(Error::IOErr)
	}
	fn read_u16(&mut self) -> Result<u16, Error> {
		self.source.read_u16::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_u32(&mut self) -> Result<u32, Error> {
		self.source.read_u32::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_u64(&mut self) -> Result<u64, Error> {
		self.source.read_u64::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_i32(&mut self) -> Result<i32, Error> {
		self.source.read_i32::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_i64(&mut self) -> Result<i64, Error> {
		self.source.read_i64::<LittleEndian>().map_err(Error::IOErr)
	}
	fn read_fixed_bytes(&mut self, length: usize) -> Result<Vec<u8>, Error> {
		if length as u64 > MAX_ALLOC_SIZE {
			return Err(Error::TooLargeRead(length as u64));
		}
		let mut buf = vec![0; length];
		self.source
			.read_exact(&mut buf)
			.map(move |_| buf)
			.map_err(Error::IOErr)
	}
}

/// Utility wrapper for an underlying byte Writer. Defines higher level
/// methods to write numbers, byte vectors, hashes, etc.
pub struct BinWriter<'a, W: Write> {
	sink: &'a mut W,
}

impl<'a, W: Write> BinWriter<'a, W> {
	/// Wrap the provided sink.
	pub fn new(sink: &'a mut W) -> BinWriter<'a, W> {
		BinWriter { sink }
	}
}

impl<'a, W: Write> Writer for BinWriter<'a, W> {
	fn write_u8(&mut self, n: u8) -> Result<(), Error> {
		self.sink.write_u8(n).map_err(Error::IOErr)
	}
	fn write_u16(&mut self, n: u16) -> Result<(), Error> {
		self.sink.write_u16::<LittleEndian>(n).map_err(Error::IOErr)
	}
	fn write_u32(&mut self, n: u32) -> Result<(), Error> {
		self.sink.write_u32::<LittleEndian>(n).map_err(Error::IOErr)
	}
	fn write_u64(&mut self, n: u64) -> Result<(), Error> {
		self.sink.write_u64::<LittleEndian>(n).map_err(Error::IOErr)
	}
	fn write_i32(&mut self, n: i32) -> Result<(), Error> {
		self.sink.write_i32::<LittleEndian>(n).map_err(Error::IOErr)
	}
	fn write_i64(&mut self, n: i64) -> Result<(), Error> {
		self.sink.write_i64::<LittleEndian>(n).map_err(Error::IOErr)
	}
	fn write_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		self.sink.write_all(bytes).map_err(Error::IOErr)
	}
}

impl Writeable for Vec<u8> {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_bytes(self)
	}
}

impl Readable for Vec<u8> {
	fn read<R: Reader>(reader: &mut R) -> Result<Vec<u8>, Error> {
		reader.read_bytes()
	}
}

impl Writeable for String {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_bytes(self.as_bytes())
	}
}

impl Readable for String {
	fn read<R: Reader>(reader: &mut R) -> Result<String, Error> {
		let bytes = reader.read_bytes()?;
		Ok(String::from_utf8(bytes)?)
	}
}

impl Writeable for u64 {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), Error> {
		writer.write_u64(*self)
	}
}

impl Readable for u64 {
	fn read<R: Reader>(reader: &mut R) -> Result<u64, Error> {
		reader.read_u64()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn var_int_boundaries() {
		for n in &[0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
			let mut buf = vec![];
			{
				let mut w = BinWriter::new(&mut buf);
				w.write_var_int(*n).unwrap();
			}
			let mut slice = &buf[..];
			let mut r = BinReader::new(&mut slice);
			assert_eq!(r.read_var_int().unwrap(), *n);
		}
	}

	#[test]
	fn var_int_rejects_non_canonical() {
		// 0xfd prefix carrying a value that fits a single byte
		let buf = vec![0xfdu8, 0x01, 0x00];
		let mut slice = &buf[..];
		let mut r = BinReader::new(&mut slice);
		assert!(matches!(
			r.read_var_int(),
			Err(Error::NonCanonicalVarInt)
		));
	}

	#[test]
	fn bytes_round_trip() {
		let data = vec![1u8, 2, 3, 4, 5];
		let mut buf = vec![];
		{
			let mut w = BinWriter::new(&mut buf);
			w.write_bytes(&data).unwrap();
		}
		let mut slice = &buf[..];
		let mut r = BinReader::new(&mut slice);
		assert_eq!(r.read_bytes().unwrap(), data);
	}
}
