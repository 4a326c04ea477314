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

//! Message types that transit over the network and related serialization
//! code. Every message is framed as
//! `MAGIC(4) || COMMAND(12, NUL-padded) || LENGTH(u32 LE) || CHECKSUM(4)`
//! followed by the payload. The checksum is the first four bytes of the
//! double SHA-256 of the payload, or all zeros once both sides negotiated
//! checksum skipping.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::consensus::{MAX_ADDR_SZ, MAX_HEADERS_RESULTS, MAX_INV_SZ};
use crate::core::core::block::BlockHeader;
use crate::core::core::hash::{sha256d, Hash};
use crate::core::core::inventory::Inv;
use crate::core::ser::{self, read_vec, write_vec, Readable, Reader, Writeable, Writer};
use crate::types::{Error, MAX_LOCATORS};

/// Current latest version of the protocol.
pub const PROTOCOL_VERSION: u32 = 80003;
/// Oldest protocol version we talk to at all.
pub const MIN_PEER_PROTO_VERSION: u32 = 70013;
/// Version from which peers understand sendheaders.
pub const SENDHEADERS_VERSION: u32 = 70012;
/// Our user agent.
pub const USER_AGENT: &str = "/cashnode:0.1.0/";

/// The legacy core network's mainnet magic; peers framing with it are on
/// the wrong network and get banned rather than politely disconnected.
pub const LEGACY_CORE_MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Serialized frame header length.
pub const HEADER_LEN: usize = 24;

/// Upper bound on queued global priority receive messages.
pub const MAX_PRIORITY_RECV_QUEUE: usize = 5;

/// Every command that can appear in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
	Version,
	Verack,
	Xversion,
	Xupdate,
	Ping,
	Pong,
	Addr,
	GetAddr,
	Inv,
	GetData,
	GetHeaders,
	Headers,
	SendHeaders,
	Tx,
	Block,
	Reject,
	FilterLoad,
	FilterAdd,
	FilterClear,
	GetXthin,
	XthinBlock,
	GetThin,
	ThinBlock,
	GetXBlockTx,
	XBlockTx,
	GetGraphene,
	GrapheneBlock,
	GetGrapheneTx,
	GrapheneTx,
	GetGrapheneRecovery,
	GrapheneRecovery,
	SendCmpct,
	CmpctBlock,
	GetBlockTxn,
	BlockTxn,
	XpeditedRequest,
	XpeditedBlock,
	XpeditedTxn,
	GetMempoolSync,
	MempoolSync,
	GetMempoolSyncTx,
	MempoolSyncTx,
	DsProof,
	MerkleBlock,
}

impl Command {
	/// The wire string for this command.
	pub fn as_str(&self) -> &'static str {
		match self {
			Command::Version => "version",
			Command::Verack => "verack",
			Command::Xversion => "extversion",
			Command::Xupdate => "xupdate",
			Command::Ping => "ping",
			Command::Pong => "pong",
			Command::Addr => "addr",
			Command::GetAddr => "getaddr",
			Command::Inv => "inv",
			Command::GetData => "getdata",
			Command::GetHeaders => "getheaders",
			Command::Headers => "headers",
			Command::SendHeaders => "sendheaders",
			Command::Tx => "tx",
			Command::Block => "block",
			Command::Reject => "reject",
			Command::FilterLoad => "filterload",
			Command::FilterAdd => "filteradd",
			Command::FilterClear => "filterclear",
			Command::GetXthin => "get_xthin",
			Command::XthinBlock => "xthinblock",
			Command::GetThin => "get_thin",
			Command::ThinBlock => "thinblock",
			Command::GetXBlockTx => "get_xblocktx",
			Command::XBlockTx => "xblocktx",
			Command::GetGraphene => "get_grblk",
			Command::GrapheneBlock => "grblk",
			Command::GetGrapheneTx => "get_grblktx",
			Command::GrapheneTx => "grblktx",
			Command::GetGrapheneRecovery => "get_grrec",
			Command::GrapheneRecovery => "grrec",
			Command::SendCmpct => "sendcmpct",
			Command::CmpctBlock => "cmpctblock",
			Command::GetBlockTxn => "getblocktxn",
			Command::BlockTxn => "blocktxn",
			Command::XpeditedRequest => "req_xpedited",
			Command::XpeditedBlock => "Xb",
			Command::XpeditedTxn => "Xt",
			Command::GetMempoolSync => "get_mpsync",
			Command::MempoolSync => "mempoolsync",
			Command::GetMempoolSyncTx => "get_mpsynctx",
			Command::MempoolSyncTx => "mpsynctx",
			Command::DsProof => "dsproof",
			Command::MerkleBlock => "merkleblock",
		}
	}

	/// Parse a NUL-padded wire command field.
	pub fn from_bytes(bytes: &[u8; 12]) -> Option<Command> {
		let end = bytes.iter().position(|b| *b == 0).unwrap_or(12);
		let s = std::str::from_utf8(&bytes[..end]).ok()?;
		ALL_COMMANDS.iter().find(|c| c.as_str() == s).copied()
	}

	/// The NUL-padded wire command field.
	pub fn to_bytes(&self) -> [u8; 12] {
		let mut out = [0u8; 12];
		let s = self.as_str().as_bytes();
		out[..s.len()].copy_from_slice(s);
		out
	}

	/// Whether the command rides the priority receive/send tier.
	pub fn is_priority(&self) -> bool {
		match self {
			Command::Headers
			| Command::GrapheneBlock
			| Command::GetGraphene
			| Command::GrapheneTx
			| Command::GetGrapheneTx
			| Command::GetGrapheneRecovery
			| Command::GrapheneRecovery
			| Command::GetXthin
			| Command::GetThin
			| Command::XthinBlock
			| Command::ThinBlock
			| Command::XBlockTx
			| Command::GetXBlockTx
			| Command::XpeditedRequest
			| Command::XpeditedBlock
			| Command::XpeditedTxn
			| Command::CmpctBlock
			| Command::GetBlockTxn
			| Command::BlockTxn
			| Command::Block => true,
			_ => false,
		}
	}

	/// Whether the command belongs to the serialized handshake phase.
	pub fn is_handshake(&self) -> bool {
		match self {
			Command::Version | Command::Verack | Command::Xversion => true,
			_ => false,
		}
	}

	/// Whether the command counts toward a peer's useful-activity bytes
	/// (everything except connection housekeeping).
	pub fn counts_activity(&self) -> bool {
		match self {
			Command::Ping | Command::Pong | Command::Addr | Command::Version | Command::Verack => {
				false
			}
			_ => true,
		}
	}
}

const ALL_COMMANDS: [Command; 44] = [
	Command::Version,
	Command::Verack,
	Command::Xversion,
	Command::Xupdate,
	Command::Ping,
	Command::Pong,
	Command::Addr,
	Command::GetAddr,
	Command::Inv,
	Command::GetData,
	Command::GetHeaders,
	Command::Headers,
	Command::SendHeaders,
	Command::Tx,
	Command::Block,
	Command::Reject,
	Command::FilterLoad,
	Command::FilterAdd,
	Command::FilterClear,
	Command::GetXthin,
	Command::XthinBlock,
	Command::GetThin,
	Command::ThinBlock,
	Command::GetXBlockTx,
	Command::XBlockTx,
	Command::GetGraphene,
	Command::GrapheneBlock,
	Command::GetGrapheneTx,
	Command::GrapheneTx,
	Command::GetGrapheneRecovery,
	Command::GrapheneRecovery,
	Command::SendCmpct,
	Command::CmpctBlock,
	Command::GetBlockTxn,
	Command::BlockTxn,
	Command::XpeditedRequest,
	Command::XpeditedBlock,
	Command::XpeditedTxn,
	Command::GetMempoolSync,
	Command::MempoolSync,
	Command::GetMempoolSyncTx,
	Command::MempoolSyncTx,
	Command::DsProof,
	Command::MerkleBlock,
];

/// The empty payload carried by verack, sendheaders, filterclear and
/// friends.
pub struct Empty;

impl Writeable for Empty {
	fn write<W: Writer>(&self, _writer: &mut W) -> Result<(), ser::Error> {
		Ok(())
	}
}

impl Readable for Empty {
	fn read<R: Reader>(_reader: &mut R) -> Result<Empty, ser::Error> {
		Ok(Empty)
	}
}

/// Header of any protocol message, used to identify incoming messages.
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
	/// Network magic.
	pub magic: [u8; 4],
	/// NUL-padded command.
	pub command: [u8; 12],
	/// Payload byte length.
	pub msg_len: u32,
	/// Payload checksum (or zeros when skipped).
	pub checksum: [u8; 4],
}

impl Writeable for MsgHeader {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_fixed_bytes(&self.magic)?;
		writer.write_fixed_bytes(&self.command)?;
		writer.write_u32(self.msg_len)?;
		writer.write_fixed_bytes(&self.checksum)
	}
}

impl Readable for MsgHeader {
	fn read<R: Reader>(reader: &mut R) -> Result<MsgHeader, ser::Error> {
		let magic_v = reader.read_fixed_bytes(4)?;
		let command_v = reader.read_fixed_bytes(12)?;
		let msg_len = reader.read_u32()?;
		let checksum_v = reader.read_fixed_bytes(4)?;
		let mut magic = [0u8; 4];
		magic.copy_from_slice(&magic_v);
		let mut command = [0u8; 12];
		command.copy_from_slice(&command_v);
		let mut checksum = [0u8; 4];
		checksum.copy_from_slice(&checksum_v);
		Ok(MsgHeader {
			magic,
			command,
			msg_len,
			checksum,
		})
	}
}

/// Serialize a complete frame for the given command and payload.
/// `zero_checksum` replaces the checksum with zeros, as negotiated via the
/// extended-version map.
pub fn build_frame(
	magic: [u8; 4],
	command: Command,
	payload: &[u8],
	zero_checksum: bool,
) -> Result<Vec<u8>, Error> {
	let checksum = if zero_checksum {
		[0u8; 4]
	} else {
		let digest = sha256d(payload);
		let mut c = [0u8; 4];
		c.copy_from_slice(&digest.as_bytes()[0..4]);
		c
	};
	let header = MsgHeader {
		magic,
		command: command.to_bytes(),
		msg_len: payload.len() as u32,
		checksum,
	};
	let mut frame = ser::ser_vec(&header)?;
	frame.extend_from_slice(payload);
	Ok(frame)
}

/// Verify a payload against the frame checksum. A zero checksum passes
/// only when both sides negotiated `ignore_checksum`.
pub fn verify_checksum(header: &MsgHeader, payload: &[u8], ignore_negotiated: bool) -> bool {
	if header.checksum == [0u8; 4] {
		return ignore_negotiated;
	}
	let digest = sha256d(payload);
	digest.as_bytes()[0..4] == header.checksum
}

/// A network address as carried in version and addr messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
	/// Advertised services.
	pub services: u64,
	/// IP address.
	pub ip: IpAddr,
	/// Port, big-endian on the wire.
	pub port: u16,
}

impl NetAddress {
	/// From a socket address with the given services.
	pub fn from_socket(addr: SocketAddr, services: u64) -> NetAddress {
		NetAddress {
			services,
			ip: addr.ip(),
			port: addr.port(),
		}
	}

	/// As a socket address.
	pub fn socket(&self) -> SocketAddr {
		SocketAddr::new(self.ip, self.port)
	}
}

impl Writeable for NetAddress {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u64(self.services)?;
		let v6 = match self.ip {
			IpAddr::V4(v4) => v4.to_ipv6_mapped(),
			IpAddr::V6(v6) => v6,
		};
		writer.write_fixed_bytes(&v6.octets())?;
		// port is serialized big-endian, unlike everything else
		writer.write_u8((self.port >> 8) as u8)?;
		writer.write_u8((self.port & 0xff) as u8)
	}
}

impl Readable for NetAddress {
	fn read<R: Reader>(reader: &mut R) -> Result<NetAddress, ser::Error> {
		let services = reader.read_u64()?;
		let octets = reader.read_fixed_bytes(16)?;
		let mut raw = [0u8; 16];
		raw.copy_from_slice(&octets);
		let v6 = Ipv6Addr::from(raw);
		let ip = match v6.to_ipv4() {
			Some(v4) if v6.octets()[..10].iter().all(|b| *b == 0) => IpAddr::V4(v4),
			_ => IpAddr::V6(v6),
		};
		let hi = reader.read_u8()? as u16;
		let lo = reader.read_u8()? as u16;
		Ok(NetAddress {
			services,
			ip,
			port: (hi << 8) | lo,
		})
	}
}

/// An address plus the last time it was seen, as relayed in addr messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedNetAddress {
	/// Last-seen time, epoch seconds.
	pub time: u32,
	/// The address.
	pub addr: NetAddress,
}

impl Writeable for TimedNetAddress {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u32(self.time)?;
		self.addr.write(writer)
	}
}

impl Readable for TimedNetAddress {
	fn read<R: Reader>(reader: &mut R) -> Result<TimedNetAddress, ser::Error> {
		Ok(TimedNetAddress {
			time: reader.read_u32()?,
			addr: NetAddress::read(reader)?,
		})
	}
}

/// First message of the handshake, sender advertises its version and
/// characteristics.
#[derive(Debug, Clone)]
pub struct Version {
	/// Protocol version of the sender.
	pub version: u32,
	/// Advertised services.
	pub services: u64,
	/// Sender's wall clock.
	pub timestamp: i64,
	/// The address the sender sees for us.
	pub addr_you: NetAddress,
	/// The sender's own address.
	pub addr_me: NetAddress,
	/// Randomly generated for each handshake, detects self-connections.
	pub nonce: u64,
	/// Name and version of the software.
	pub user_agent: String,
	/// Height of the sender's best chain.
	pub start_height: i32,
	/// Whether the sender wants txn relay before a filter is set.
	pub relay: bool,
}

impl Writeable for Version {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u32(self.version)?;
		writer.write_u64(self.services)?;
		writer.write_i64(self.timestamp)?;
		self.addr_you.write(writer)?;
		self.addr_me.write(writer)?;
		writer.write_u64(self.nonce)?;
		self.user_agent.write(writer)?;
		writer.write_i32(self.start_height)?;
		writer.write_u8(self.relay as u8)
	}
}

impl Readable for Version {
	fn read<R: Reader>(reader: &mut R) -> Result<Version, ser::Error> {
		Ok(Version {
			version: reader.read_u32()?,
			services: reader.read_u64()?,
			timestamp: reader.read_i64()?,
			addr_you: NetAddress::read(reader)?,
			addr_me: NetAddress::read(reader)?,
			nonce: reader.read_u64()?,
			user_agent: String::read(reader)?,
			start_height: reader.read_i32()?,
			relay: reader.read_u8()? != 0,
		})
	}
}

/// Ping and pong carry a nonce to pair them up.
#[derive(Debug, Clone, Copy)]
pub struct PingPong {
	/// Random nonce echoed by the pong.
	pub nonce: u64,
}

impl Writeable for PingPong {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u64(self.nonce)
	}
}

impl Readable for PingPong {
	fn read<R: Reader>(reader: &mut R) -> Result<PingPong, ser::Error> {
		Ok(PingPong {
			nonce: reader.read_u64()?,
		})
	}
}

/// A batch of relayed addresses.
#[derive(Debug, Clone)]
pub struct AddrMsg {
	/// The addresses.
	pub addrs: Vec<TimedNetAddress>,
}

impl Writeable for AddrMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		write_vec(writer, &self.addrs)
	}
}

impl Readable for AddrMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<AddrMsg, ser::Error> {
		Ok(AddrMsg {
			addrs: read_vec(reader, MAX_ADDR_SZ as u64)?,
		})
	}
}

/// An inventory announcement or request.
#[derive(Debug, Clone)]
pub struct InvMsg {
	/// The inventory items.
	pub invs: Vec<Inv>,
}

impl Writeable for InvMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		write_vec(writer, &self.invs)
	}
}

impl Readable for InvMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<InvMsg, ser::Error> {
		Ok(InvMsg {
			invs: read_vec(reader, MAX_INV_SZ as u64)?,
		})
	}
}

/// Request for headers following a locator.
#[derive(Debug, Clone)]
pub struct GetHeaders {
	/// Sender protocol version.
	pub version: u32,
	/// Block locator, densest near the tip.
	pub locator: Vec<Hash>,
	/// Stop hash, zero for as-many-as-allowed.
	pub stop: Hash,
}

impl Writeable for GetHeaders {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u32(self.version)?;
		write_vec(writer, &self.locator)?;
		self.stop.write(writer)
	}
}

impl Readable for GetHeaders {
	fn read<R: Reader>(reader: &mut R) -> Result<GetHeaders, ser::Error> {
		Ok(GetHeaders {
			version: reader.read_u32()?,
			locator: read_vec(reader, MAX_LOCATORS as u64)?,
			stop: Hash::read(reader)?,
		})
	}
}

/// A batch of headers. Each header carries a trailing zero txn count on
/// the wire for historical reasons.
#[derive(Debug, Clone)]
pub struct HeadersMsg {
	/// The headers, oldest first.
	pub headers: Vec<BlockHeader>,
}

impl Writeable for HeadersMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_var_int(self.headers.len() as u64)?;
		for h in &self.headers {
			h.write(writer)?;
			writer.write_var_int(0)?;
		}
		Ok(())
	}
}

impl Readable for HeadersMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<HeadersMsg, ser::Error> {
		let len = reader.read_var_int()?;
		if len > MAX_HEADERS_RESULTS as u64 {
			return Err(ser::Error::TooLargeRead(len));
		}
		let mut headers = Vec::with_capacity(len as usize);
		for _ in 0..len {
			headers.push(BlockHeader::read(reader)?);
			let _ = reader.read_var_int()?;
		}
		Ok(HeadersMsg { headers })
	}
}

/// Tells a peer why its message or object was rejected.
#[derive(Debug, Clone)]
pub struct RejectMsg {
	/// The command being rejected.
	pub message: String,
	/// Reject code.
	pub code: u8,
	/// Human-readable reason.
	pub reason: String,
	/// Hash of the rejected object, when one exists.
	pub hash: Option<Hash>,
}

impl Writeable for RejectMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.message.write(writer)?;
		writer.write_u8(self.code)?;
		self.reason.write(writer)?;
		if let Some(h) = self.hash {
			h.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for RejectMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<RejectMsg, ser::Error> {
		let message = String::read(reader)?;
		let code = reader.read_u8()?;
		let reason = String::read(reader)?;
		// trailing hash present for object-level rejections
		let hash = match message.as_str() {
			"tx" | "block" => Some(Hash::read(reader)?),
			_ => None,
		};
		Ok(RejectMsg {
			message,
			code,
			reason,
			hash,
		})
	}
}

/// Compact-block mode announcement.
#[derive(Debug, Clone, Copy)]
pub struct SendCmpctMsg {
	/// Whether blocks should be announced as cmpctblock.
	pub announce: bool,
	/// Compact-block protocol version.
	pub version: u64,
}

impl Writeable for SendCmpctMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u8(self.announce as u8)?;
		writer.write_u64(self.version)
	}
}

impl Readable for SendCmpctMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<SendCmpctMsg, ser::Error> {
		Ok(SendCmpctMsg {
			announce: reader.read_u8()? != 0,
			version: reader.read_u64()?,
		})
	}
}

/// A bloom-filtered block for SPV peers: the header, the total
/// transaction count, and the txids matching the peer's filter. The
/// matching transactions follow as individual tx messages.
#[derive(Debug, Clone)]
pub struct MerkleBlockMsg {
	/// Block header.
	pub header: BlockHeader,
	/// Transactions in the full block.
	pub total_txs: u64,
	/// Txids matching the requester's filter, block order.
	pub matched: Vec<Hash>,
}

impl Writeable for MerkleBlockMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		self.header.write(writer)?;
		writer.write_u64(self.total_txs)?;
		write_vec(writer, &self.matched)
	}
}

impl Readable for MerkleBlockMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<MerkleBlockMsg, ser::Error> {
		Ok(MerkleBlockMsg {
			header: BlockHeader::read(reader)?,
			total_txs: reader.read_u64()?,
			matched: read_vec(reader, MAX_INV_SZ as u64)?,
		})
	}
}

/// An expedited block: pushed out-of-band to subscribed peers, with a
/// hop count bounding the forwarding depth.
#[derive(Debug, Clone)]
pub struct XpeditedBlockMsg {
	/// Hops travelled so far.
	pub hops: u8,
	/// The block.
	pub block: crate::core::core::block::Block,
}

impl Writeable for XpeditedBlockMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_u8(self.hops)?;
		self.block.write(writer)
	}
}

impl Readable for XpeditedBlockMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<XpeditedBlockMsg, ser::Error> {
		Ok(XpeditedBlockMsg {
			hops: reader.read_u8()?,
			block: crate::core::core::block::Block::read(reader)?,
		})
	}
}

/// SPV bloom filter installation.
#[derive(Debug, Clone)]
pub struct FilterLoadMsg {
	/// The filter bits.
	pub data: Vec<u8>,
	/// Number of hash functions.
	pub n_hash_funcs: u32,
	/// Random tweak folded into each hash.
	pub tweak: u32,
	/// Update flags.
	pub flags: u8,
}

impl Writeable for FilterLoadMsg {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ser::Error> {
		writer.write_bytes(&self.data)?;
		writer.write_u32(self.n_hash_funcs)?;
		writer.write_u32(self.tweak)?;
		writer.write_u8(self.flags)
	}
}

impl Readable for FilterLoadMsg {
	fn read<R: Reader>(reader: &mut R) -> Result<FilterLoadMsg, ser::Error> {
		Ok(FilterLoadMsg {
			data: reader.read_bytes()?,
			n_hash_funcs: reader.read_u32()?,
			tweak: reader.read_u32()?,
			flags: reader.read_u8()?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::ser::{deserialize, ser_vec};

	#[test]
	fn command_round_trip() {
		for cmd in ALL_COMMANDS.iter() {
			let bytes = cmd.to_bytes();
			assert_eq!(Command::from_bytes(&bytes), Some(*cmd));
		}
		assert_eq!(Command::from_bytes(&[0xffu8; 12]), None);
	}

	#[test]
	fn frame_checksum_round_trip() {
		let payload = b"some payload".to_vec();
		let frame = build_frame([0xe3, 0xe1, 0xf3, 0xe8], Command::Ping, &payload, false).unwrap();
		assert_eq!(frame.len(), HEADER_LEN + payload.len());

		let header: MsgHeader = deserialize(&mut &frame[..HEADER_LEN]).unwrap();
		assert_eq!(header.msg_len as usize, payload.len());
		assert_eq!(Command::from_bytes(&header.command), Some(Command::Ping));
		assert!(verify_checksum(&header, &payload, false));
		assert!(!verify_checksum(&header, b"other payload", false));

		// checksum equals the first four bytes of sha256d(payload)
		let digest = sha256d(&payload);
		assert_eq!(&header.checksum, &digest.as_bytes()[0..4]);
	}

	#[test]
	fn zero_checksum_needs_negotiation() {
		let payload = b"payload".to_vec();
		let frame = build_frame([0xe3, 0xe1, 0xf3, 0xe8], Command::Ping, &payload, true).unwrap();
		let header: MsgHeader = deserialize(&mut &frame[..HEADER_LEN]).unwrap();
		assert_eq!(header.checksum, [0u8; 4]);
		assert!(verify_checksum(&header, &payload, true));
		assert!(!verify_checksum(&header, &payload, false));
	}

	#[test]
	fn version_round_trip() {
		let v = Version {
			version: PROTOCOL_VERSION,
			services: crate::types::Capabilities::all().bits(),
			timestamp: 1_555_555_555,
			addr_you: NetAddress {
				services: 1,
				ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
				port: 8333,
			},
			addr_me: NetAddress {
				services: 1,
				ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
				port: 8334,
			},
			nonce: 0xdead_beef,
			user_agent: USER_AGENT.to_string(),
			start_height: 600_000,
			relay: true,
		};
		let bytes = ser_vec(&v).unwrap();
		let v2: Version = deserialize(&mut &bytes[..]).unwrap();
		assert_eq!(v2.version, v.version);
		assert_eq!(v2.addr_you, v.addr_you);
		assert_eq!(v2.addr_me, v.addr_me);
		assert_eq!(v2.user_agent, v.user_agent);
		assert_eq!(v2.relay, true);
	}
}
