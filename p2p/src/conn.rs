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

//! Per-peer connection state that does not touch the socket itself: the
//! two-tier send queue with its partial-send-aware priority insertion, and
//! the incremental receive parser that frames inbound bytes into messages.

use std::collections::VecDeque;

use crate::core::ser::{self, deserialize};
use crate::msg::{Command, MsgHeader, HEADER_LEN};
use crate::types::Error;

/// A message queued for sending, framed and ready for the wire.
#[derive(Debug)]
struct QueuedMessage {
	priority: bool,
	data: Vec<u8>,
}

/// The ordered send state of one peer. Priority messages are inserted
/// after every priority message already queued, and behind the head
/// message when it is mid-transmission; a partially sent frame is never
/// preempted. A separate low-priority deque feeds the main queue one
/// message at a time when it would otherwise drain.
pub struct SendQueue {
	queue: VecDeque<QueuedMessage>,
	low_priority: VecDeque<Vec<u8>>,
	/// Total bytes buffered across both tiers.
	send_size: usize,
	/// Bytes of the head message already handed to the socket.
	pub send_offset: usize,
}

impl SendQueue {
	/// A new empty queue.
	pub fn new() -> SendQueue {
		SendQueue {
			queue: VecDeque::new(),
			low_priority: VecDeque::new(),
			send_size: 0,
			send_offset: 0,
		}
	}

	/// Queue a framed message on the main tier. Priority messages jump
	/// ahead of every ordinary message that has not started transmitting.
	pub fn push(&mut self, data: Vec<u8>, priority: bool) {
		self.send_size += data.len();
		if !priority {
			self.queue.push_back(QueuedMessage { priority, data });
			return;
		}

		// never insert in front of a partially sent head
		let mut idx = if self.send_offset > 0 && !self.queue.is_empty() {
			1
		} else {
			0
		};
		while idx < self.queue.len() && self.queue[idx].priority {
			idx += 1;
		}
		self.queue.insert(idx, QueuedMessage { priority, data });
	}

	/// Queue a framed message on the low-priority tier.
	pub fn push_low_priority(&mut self, data: Vec<u8>) {
		self.send_size += data.len();
		self.low_priority.push_back(data);
	}

	/// Move one low-priority message onto the main tier if it would
	/// otherwise run dry.
	pub fn promote_one(&mut self) {
		if self.queue.is_empty() {
			if let Some(data) = self.low_priority.pop_front() {
				self.queue.push_back(QueuedMessage {
					priority: false,
					data,
				});
			}
		}
	}

	/// The unsent remainder of the head message, if any.
	pub fn front_remaining(&self) -> Option<&[u8]> {
		self.queue.front().map(|m| &m.data[self.send_offset..])
	}

	/// Record `n` bytes of the head message as transmitted. Returns true
	/// when that completed the message (which is then dropped).
	pub fn advance(&mut self, n: usize) -> bool {
		let done = {
			let head = match self.queue.front() {
				Some(m) => m,
				None => return false,
			};
			self.send_offset + n >= head.data.len()
		};
		self.send_size = self.send_size.saturating_sub(n);
		if done {
			self.queue.pop_front();
			self.send_offset = 0;
		} else {
			self.send_offset += n;
		}
		done
	}

	/// Whether a priority message sits within the first two queue slots
	/// (the head may be a partially sent ordinary frame shielding one).
	pub fn priority_pending(&self) -> bool {
		self.queue.iter().take(2).any(|m| m.priority)
	}

	/// Whether both tiers are empty.
	pub fn is_empty(&self) -> bool {
		self.queue.is_empty() && self.low_priority.is_empty()
	}

	/// Number of messages waiting on the main tier.
	pub fn len(&self) -> usize {
		self.queue.len()
	}

	/// Total buffered bytes not yet handed to the socket.
	pub fn total_size(&self) -> usize {
		self.send_size
	}

	/// The queued frames of the main tier, in send order. For tests and
	/// operator introspection.
	pub fn frames(&self) -> Vec<&[u8]> {
		self.queue.iter().map(|m| &m.data[..]).collect()
	}
}

/// A fully framed inbound message.
#[derive(Debug, Clone)]
pub struct NetMessage {
	/// The decoded command, None for unknown commands.
	pub command: Option<Command>,
	/// The raw command field, for logging unknown commands.
	pub raw_command: [u8; 12],
	/// The message payload.
	pub payload: Vec<u8>,
	/// Total frame size including the header.
	pub frame_size: u64,
}

/// Incremental parser assembling inbound bytes into messages: header
/// first, then the declared payload. Oversized declarations and magic or
/// checksum mismatches surface as errors that disconnect the peer.
pub struct RecvParser {
	magic: [u8; 4],
	max_message_size: u64,
	/// Set once both sides negotiated checksum skipping.
	pub ignore_checksum: bool,
	buf: Vec<u8>,
	header: Option<MsgHeader>,
}

impl RecvParser {
	/// Parser for a connection using the given magic and message cap.
	pub fn new(magic: [u8; 4], max_message_size: u64) -> RecvParser {
		RecvParser {
			magic,
			max_message_size,
			ignore_checksum: false,
			buf: Vec::new(),
			header: None,
		}
	}

	/// Size of the message currently being assembled, zero between
	/// messages.
	pub fn current_recv_msg_size(&self) -> u64 {
		self.header.map(|h| h.msg_len as u64).unwrap_or(0)
	}

	/// Feed raw bytes; complete messages are appended to `out`.
	pub fn feed(&mut self, data: &[u8], out: &mut Vec<NetMessage>) -> Result<(), Error> {
		self.buf.extend_from_slice(data);

		loop {
			if self.header.is_none() {
				if self.buf.len() < HEADER_LEN {
					return Ok(());
				}
				let header: MsgHeader =
					deserialize(&mut &self.buf[..HEADER_LEN]).map_err(Error::Serialization)?;

				if header.magic != self.magic {
					return Err(Error::BadMagic {
						legacy_core: header.magic == crate::msg::LEGACY_CORE_MAGIC,
					});
				}
				if header.msg_len as u64 > self.max_message_size {
					return Err(Error::OversizedMessage(header.msg_len as u64));
				}
				self.buf.drain(..HEADER_LEN);
				self.header = Some(header);
			}

			let header = match self.header {
				Some(h) => h,
				None => return Ok(()),
			};
			if self.buf.len() < header.msg_len as usize {
				return Ok(());
			}

			let payload: Vec<u8> = self.buf.drain(..header.msg_len as usize).collect();
			self.header = None;

			if !crate::msg::verify_checksum(&header, &payload, self.ignore_checksum) {
				return Err(Error::BadChecksum);
			}

			out.push(NetMessage {
				command: Command::from_bytes(&header.command),
				raw_command: header.command,
				payload,
				frame_size: HEADER_LEN as u64 + header.msg_len as u64,
			});
		}
	}
}

/// Helper to decode a payload into a typed message, mapping decode
/// failures onto the serialization error the dispatcher folds into its
/// misbehave-or-ignore policy.
pub fn decode_payload<T: ser::Readable>(msg: &NetMessage) -> Result<T, Error> {
	deserialize(&mut &msg.payload[..]).map_err(Error::Serialization)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::msg::build_frame;

	const MAGIC: [u8; 4] = [0xe3, 0xe1, 0xf3, 0xe8];

	fn frame(cmd: Command, body: &[u8]) -> Vec<u8> {
		build_frame(MAGIC, cmd, body, false).unwrap()
	}

	#[test]
	fn parser_reassembles_split_frames() {
		let mut parser = RecvParser::new(MAGIC, 1_000_000);
		let f1 = frame(Command::Ping, &[1, 2, 3, 4, 5, 6, 7, 8]);
		let f2 = frame(Command::Pong, &[8, 7, 6, 5, 4, 3, 2, 1]);
		let mut all = f1.clone();
		all.extend_from_slice(&f2);

		let mut out = vec![];
		// drip-feed one byte at a time
		for b in &all {
			parser.feed(&[*b], &mut out).unwrap();
		}
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].command, Some(Command::Ping));
		assert_eq!(out[1].command, Some(Command::Pong));
		assert_eq!(out[0].payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
	}

	#[test]
	fn parser_rejects_bad_magic() {
		let mut parser = RecvParser::new(MAGIC, 1_000_000);
		let f = build_frame([1, 2, 3, 4], Command::Ping, &[0; 8], false).unwrap();
		let mut out = vec![];
		assert!(matches!(
			parser.feed(&f, &mut out),
			Err(Error::BadMagic { legacy_core: false })
		));

		let mut parser = RecvParser::new(MAGIC, 1_000_000);
		let f = build_frame(crate::msg::LEGACY_CORE_MAGIC, Command::Ping, &[0; 8], false).unwrap();
		assert!(matches!(
			parser.feed(&f, &mut out),
			Err(Error::BadMagic { legacy_core: true })
		));
	}

	#[test]
	fn parser_rejects_oversize_and_bad_checksum() {
		let mut parser = RecvParser::new(MAGIC, 100);
		let f = frame(Command::Tx, &[0u8; 101]);
		let mut out = vec![];
		assert!(matches!(
			parser.feed(&f, &mut out),
			Err(Error::OversizedMessage(101))
		));

		let mut parser = RecvParser::new(MAGIC, 1_000_000);
		let mut f = frame(Command::Tx, &[0u8; 16]);
		let last = f.len() - 1;
		f[last] ^= 0xff; // corrupt the payload
		assert!(matches!(parser.feed(&f, &mut out), Err(Error::BadChecksum)));
	}

	#[test]
	fn zero_checksum_accepted_only_when_negotiated() {
		let f = build_frame(MAGIC, Command::Tx, &[9u8; 4], true).unwrap();
		let mut out = vec![];

		let mut parser = RecvParser::new(MAGIC, 1_000_000);
		assert!(matches!(parser.feed(&f, &mut out), Err(Error::BadChecksum)));

		let mut parser = RecvParser::new(MAGIC, 1_000_000);
		parser.ignore_checksum = true;
		parser.feed(&f, &mut out).unwrap();
		assert_eq!(out.len(), 1);
	}

	#[test]
	fn send_queue_priority_ordering_fresh_head() {
		// head not partially sent: priority jumps the whole queue
		let mut q = SendQueue::new();
		let (h1, h2, h3) = (frame(Command::Tx, b"h1"), frame(Command::Tx, b"h2"), frame(Command::Tx, b"h3"));
		let h4 = frame(Command::GetGraphene, b"h4");
		let h5 = frame(Command::GetGraphene, b"h5");
		let h7 = frame(Command::Tx, b"h7");
		let h8 = frame(Command::GetGraphene, b"h8");

		q.push(h1.clone(), false);
		q.push(h2.clone(), false);
		q.push(h3.clone(), false);
		q.push(h4.clone(), true);
		assert_eq!(q.frames(), vec![&h4[..], &h1[..], &h2[..], &h3[..]]);

		q.push(h5.clone(), true);
		assert_eq!(q.frames(), vec![&h4[..], &h5[..], &h1[..], &h2[..], &h3[..]]);

		q.push(h7.clone(), false);
		assert_eq!(
			q.frames(),
			vec![&h4[..], &h5[..], &h1[..], &h2[..], &h3[..], &h7[..]]
		);

		q.push(h8.clone(), true);
		assert_eq!(
			q.frames(),
			vec![&h4[..], &h5[..], &h8[..], &h1[..], &h2[..], &h3[..], &h7[..]]
		);
	}

	#[test]
	fn send_queue_priority_ordering_partial_head() {
		// the head message is mid-transmission and cannot be preempted
		let mut q = SendQueue::new();
		let (h1, h2, h3) = (frame(Command::Tx, b"h1"), frame(Command::Tx, b"h2"), frame(Command::Tx, b"h3"));
		let h4 = frame(Command::GetGraphene, b"h4");

		q.push(h1.clone(), false);
		q.push(h2.clone(), false);
		q.push(h3.clone(), false);
		assert!(!q.advance(1));
		assert_eq!(q.send_offset, 1);

		q.push(h4.clone(), true);
		assert_eq!(q.frames(), vec![&h1[..], &h4[..], &h2[..], &h3[..]]);
	}

	#[test]
	fn send_queue_advance_and_promote() {
		let mut q = SendQueue::new();
		let h1 = frame(Command::Tx, b"data1");
		let low = frame(Command::Addr, b"lowpri");
		q.push(h1.clone(), false);
		q.push_low_priority(low.clone());

		// transmit h1 in two chunks
		let first_half = h1.len() / 2;
		assert!(!q.advance(first_half));
		assert!(q.advance(h1.len() - first_half));

		// main tier drained, promotion feeds one low-priority message
		assert_eq!(q.len(), 0);
		q.promote_one();
		assert_eq!(q.frames(), vec![&low[..]]);
		assert!(q.advance(low.len()));
		assert!(q.is_empty());
		assert_eq!(q.total_size(), 0);
	}
}
