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

//! Send-queue prioritization as observed through a peer's public
//! surface: priority requests jump ordinary traffic but never preempt a
//! partially transmitted frame.

use cashnode_core::core::hash::sha256d;
use cashnode_core::core::inventory::{Inv, InvType};
use cashnode_p2p::msg::{Command, InvMsg, HEADER_LEN};
use cashnode_p2p::peer::Peer;
use cashnode_p2p::types::Direction;
use cashnode_core::ser::deserialize;

const MAGIC: [u8; 4] = [0xe3, 0xe1, 0xf3, 0xe8];

fn test_peer() -> Peer {
	Peer::new(
		1,
		"127.0.0.1:8333".parse().unwrap(),
		Direction::Outbound,
		MAGIC,
		2_000_000,
		0,
	)
}

fn getdata(peer: &Peer, hash_seed: &[u8]) -> Inv {
	let inv = Inv::new(InvType::Tx, sha256d(hash_seed));
	peer.send_msg(Command::GetData, &InvMsg { invs: vec![inv] })
		.unwrap();
	inv
}

fn get_graphene(peer: &Peer, hash_seed: &[u8]) -> Inv {
	let inv = Inv::new(InvType::GrapheneBlock, sha256d(hash_seed));
	peer.send_msg(Command::GetGraphene, &InvMsg { invs: vec![inv] })
		.unwrap();
	inv
}

// Pull the inv hash back out of a queued frame to identify it.
fn frame_hash(frame: &[u8]) -> cashnode_core::core::hash::Hash {
	let inv_msg: InvMsg = deserialize(&mut &frame[HEADER_LEN..]).unwrap();
	inv_msg.invs[0].hash
}

fn queue_order(peer: &Peer) -> Vec<cashnode_core::core::hash::Hash> {
	peer.send_queue
		.lock()
		.frames()
		.iter()
		.map(|f| frame_hash(f))
		.collect()
}

#[test]
fn priority_insert_ahead_of_whole_queue() {
	let peer = test_peer();

	let h1 = getdata(&peer, b"h1");
	let h2 = getdata(&peer, b"h2");
	let h3 = getdata(&peer, b"h3");

	// a priority request jumps everything that has not started sending
	let h4 = get_graphene(&peer, b"h4");
	assert_eq!(queue_order(&peer), vec![h4.hash, h1.hash, h2.hash, h3.hash]);

	// a second priority request lines up behind the first
	let h5 = get_graphene(&peer, b"h5");
	assert_eq!(
		queue_order(&peer),
		vec![h4.hash, h5.hash, h1.hash, h2.hash, h3.hash]
	);

	// ordinary traffic still appends at the back
	let h7 = getdata(&peer, b"h7");
	assert_eq!(
		queue_order(&peer),
		vec![h4.hash, h5.hash, h1.hash, h2.hash, h3.hash, h7.hash]
	);

	// and the next priority request slots after the existing priority run
	let h8 = get_graphene(&peer, b"h8");
	assert_eq!(
		queue_order(&peer),
		vec![h4.hash, h5.hash, h8.hash, h1.hash, h2.hash, h3.hash, h7.hash]
	);
}

#[test]
fn priority_insert_respects_partial_send() {
	let peer = test_peer();

	let h1 = getdata(&peer, b"h1");
	let h2 = getdata(&peer, b"h2");
	let h3 = getdata(&peer, b"h3");

	// one byte of h1 is already on the wire
	assert!(!peer.send_queue.lock().advance(1));

	// the priority message cannot preempt the partially sent frame
	let h4 = get_graphene(&peer, b"h4");
	assert_eq!(queue_order(&peer), vec![h1.hash, h4.hash, h2.hash, h3.hash]);
}
