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

//! Block transaction ordering: the lexical sort and the topo-canonical
//! sort. Both leave the coinbase pinned at index 0 and produce the same
//! output for any permutation of the same transaction set.

use std::collections::HashMap;

use crate::core::hash::Hash;
use crate::core::transaction::TxRef;

/// Sort all transactions but the coinbase by ascending txid.
pub fn lexical_sort(txs: &mut [TxRef]) {
	if txs.len() <= 1 {
		return;
	}
	txs[1..].sort_by_cached_key(|tx| tx.txid());
}

/// Topo-canonical sort: every in-block dependency precedes its dependants,
/// the coinbase stays at index 0 and the output is deterministic for a
/// given transaction set whatever order it arrives in.
///
/// The transaction set must form a DAG through its in-block spends; a cycle
/// leaves the cyclic remainder in arrival order.
pub fn topo_canonical_sort(txs: &mut Vec<TxRef>) {
	let n = txs.len();
	if n <= 1 {
		return;
	}

	// pin the coinbase at index 0 before positions are recorded
	if let Some(cb) = txs.iter().position(|tx| tx.is_coinbase()) {
		txs.swap(0, cb);
	}

	let txids: Vec<Hash> = txs.iter().map(|tx| tx.txid()).collect();
	let mut pos: HashMap<Hash, usize> = HashMap::with_capacity(n * 2);
	for (i, txid) in txids.iter().enumerate() {
		pos.insert(*txid, i);
	}

	// incoming[i] counts in-block spenders of transaction i
	let mut incoming = vec![0u32; n];
	for tx in txs.iter() {
		for input in &tx.inputs {
			if let Some(&p) = pos.get(&input.prevout.hash) {
				incoming[p] += 1;
			}
		}
	}

	let mut todo: Vec<usize> = (0..n).filter(|i| incoming[*i] == 0).collect();

	// A fixed order flows from this fixed initial sorted todo list; the
	// dependency edges do the rest. Skip the coinbase at todo[0].
	if todo.len() > 1 {
		todo[1..].sort_by(|a, b| txids[*b].cmp(&txids[*a]));
	}

	// Kahn's walk, filling the output back to front so dependencies land
	// in front of their dependants.
	let mut out: Vec<Option<TxRef>> = vec![None; n];
	out[0] = Some(txs[0].clone());
	let mut i = n - 1;
	let mut j = 1;
	while j < n {
		if j >= todo.len() {
			warn!("topo_canonical_sort: dependency cycle, leaving remainder unsorted");
			break;
		}
		let t = todo[j];
		j += 1;
		out[i] = Some(txs[t].clone());
		i -= 1;
		for input in &txs[t].inputs {
			if let Some(&p) = pos.get(&input.prevout.hash) {
				incoming[p] -= 1;
				if incoming[p] == 0 {
					todo.push(p);
				}
			}
		}
	}

	// On the DAG contract every slot is filled; a cycle leaves holes that
	// get the unplaced transactions in arrival order.
	let placed: Vec<bool> = {
		let mut seen = vec![false; n];
		seen[0] = true;
		for t in todo.iter().take(j).skip(1) {
			seen[*t] = true;
		}
		seen
	};
	let mut leftovers = (0..n).filter(|k| !placed[*k]);
	for slot in out.iter_mut() {
		if slot.is_none() {
			let k = leftovers.next().expect("as many holes as leftovers");
			*slot = Some(txs[k].clone());
		}
	}

	for (k, slot) in out.into_iter().enumerate() {
		txs[k] = slot.expect("every output slot filled");
	}
}

/// Whether the transaction vector is in a valid topological order: no
/// duplicates and no transaction spending an output of a later-indexed
/// transaction in the same block.
pub fn is_topological(txs: &[TxRef]) -> bool {
	let mut txn_pos: HashMap<Hash, usize> = HashMap::with_capacity(txs.len() * 2);
	for (i, tx) in txs.iter().enumerate() {
		let txid = tx.txid();
		if txn_pos.contains_key(&txid) {
			// also reject on duplicates
			return false;
		}
		txn_pos.insert(txid, i);
	}

	for (i, tx) in txs.iter().enumerate() {
		for input in &tx.inputs {
			if let Some(&p) = txn_pos.get(&input.prevout.hash) {
				if p >= i {
					return false;
				}
			}
		}
	}
	true
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::transaction::{OutPoint, Transaction, TxIn, TxOut};
	use crate::core::hash::sha256d;
	use rand::prelude::*;
	use rand::SeedableRng;
	use std::sync::Arc;

	fn coinbase() -> TxRef {
		Arc::new(Transaction {
			version: 1,
			inputs: vec![TxIn {
				prevout: OutPoint::null(),
				script_sig: vec![0x00],
				sequence: 0xffff_ffff,
			}],
			outputs: vec![TxOut {
				value: 50_0000_0000,
				script_pubkey: vec![],
			}],
			lock_time: 0,
		})
	}

	// A txn spending one unique synthetic outpoint (so txids differ) plus
	// one output of each listed in-block parent.
	fn tx_spending(seed: u64, parents: &[&TxRef]) -> TxRef {
		let mut inputs = vec![TxIn {
			prevout: OutPoint {
				hash: sha256d(&seed.to_le_bytes()),
				n: 0,
			},
			script_sig: vec![],
			sequence: 0xffff_ffff,
		}];
		for parent in parents {
			inputs.push(TxIn {
				prevout: OutPoint {
					hash: parent.txid(),
					n: 0,
				},
				script_sig: vec![],
				sequence: 0xffff_ffff,
			});
		}
		Arc::new(Transaction {
			version: 1,
			inputs,
			outputs: vec![TxOut {
				value: 1,
				script_pubkey: vec![],
			}],
			lock_time: 0,
		})
	}

	#[test]
	fn lexical_pins_coinbase() {
		let cb = coinbase();
		let a = tx_spending(1, &[]);
		let b = tx_spending(2, &[]);
		let c = tx_spending(3, &[]);
		let mut txs = vec![cb.clone(), c.clone(), a.clone(), b.clone()];
		lexical_sort(&mut txs);
		assert_eq!(txs[0], cb);
		assert!(txs[1].txid() < txs[2].txid());
		assert!(txs[2].txid() < txs[3].txid());
	}

	#[test]
	fn standalone_txs_end_up_ascending() {
		let cb = coinbase();
		let mut txs = vec![cb.clone()];
		for i in 0..20 {
			txs.push(tx_spending(i, &[]));
		}
		topo_canonical_sort(&mut txs);
		assert_eq!(txs[0], cb);
		for w in txs[1..].windows(2) {
			assert!(w[0].txid() < w[1].txid());
		}
		assert!(is_topological(&txs));
	}

	#[test]
	fn dependency_precedes_dependant() {
		// vtx = [coinbase, A, B, C] with A spending B
		let cb = coinbase();
		let b = tx_spending(10, &[]);
		let a = tx_spending(11, &[&b]);
		let c = tx_spending(12, &[]);
		let mut txs = vec![cb.clone(), a.clone(), b.clone(), c.clone()];
		topo_canonical_sort(&mut txs);

		assert_eq!(txs[0], cb);
		let pos_a = txs.iter().position(|t| *t == a).unwrap();
		let pos_b = txs.iter().position(|t| *t == b).unwrap();
		assert!(pos_b < pos_a);
		assert!(is_topological(&txs));
	}

	#[test]
	fn deterministic_for_any_permutation() {
		let mut rng = StdRng::seed_from_u64(42);
		for round in 0..10 {
			let cb = coinbase();
			let mut txs: Vec<TxRef> = vec![cb.clone()];
			// build chains and standalones with a mix of dependencies
			for i in 0..50u64 {
				let parents: Vec<&TxRef> = if i % 3 == 0 && txs.len() > 1 {
					let p = rng.gen_range(1, txs.len());
					vec![&txs[p]]
				} else {
					vec![]
				};
				let tx = tx_spending(round * 1000 + i, &parents);
				txs.push(tx);
			}

			let mut sorted_once = txs.clone();
			topo_canonical_sort(&mut sorted_once);

			for _ in 0..5 {
				let mut shuffled = txs.clone();
				shuffled[1..].shuffle(&mut rng);
				topo_canonical_sort(&mut shuffled);
				assert_eq!(sorted_once, shuffled);
				assert!(is_topological(&shuffled));
				assert_eq!(shuffled[0], cb);
			}
		}
	}

	#[test]
	fn rejects_out_of_order_and_duplicates() {
		let cb = coinbase();
		let b = tx_spending(20, &[]);
		let a = tx_spending(21, &[&b]);

		// A before B: not topological
		assert!(!is_topological(&[cb.clone(), a.clone(), b.clone()]));
		assert!(is_topological(&[cb.clone(), b.clone(), a.clone()]));
		// duplicates rejected
		assert!(!is_topological(&[cb, b.clone(), b]));
	}
}
