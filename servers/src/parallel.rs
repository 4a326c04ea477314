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

//! Parallel block validation. A fixed pool of script-check queues is
//! awarded one-per-validating-block under a semaphore; two blocks racing
//! on the same parent run concurrently and exactly one wins, the loser
//! receiving a cooperative abort at its next script-check boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::core::block::Block;
use crate::core::core::hash::Hash;
use crate::core::core::inventory::Inv;
use crate::p2p::types::{BlockValidator, PeerId, RejectCode};
use crate::p2p::{Peers, RequestManager};
use crate::util::{Condvar, Mutex};

/// Script-check queues in the pool; one validating block owns one queue.
pub const SCRIPT_CHECK_QUEUES: usize = 4;

/// Hard ceiling on worker threads per queue.
pub const MAX_SCRIPTCHECK_THREADS: usize = 16;

/// Script flag activating the input-sigchecks standardness rule.
pub const SCRIPT_VERIFY_INPUT_SIGCHECKS: u32 = 1 << 22;

/// Ways a script check can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
	/// The script evaluated false or crashed.
	VerifyFailed,
	/// Too many sigchecks for the input's size.
	SigChecksLimitExceeded,
	/// The owning validation was aborted by a competitor.
	Aborted,
}

/// Interface to the script interpreter maintained outside the core.
pub trait ScriptVerifier: Send + Sync {
	/// Run a script pair; returns the consensus sigcheck count.
	fn verify_script(
		&self,
		script_sig: &[u8],
		script_pubkey: &[u8],
		flags: u32,
	) -> Result<u32, ScriptError>;
}

/// One input's script validation work unit.
pub struct ScriptCheck {
	/// The unlocking script.
	pub script_sig: Vec<u8>,
	/// The locking script.
	pub script_pubkey: Vec<u8>,
	/// Verification flags.
	pub flags: u32,
}

impl ScriptCheck {
	/// Run the check, enforcing the input-sigchecks density rule when the
	/// flag is active: an input with more than one sigcheck must carry at
	/// least `43 * sigchecks - 60` bytes of unlocking script.
	pub fn execute(&self, verifier: &dyn ScriptVerifier) -> Result<u32, ScriptError> {
		let sigchecks = verifier.verify_script(&self.script_sig, &self.script_pubkey, self.flags)?;
		if self.flags & SCRIPT_VERIFY_INPUT_SIGCHECKS != 0 && sigchecks > 1 {
			let floor = 43 * sigchecks as usize - 60;
			if self.script_sig.len() < floor {
				return Err(ScriptError::SigChecksLimitExceeded);
			}
		}
		Ok(sigchecks)
	}
}

struct QueueState {
	jobs: Vec<ScriptCheck>,
	pending: usize,
	failure: Option<ScriptError>,
	shutdown: bool,
}

/// A pool of worker threads draining script checks for the one block
/// validation currently owning the queue.
pub struct ScriptCheckQueue {
	state: Mutex<QueueState>,
	work_cond: Condvar,
	done_cond: Condvar,
	/// Cooperative abort flag observed between checks.
	pub quit: AtomicBool,
	in_use: AtomicBool,
}

impl ScriptCheckQueue {
	/// Start a queue with its worker threads.
	pub fn new(queue_id: usize, n_workers: usize, verifier: Arc<dyn ScriptVerifier>) -> Arc<ScriptCheckQueue> {
		let queue = Arc::new(ScriptCheckQueue {
			state: Mutex::new(QueueState {
				jobs: vec![],
				pending: 0,
				failure: None,
				shutdown: false,
			}),
			work_cond: Condvar::new(),
			done_cond: Condvar::new(),
			quit: AtomicBool::new(false),
			in_use: AtomicBool::new(false),
		});
		for worker in 0..n_workers.max(1) {
			let queue = queue.clone();
			let verifier = verifier.clone();
			let _ = thread::Builder::new()
				.name(format!("scriptcheck-{}-{}", queue_id, worker))
				.spawn(move || queue.worker_loop(verifier));
		}
		queue
	}

	fn worker_loop(&self, verifier: Arc<dyn ScriptVerifier>) {
		loop {
			let job = {
				let mut state = self.state.lock();
				loop {
					if state.shutdown {
						return;
					}
					if let Some(job) = state.jobs.pop() {
						break job;
					}
					self.work_cond.wait(&mut state);
				}
			};

			let result = if self.quit.load(Ordering::Relaxed) {
				Err(ScriptError::Aborted)
			} else {
				job.execute(verifier.as_ref())
			};

			let mut state = self.state.lock();
			if let Err(e) = result {
				if state.failure.is_none() {
					state.failure = Some(e);
				}
			}
			state.pending -= 1;
			if state.pending == 0 {
				self.done_cond.notify_all();
			}
		}
	}

	/// Run a batch of checks to completion. Fails fast if the owning
	/// validation was told to quit.
	pub fn check_all(&self, checks: Vec<ScriptCheck>) -> Result<(), ScriptError> {
		if checks.is_empty() {
			return self.quit_or(Ok(()));
		}
		{
			let mut state = self.state.lock();
			state.pending += checks.len();
			state.jobs.extend(checks);
			self.work_cond.notify_all();
		}
		let mut state = self.state.lock();
		while state.pending > 0 {
			self.done_cond.wait(&mut state);
		}
		let failure = state.failure.take();
		drop(state);
		self.quit_or(match failure {
			Some(e) => Err(e),
			None => Ok(()),
		})
	}

	fn quit_or(&self, result: Result<(), ScriptError>) -> Result<(), ScriptError> {
		if self.quit.load(Ordering::Relaxed) {
			Err(ScriptError::Aborted)
		} else {
			result
		}
	}

	/// Whether the owning validation was aborted.
	pub fn quit_received(&self) -> bool {
		self.quit.load(Ordering::Relaxed)
	}

	/// Stop the worker threads.
	pub fn shutdown(&self) {
		let mut state = self.state.lock();
		state.shutdown = true;
		self.work_cond.notify_all();
	}
}

/// Block validation driven by the kernel outside the core. The kernel
/// must poll `queue.quit_received()` between script-check batches so a
/// competitive abort lands at the next boundary.
pub trait ValidationKernel: Send + Sync {
	/// Fully validate and connect a block. Returns whether it became the
	/// new tip.
	fn process_new_block(
		&self,
		block: &Block,
		queue: &ScriptCheckQueue,
		peer: PeerId,
	) -> Result<bool, RejectCode>;
}

/// A block validation in progress. The owning queue's quit flag doubles
/// as the per-validation cooperative abort signal since a validation
/// owns its queue exclusively.
struct ValidationEntry {
	hash: Hash,
	parent: Hash,
	sequence_id: u64,
	start_millis: i64,
	block_size: u64,
	peer: PeerId,
	is_validating: bool,
	nbits: u32,
	queue: Arc<ScriptCheckQueue>,
}

struct Semaphore {
	count: Mutex<usize>,
	cond: Condvar,
}

impl Semaphore {
	fn new(count: usize) -> Semaphore {
		Semaphore {
			count: Mutex::new(count),
			cond: Condvar::new(),
		}
	}

	fn try_acquire(&self) -> bool {
		let mut count = self.count.lock();
		if *count > 0 {
			*count -= 1;
			true
		} else {
			false
		}
	}

	fn acquire(&self) {
		let mut count = self.count.lock();
		while *count == 0 {
			self.cond.wait(&mut count);
		}
		*count -= 1;
	}

	fn release(&self) {
		let mut count = self.count.lock();
		*count += 1;
		self.cond.notify_one();
	}
}

/// The dispatcher owning the script-check queue pool and the table of
/// running validations.
pub struct ParallelValidation {
	queues: Vec<Arc<ScriptCheckQueue>>,
	semaphore: Semaphore,
	table: Mutex<HashMap<u64, ValidationEntry>>,
	next_session: AtomicU64,
	next_sequence: AtomicU64,
	kernel: Arc<dyn ValidationKernel>,
	requests: Arc<RequestManager>,
	peers: Arc<Peers>,
	/// Back-reference for the object-safe `BlockValidator` entry point.
	self_ref: Mutex<std::sync::Weak<ParallelValidation>>,
}

fn now_millis() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

impl ParallelValidation {
	/// Build the pool: `SCRIPT_CHECK_QUEUES` queues, each with one worker
	/// per core bounded by `MAX_SCRIPTCHECK_THREADS`.
	pub fn new(
		kernel: Arc<dyn ValidationKernel>,
		verifier: Arc<dyn ScriptVerifier>,
		requests: Arc<RequestManager>,
		peers: Arc<Peers>,
	) -> Arc<ParallelValidation> {
		let cores = thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1);
		let workers = cores.min(MAX_SCRIPTCHECK_THREADS).max(1);
		let queues = (0..SCRIPT_CHECK_QUEUES)
			.map(|i| ScriptCheckQueue::new(i, workers, verifier.clone()))
			.collect();
		let pv = Arc::new(ParallelValidation {
			queues,
			semaphore: Semaphore::new(SCRIPT_CHECK_QUEUES),
			table: Mutex::new(HashMap::new()),
			next_session: AtomicU64::new(1),
			next_sequence: AtomicU64::new(1),
			kernel,
			requests,
			peers,
			self_ref: Mutex::new(std::sync::Weak::new()),
		});
		*pv.self_ref.lock() = Arc::downgrade(&pv);
		pv
	}

	fn get_idle_queue(&self) -> Arc<ScriptCheckQueue> {
		for queue in &self.queues {
			if !queue.in_use.swap(true, Ordering::AcqRel) {
				queue.quit.store(false, Ordering::Relaxed);
				return queue.clone();
			}
		}
		// the semaphore guarantees a free queue exists
		unreachable!("semaphore permits exceed queue count");
	}

	/// Validate a block on its own thread under a queue permit. When all
	/// queues are busy and the new block competes with a running sibling,
	/// the larger of the two loses: an already-running larger competitor
	/// is aborted, a larger newcomer is dropped outright.
	pub fn handle_block_message(self: Arc<Self>, peer: PeerId, block: Block, inv: Inv) {
		let hash = inv.hash;
		let parent = block.header.prev_block_hash;
		let block_size = block.total_size();

		if !self.semaphore.try_acquire() {
			let largest_competitor = {
				let table = self.table.lock();
				table
					.values()
					.filter(|e| e.parent == parent && e.is_validating)
					.max_by_key(|e| e.block_size)
					.map(|e| (e.block_size, e.queue.clone(), e.hash))
			};
			match largest_competitor {
				Some((competitor_size, _, _)) if block_size >= competitor_size => {
					debug!(
						"dropping block {}: larger than competing validation on the same parent",
						hash
					);
					return;
				}
				Some((_, queue, competitor_hash)) => {
					debug!(
						"aborting competing validation of {} to make room for {}",
						competitor_hash, hash
					);
					queue.quit.store(true, Ordering::Relaxed);
				}
				None => {}
			}
			self.semaphore.acquire();
		}

		let this = self.clone();
		let _ = thread::Builder::new()
			.name("parallel-validation".to_string())
			.spawn(move || this.run_validation(peer, block, inv, block_size));
	}

	fn run_validation(self: Arc<Self>, peer: PeerId, block: Block, inv: Inv, block_size: u64) {
		let hash = inv.hash;
		let parent = block.header.prev_block_hash;
		let queue = self.get_idle_queue();
		let session = self.next_session.fetch_add(1, Ordering::Relaxed);
		{
			let mut table = self.table.lock();
			table.insert(
				session,
				ValidationEntry {
					hash,
					parent,
					sequence_id: self.next_sequence.fetch_add(1, Ordering::Relaxed),
					start_millis: now_millis(),
					block_size,
					peer,
					is_validating: true,
					nbits: block.header.bits,
					queue: queue.clone(),
				},
			);
		}

		let result = self.kernel.process_new_block(&block, &queue, peer);

		match result {
			Ok(advanced_tip) => {
				if advanced_tip {
					self.quit_competing_threads(&parent, &hash);
					self.cleanup_sequence_ids(&parent, &hash);
				}
				if let Some(p) = self.peers.get_peer(peer) {
					self.requests.received(&inv, &p);
				}
			}
			Err(code) => {
				debug!("block {} failed validation: {:?}", hash, code);
				self.requests.block_rejected(&inv, peer);
			}
		}

		{
			let mut table = self.table.lock();
			table.remove(&session);
		}
		queue.in_use.store(false, Ordering::Release);
		self.semaphore.release();
	}

	/// Called by whichever validator first advances the tip: every other
	/// validator on the same parent aborts cooperatively.
	pub fn quit_competing_threads(&self, parent: &Hash, winner: &Hash) {
		let table = self.table.lock();
		for entry in table.values() {
			if entry.parent == *parent && entry.hash != *winner && entry.is_validating {
				debug!(
					"signalling quit to validation of competing block {}",
					entry.hash
				);
				entry.queue.quit.store(true, Ordering::Relaxed);
			}
		}
	}

	/// Abort every validation working on a block at or below the given
	/// difficulty bits; used when the node begins mining its own block so
	/// the local attempt has priority.
	pub fn stop_all_validation_threads(&self, nbits_threshold: u32) {
		let table = self.table.lock();
		for entry in table.values() {
			if entry.is_validating && entry.nbits <= nbits_threshold {
				entry.queue.quit.store(true, Ordering::Relaxed);
			}
		}
	}

	/// After a winner connects, rewrite sibling sequence ids so the
	/// winner carries the lowest, keeping later tie-breaks stable.
	fn cleanup_sequence_ids(&self, parent: &Hash, winner: &Hash) {
		let mut table = self.table.lock();
		let min_seq = table
			.values()
			.filter(|e| e.parent == *parent)
			.map(|e| e.sequence_id)
			.min();
		if let Some(min_seq) = min_seq {
			let winner_seq = table
				.values()
				.find(|e| e.hash == *winner)
				.map(|e| e.sequence_id);
			if let Some(winner_seq) = winner_seq {
				for entry in table.values_mut() {
					if entry.sequence_id == min_seq {
						entry.sequence_id = winner_seq;
					} else if entry.hash == *winner {
						entry.sequence_id = min_seq;
					}
				}
			}
		}
	}

	/// Number of currently running validations.
	pub fn running(&self) -> usize {
		self.table.lock().len()
	}

	/// Snapshot of the running validations for operator views:
	/// (block, peer, age in milliseconds, sequence id).
	pub fn running_info(&self) -> Vec<(Hash, PeerId, i64, u64)> {
		let now = now_millis();
		self.table
			.lock()
			.values()
			.filter(|e| e.is_validating)
			.map(|e| (e.hash, e.peer, now - e.start_millis, e.sequence_id))
			.collect()
	}

	/// Stop every queue worker; part of shutdown.
	pub fn shutdown(&self) {
		for queue in &self.queues {
			queue.quit.store(true, Ordering::Relaxed);
			queue.shutdown();
		}
	}
}

impl BlockValidator for ParallelValidation {
	fn handle_block(&self, peer: PeerId, block: Block, inv: Inv) {
		if let Some(this) = self.self_ref.lock().upgrade() {
			this.handle_block_message(peer, block, inv);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::core::block::BlockHeader;
	use crate::core::core::inventory::InvType;
	use crate::p2p::types::{ChainView, Direction, DosManager, TxMempoolView, P2PConfig};
	use crate::p2p::ThinTypeRelay;
	use std::net::IpAddr;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	struct OkVerifier;
	impl ScriptVerifier for OkVerifier {
		fn verify_script(&self, _sig: &[u8], _pk: &[u8], _flags: u32) -> Result<u32, ScriptError> {
			Ok(1)
		}
	}

	struct CountingVerifier {
		sigchecks: u32,
	}
	impl ScriptVerifier for CountingVerifier {
		fn verify_script(&self, _sig: &[u8], _pk: &[u8], _flags: u32) -> Result<u32, ScriptError> {
			Ok(self.sigchecks)
		}
	}

	#[test]
	fn script_queue_runs_checks() {
		let queue = ScriptCheckQueue::new(0, 2, Arc::new(OkVerifier));
		let checks: Vec<ScriptCheck> = (0..100)
			.map(|_| ScriptCheck {
				script_sig: vec![0; 80],
				script_pubkey: vec![1],
				flags: 0,
			})
			.collect();
		assert!(queue.check_all(checks).is_ok());
		queue.shutdown();
	}

	#[test]
	fn sigchecks_density_rule() {
		let verifier = CountingVerifier { sigchecks: 3 };
		// 3 sigchecks require at least 43*3-60 = 69 bytes of scriptSig
		let short = ScriptCheck {
			script_sig: vec![0; 68],
			script_pubkey: vec![],
			flags: SCRIPT_VERIFY_INPUT_SIGCHECKS,
		};
		assert_eq!(
			short.execute(&verifier),
			Err(ScriptError::SigChecksLimitExceeded)
		);
		let long = ScriptCheck {
			script_sig: vec![0; 69],
			script_pubkey: vec![],
			flags: SCRIPT_VERIFY_INPUT_SIGCHECKS,
		};
		assert_eq!(long.execute(&verifier), Ok(3));
		// without the flag the rule does not apply
		let unflagged = ScriptCheck {
			script_sig: vec![0; 10],
			script_pubkey: vec![],
			flags: 0,
		};
		assert_eq!(unflagged.execute(&verifier), Ok(3));
	}

	#[test]
	fn aborted_queue_fails_batch() {
		let queue = ScriptCheckQueue::new(1, 2, Arc::new(OkVerifier));
		queue.quit.store(true, Ordering::Relaxed);
		let checks = vec![ScriptCheck {
			script_sig: vec![],
			script_pubkey: vec![],
			flags: 0,
		}];
		assert_eq!(queue.check_all(checks), Err(ScriptError::Aborted));
		queue.shutdown();
	}

	// ---- competing validation race ----

	struct NullDos;
	impl DosManager for NullDos {
		fn misbehaving(&self, _p: PeerId, _pts: i32, _r: &str) -> bool {
			false
		}
		fn ban(&self, _a: &IpAddr, _s: &str, _r: &str, _secs: i64) {}
		fn is_banned(&self, _a: &IpAddr) -> bool {
			false
		}
	}

	struct NullChain;
	impl ChainView for NullChain {
		fn tip(&self) -> crate::p2p::BlockIndexInfo {
			crate::p2p::BlockIndexInfo {
				hash: Hash::default(),
				prev_hash: Hash::default(),
				height: 0,
				work: 0,
				time: 0,
			}
		}
		fn best_header(&self) -> crate::p2p::BlockIndexInfo {
			self.tip()
		}
		fn contains(&self, _h: &Hash) -> bool {
			false
		}
		fn locator(&self) -> Vec<Hash> {
			vec![]
		}
		fn lookup(&self, _h: &Hash) -> Option<crate::p2p::BlockIndexInfo> {
			None
		}
		fn next_blocks_toward(
			&self,
			_l: &Hash,
			_b: &Hash,
			_m: usize,
		) -> Vec<crate::p2p::BlockIndexInfo> {
			vec![]
		}
		fn last_common_ancestor(&self, _h: &Hash) -> Option<crate::p2p::BlockIndexInfo> {
			None
		}
		fn read_block(&self, _h: &Hash) -> Option<Block> {
			None
		}
		fn locate_headers(&self, _l: &[Hash], _m: usize) -> Vec<BlockHeader> {
			vec![]
		}
		fn accept_block_header(
			&self,
			_h: &BlockHeader,
		) -> Result<crate::p2p::BlockIndexInfo, RejectCode> {
			Err(RejectCode::Invalid)
		}
		fn is_initial_block_download(&self) -> bool {
			false
		}
		fn is_chain_nearly_syncd(&self) -> bool {
			true
		}
		fn can_serve_block(&self, _h: &Hash) -> bool {
			false
		}
	}

	struct NullPool;
	impl TxMempoolView for NullPool {
		fn query_hashes(&self) -> Vec<Hash> {
			vec![]
		}
		fn get(&self, _h: &Hash) -> Option<crate::core::core::transaction::TxRef> {
			None
		}
		fn contains(&self, _h: &Hash) -> bool {
			false
		}
		fn submit(&self, _tx: crate::core::core::transaction::TxRef, _from: PeerId) {}
		fn add_double_spend_proof(&self, _p: &[u8]) -> Option<crate::core::core::transaction::TxRef> {
			None
		}
	}

	/// Kernel where one designated block wins after a short delay and
	/// every other block spins until aborted.
	struct RacingKernel {
		winner: Hash,
		aborted: AtomicUsize,
		connected: AtomicUsize,
	}

	impl ValidationKernel for RacingKernel {
		fn process_new_block(
			&self,
			block: &Block,
			queue: &ScriptCheckQueue,
			_peer: PeerId,
		) -> Result<bool, RejectCode> {
			if block.hash() == self.winner {
				thread::sleep(Duration::from_millis(50));
				self.connected.fetch_add(1, Ordering::Relaxed);
				return Ok(true);
			}
			// the loser validates until the cooperative abort arrives
			for _ in 0..2_000 {
				if queue.quit_received() {
					self.aborted.fetch_add(1, Ordering::Relaxed);
					return Err(RejectCode::Invalid);
				}
				thread::sleep(Duration::from_millis(1));
			}
			self.connected.fetch_add(1, Ordering::Relaxed);
			Ok(true)
		}
	}

	fn block_with(parent: Hash, nonce: u32, extra_txs: usize) -> Block {
		let mut header = BlockHeader::default();
		header.prev_block_hash = parent;
		header.nonce = nonce;
		let mut block = Block::with_header(header);
		for i in 0..extra_txs {
			block.txs.push(Arc::new(crate::core::core::transaction::Transaction {
				version: 1,
				inputs: vec![],
				outputs: vec![crate::core::core::transaction::TxOut {
					value: i as i64,
					script_pubkey: vec![],
				}],
				lock_time: 0,
			}));
		}
		block
	}

	#[test]
	fn competing_validation_winner_aborts_loser() {
		let parent = crate::core::core::hash::sha256d(b"parent");
		let b1 = block_with(parent, 1, 1);
		let b2 = block_with(parent, 2, 2);

		let config = P2PConfig::default();
		let peers = Arc::new(Peers::new(config.clone(), Arc::new(NullDos)));
		let relay = Arc::new(ThinTypeRelay::new(config.clone()));
		let requests = Arc::new(RequestManager::new(
			config,
			Arc::new(NullChain),
			Arc::new(NullPool),
			relay,
			peers.clone(),
		));

		let kernel = Arc::new(RacingKernel {
			winner: b1.hash(),
			aborted: AtomicUsize::new(0),
			connected: AtomicUsize::new(0),
		});
		let pv = ParallelValidation::new(
			kernel.clone(),
			Arc::new(OkVerifier),
			requests,
			peers,
		);

		let inv1 = Inv::new(InvType::Block, b1.hash());
		let inv2 = Inv::new(InvType::Block, b2.hash());
		pv.clone().handle_block_message(7, b2, inv2);
		// give the loser a head start so both validations overlap
		thread::sleep(Duration::from_millis(10));
		pv.clone().handle_block_message(8, b1, inv1);

		// the winner connects and the competitor aborts cooperatively
		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		while std::time::Instant::now() < deadline {
			if kernel.connected.load(Ordering::Relaxed) == 1
				&& kernel.aborted.load(Ordering::Relaxed) == 1
			{
				break;
			}
			thread::sleep(Duration::from_millis(5));
		}
		assert_eq!(kernel.connected.load(Ordering::Relaxed), 1);
		assert_eq!(kernel.aborted.load(Ordering::Relaxed), 1);

		// permits and queues returned to the pool
		let drained = std::time::Instant::now() + Duration::from_secs(2);
		while pv.running() > 0 && std::time::Instant::now() < drained {
			thread::sleep(Duration::from_millis(5));
		}
		assert_eq!(pv.running(), 0);
		pv.shutdown();
	}
}
