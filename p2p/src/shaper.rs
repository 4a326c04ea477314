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

//! The leaky-bucket traffic shaper. One bucket each for the send and
//! receive directions, plus one pacing outbound object requests. The
//! bucket is the only rate-limiting code that reads the clock, and it
//! only ever reads the monotonic clock.

use std::time::Instant;

/// Smallest fragment the receive path will ask the socket for even when
/// the bucket is nearly drained, so slow links still make progress.
pub const RECV_SHAPER_MIN_FRAG: usize = 256;

/// A token bucket: `avg_rate` tokens drip in per second up to a ceiling of
/// `max_burst`, and traffic leaks tokens out, possibly overdrawing.
pub struct LeakyBucket {
	max_burst: i64,
	avg_rate: i64,
	level: i64,
	last_fill: Instant,
	enabled: bool,
}

impl LeakyBucket {
	/// Bucket holding at most `max_burst` tokens, refilled at `avg_rate`
	/// tokens per second.
	pub fn new(max_burst: i64, avg_rate: i64) -> LeakyBucket {
		LeakyBucket {
			max_burst,
			avg_rate,
			level: max_burst,
			last_fill: Instant::now(),
			enabled: true,
		}
	}

	/// A bucket that never limits.
	pub fn disabled() -> LeakyBucket {
		LeakyBucket {
			max_burst: i64::max_value(),
			avg_rate: 0,
			level: i64::max_value(),
			last_fill: Instant::now(),
			enabled: false,
		}
	}

	/// Whether shaping is active at all.
	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	fn fill(&mut self) {
		if !self.enabled {
			return;
		}
		let elapsed = self.last_fill.elapsed();
		let drip = (elapsed.as_millis() as i64).saturating_mul(self.avg_rate) / 1000;
		if drip > 0 {
			self.level = (self.level + drip).min(self.max_burst);
			self.last_fill = Instant::now();
		}
	}

	/// How many tokens may be spent right now. Returns at least
	/// `min_fragment` whenever that much has accumulated, zero otherwise,
	/// so small reads still go through on a drained bucket.
	pub fn available(&mut self, min_fragment: usize) -> usize {
		if !self.enabled {
			return usize::max_value();
		}
		self.fill();
		if self.level >= min_fragment as i64 {
			self.level.max(0) as usize
		} else {
			0
		}
	}

	/// Spend `amount` tokens, going negative if need be. Returns whether
	/// the bucket is now exhausted for this tick.
	pub fn leak(&mut self, amount: usize) -> bool {
		if !self.enabled {
			return false;
		}
		self.fill();
		self.level -= amount as i64;
		self.level <= 0
	}

	/// Non-blocking attempt to spend `amount` tokens; succeeds only while
	/// at least one token remains. `try_leak(0)` is a pure budget probe.
	pub fn try_leak(&mut self, amount: usize) -> bool {
		if !self.enabled {
			return true;
		}
		self.fill();
		if self.level > 0 {
			self.level -= amount as i64;
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disabled_bucket_never_limits() {
		let mut b = LeakyBucket::disabled();
		assert!(b.available(1) > 1_000_000_000);
		assert!(!b.leak(1_000_000));
		assert!(b.try_leak(0));
	}

	#[test]
	fn leak_exhausts_budget() {
		let mut b = LeakyBucket::new(1000, 1);
		assert_eq!(b.available(1), 1000);
		assert!(!b.leak(500));
		assert!(b.leak(600)); // overdrawn
		assert!(!b.try_leak(0));
		assert_eq!(b.available(RECV_SHAPER_MIN_FRAG), 0);
	}

	#[test]
	fn min_fragment_gates_small_reads() {
		let mut b = LeakyBucket::new(100, 1);
		b.leak(90);
		// 10 tokens left, below a 64-byte fragment
		assert_eq!(b.available(64), 0);
		// but an 8-byte fragment may proceed
		assert_eq!(b.available(8), 10);
	}
}
