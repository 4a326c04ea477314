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

//! Time-windowed statistics ring. A statistic accumulates a "current"
//! value which a background timer periodically shifts into a set of
//! progressively coarser history ranges. Strictly for operator views;
//! nothing in the node may base decisions on these samples.

use std::collections::VecDeque;

/// Number of history ranges kept per statistic.
pub const STAT_RANGES: usize = 5;
/// Number of samples kept per range.
pub const SAMPLES_PER_RANGE: usize = 100;
/// Minimum interval, in seconds, between two calls to `sample()`.
pub const MIN_SAMPLE_INTERVAL_SECS: u64 = 10;

/// How many rotations of range i flow one aggregated value into range i+1.
/// 10s samples -> 5 minute -> hourly -> daily -> monthly.
const OPERATE_SAMPLE_COUNT: [u32; STAT_RANGES - 1] = [30, 12, 24, 30];

/// How successive samples are combined, both when accumulating into the
/// current value and when aggregating a range into the next coarser one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOp {
	/// Running total.
	Sum,
	/// Arithmetic mean.
	Avg,
	/// Largest sample.
	Max,
	/// Smallest sample.
	Min,
	/// Last sample wins.
	Keep,
	/// Count of samples recorded.
	KeepCount,
}

/// A single named statistic with its history rings.
pub struct StatHistory {
	name: String,
	op: StatOp,
	current: i64,
	count: u64,
	history: Vec<VecDeque<i64>>,
	rotations: [u32; STAT_RANGES],
}

impl StatHistory {
	/// Build a new empty statistic.
	pub fn new(name: &str, op: StatOp) -> StatHistory {
		StatHistory {
			name: name.to_owned(),
			op,
			current: initial_value(op),
			count: 0,
			history: (0..STAT_RANGES)
				.map(|_| VecDeque::with_capacity(SAMPLES_PER_RANGE))
				.collect(),
			rotations: [0; STAT_RANGES],
		}
	}

	/// Name of this statistic.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Fold a new observation into the current value.
	pub fn record(&mut self, v: i64) {
		self.count += 1;
		match self.op {
			StatOp::Sum => self.current += v,
			StatOp::Avg => self.current += v,
			StatOp::Max => self.current = self.current.max(v),
			StatOp::Min => self.current = self.current.min(v),
			StatOp::Keep => self.current = v,
			StatOp::KeepCount => self.current += 1,
		}
	}

	/// The value accumulated since the last sample shift.
	pub fn current(&self) -> i64 {
		if self.op == StatOp::Avg && self.count > 0 {
			self.current / self.count as i64
		} else {
			self.current
		}
	}

	/// Shift the current value into the finest range and cascade any range
	/// that has completed a full rotation into the next coarser one. Driven
	/// by the stat timer thread, never more often than
	/// `MIN_SAMPLE_INTERVAL_SECS`.
	pub fn sample(&mut self) {
		let v = self.current();
		self.current = initial_value(self.op);
		self.count = 0;
		self.push(0, v);

		for i in 0..STAT_RANGES - 1 {
			self.rotations[i] += 1;
			if self.rotations[i] % OPERATE_SAMPLE_COUNT[i] != 0 {
				break;
			}
			let agg = self.aggregate(i, OPERATE_SAMPLE_COUNT[i] as usize);
			self.push(i + 1, agg);
		}
	}

	/// A copy of a history range, most recent sample first.
	pub fn history(&self, range: usize) -> Vec<i64> {
		self.history[range].iter().cloned().collect()
	}

	fn push(&mut self, range: usize, v: i64) {
		let ring = &mut self.history[range];
		if ring.len() == SAMPLES_PER_RANGE {
			ring.pop_back();
		}
		ring.push_front(v);
	}

	fn aggregate(&self, range: usize, n: usize) -> i64 {
		let vals: Vec<i64> = self.history[range].iter().take(n).cloned().collect();
		if vals.is_empty() {
			return initial_value(self.op);
		}
		match self.op {
			StatOp::Sum | StatOp::KeepCount => vals.iter().sum(),
			StatOp::Avg => vals.iter().sum::<i64>() / vals.len() as i64,
			StatOp::Max => *vals.iter().max().unwrap(),
			StatOp::Min => *vals.iter().min().unwrap(),
			StatOp::Keep => vals[0],
		}
	}
}

fn initial_value(op: StatOp) -> i64 {
	match op {
		StatOp::Max => i64::min_value(),
		StatOp::Min => i64::max_value(),
		_ => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sum_accumulates_and_shifts() {
		let mut stat = StatHistory::new("recv_bytes", StatOp::Sum);
		stat.record(5);
		stat.record(7);
		assert_eq!(stat.current(), 12);
		stat.sample();
		assert_eq!(stat.current(), 0);
		assert_eq!(stat.history(0), vec![12]);
	}

	#[test]
	fn avg_divides_by_count() {
		let mut stat = StatHistory::new("ping", StatOp::Avg);
		stat.record(10);
		stat.record(20);
		assert_eq!(stat.current(), 15);
	}

	#[test]
	fn cascade_into_coarser_range() {
		let mut stat = StatHistory::new("txns", StatOp::Sum);
		for _ in 0..OPERATE_SAMPLE_COUNT[0] {
			stat.record(1);
			stat.sample();
		}
		// one full rotation of range 0 flows a single aggregate into range 1
		assert_eq!(stat.history(1).len(), 1);
		assert_eq!(stat.history(1)[0], OPERATE_SAMPLE_COUNT[0] as i64);
	}

	#[test]
	fn ring_caps_at_sample_limit() {
		let mut stat = StatHistory::new("cap", StatOp::Keep);
		for i in 0..(SAMPLES_PER_RANGE + 10) {
			stat.record(i as i64);
			stat.sample();
		}
		assert_eq!(stat.history(0).len(), SAMPLES_PER_RANGE);
	}
}
