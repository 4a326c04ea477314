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

//! Logging, as well as various low-level utilities that factor Rust
//! patterns that are frequent within the cashnode codebase.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

// Re-export so only has to be included once
pub use parking_lot::{Condvar, Mutex, RwLock};

// Logging related
pub mod logger;
pub use crate::logger::{init_logger, init_test_logger};

pub mod types;
pub use crate::types::LoggingConfig;

pub mod hex;
pub use crate::hex::*;

pub mod stat;
pub use crate::stat::{StatHistory, StatOp};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Encapsulation of an RwLock<Option<T>> for one-time initialization.
/// This implementation will purposefully fail hard if not used
/// properly, for example if not initialized before being first used
/// (borrowed).
#[derive(Clone)]
pub struct OneTime<T> {
	/// The inner value.
	inner: Arc<RwLock<Option<T>>>,
}

impl<T> OneTime<T>
where
	T: Clone,
{
	/// Builds a new uninitialized OneTime.
	pub fn new() -> OneTime<T> {
		OneTime {
			inner: Arc::new(RwLock::new(None)),
		}
	}

	/// Initializes the OneTime, should only be called once after construction.
	/// Will panic (via assert) if called more than once.
	pub fn init(&self, value: T) {
		let mut inner = self.inner.write();
		assert!(inner.is_none());
		*inner = Some(value);
	}

	/// Whether the OneTime has been initialized.
	pub fn is_init(&self) -> bool {
		self.inner.read().is_some()
	}

	/// Borrows the OneTime, should only be called after initialization.
	/// Will panic if called before initialization.
	pub fn borrow(&self) -> T {
		let inner = self.inner.read();
		inner
			.clone()
			.expect("Cannot borrow one_time before initialization.")
	}
}

/// Global stop-state shared across all the long-lived threads of a node.
/// Every loop polls this at its head and winds down when stop is requested.
pub struct StopState {
	stop: AtomicBool,
}

impl StopState {
	/// Create a new running stop-state.
	pub fn new() -> StopState {
		StopState {
			stop: AtomicBool::new(false),
		}
	}

	/// Request all threads to stop.
	pub fn stop(&self) {
		self.stop.store(true, Ordering::Relaxed);
	}

	/// Whether stop has been requested.
	pub fn is_stopped(&self) -> bool {
		self.stop.load(Ordering::Relaxed)
	}
}

/// Exponential decay of a counter over elapsed seconds given a half-life,
/// used by the eviction and connection-attempt trackers.
pub fn decay(value: f64, elapsed_secs: i64, half_life_secs: i64) -> f64 {
	if elapsed_secs <= 0 || value == 0.0 {
		return value;
	}
	value * (0.5f64).powf(elapsed_secs as f64 / half_life_secs as f64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn one_time_init_and_borrow() {
		let cell: OneTime<u32> = OneTime::new();
		assert!(!cell.is_init());
		cell.init(42);
		assert!(cell.is_init());
		assert_eq!(cell.borrow(), 42);
	}

	#[test]
	fn decay_halves_at_half_life() {
		let v = decay(16.0, 120, 60);
		assert!((v - 4.0).abs() < 1e-9);
		assert_eq!(decay(16.0, 0, 60), 16.0);
	}
}
