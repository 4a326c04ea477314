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

//! Server configuration types.

use crate::p2p::types::P2PConfig;
use crate::util::LoggingConfig;

/// Full server configuration, aggregating the p2p layer's knobs with the
/// node-level ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
	/// Networking configuration.
	pub p2p: P2PConfig,
	/// Logging configuration.
	pub logging: LoggingConfig,
	/// Message-handler threads; zero means one per core.
	pub handler_threads: usize,
	/// Seconds between stat-ring samples (min 10).
	pub stat_sample_interval_secs: u64,
	/// Seconds between weak-block store sweep passes.
	pub weakblock_expiry_interval_secs: u64,
	/// Whether the weak-block subsystem is enabled.
	pub weakblocks_enabled: bool,
}

impl Default for ServerConfig {
	fn default() -> ServerConfig {
		ServerConfig {
			p2p: P2PConfig::default(),
			logging: LoggingConfig::default(),
			handler_threads: 0,
			stat_sample_interval_secs: 10,
			weakblock_expiry_interval_secs: 600,
			weakblocks_enabled: true,
		}
	}
}
