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

//! Network-wide size and policy constants shared across the workspace.

/// The legacy hard block-size limit. Messages are always allowed to be at
/// least this large whatever the operator configured.
pub const BLOCKSTREAM_CORE_MAX_BLOCK_SIZE: u64 = 1_000_000;

/// Default operator-configured excessive block size (32 MB).
pub const DEFAULT_EXCESSIVE_BLOCK_SIZE: u64 = 32_000_000;

/// Default multiplier applied to the excessive block size when capping the
/// size of a single network message.
pub const DEFAULT_MAX_MESSAGE_SIZE_MULTIPLIER: u64 = 16;

/// Largest number of inventory items in a single inv/getdata message.
pub const MAX_INV_SZ: usize = 50_000;

/// Largest number of headers returned for one getheaders request.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Largest number of addresses in a single addr message.
pub const MAX_ADDR_SZ: usize = 1_000;

/// A weak block must meet at least 1/600 of the full proof-of-work target.
pub const WEAKBLOCK_MIN_POW_RATIO: u32 = 600;

/// The effective cap on a single wire message given the operator's
/// excessive block size setting.
pub fn max_message_size(excessive_block_size: u64) -> u64 {
	std::cmp::max(
		BLOCKSTREAM_CORE_MAX_BLOCK_SIZE,
		DEFAULT_MAX_MESSAGE_SIZE_MULTIPLIER * excessive_block_size,
	)
}
