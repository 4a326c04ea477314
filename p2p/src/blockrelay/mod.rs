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

//! The block-relay families: the shared thin-type registry plus the
//! graphene, xthin, compact-block and mempool-sync wire formats and their
//! reconstruction logic. All schemes cooperate on one reconstruction slot
//! per (peer, hash) so a fallback re-request reuses what already arrived.

pub mod common;
pub mod compactblock;
pub mod graphene;
pub mod mempool_sync;
pub mod thinblock;
