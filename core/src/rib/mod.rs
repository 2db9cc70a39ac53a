// Copyright 2025 ribd Authors
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

//! Routing Information Base
//!
//! - Adj-RIB-In: per-peer input tables, owned by the server-side `Peer`
//! - Table manager: per-family destinations with one path list per table
//!   (the global table plus one private table per route-server client),
//!   owned by `BgpServer`
//! - Adj-RIB-Out is not stored; it is recomputed from best paths on demand

mod path;
mod path_id;
pub mod rib_in;
pub mod rib_loc;
mod types;

pub use path::{Path, PathAttrs};
pub use rib_in::{AdjRibIn, RtInterest};
pub use rib_loc::{Destination, RouteChange, TableManager};
pub use types::{PathSource, SourceKind, TableId};
