// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`traits`]: the [`RecordStore`](traits::RecordStore) contract
//! - [`sql`]: MySQL/SQLite primary
//! - [`memory`]: in-memory primary for embedded use and tests
//! - [`fallback`]: the durable SQLite queue used during outages

pub mod fallback;
pub mod memory;
pub mod sql;
pub mod traits;
