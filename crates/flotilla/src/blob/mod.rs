// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob store module - durable storage for manifests and logs.

pub mod memory;
pub mod s3;
mod traits;

pub use memory::MemoryBlobStore;
pub use s3::S3CliStore;
pub use traits::*;
