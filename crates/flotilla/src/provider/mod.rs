// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provider module - compute backends for launched batches.

pub mod aws;
pub mod mock;
mod traits;

pub use aws::AwsCliProvider;
pub use mock::MockProvider;
pub use traits::*;
