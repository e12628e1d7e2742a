// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flotilla.

use thiserror::Error;

use crate::blob::BlobError;
use crate::config::ConfigError;
use crate::provider::ProviderError;

/// Launcher errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A tag string was not of the form `key=value`.
    #[error("Malformed tag, expected \"<key>=<value>\": {0}")]
    MalformedTag(String),

    /// The operation needs at least one tag to select logs or instances.
    #[error("At least one tag is required")]
    NoTags,

    /// The batch parameters are inconsistent.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// No manifest could be resolved for the given tags.
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    /// The manifest could not be written.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration could not be resolved.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Instance provider operation failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Blob store operation failed.
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    /// One or more instances failed during dispatch.
    #[error("Dispatch failed for {failed} of {total} instances (launch={launch_id})")]
    Dispatch {
        /// Launch id of the batch, still usable for status and restart.
        launch_id: String,
        /// Number of failed instances.
        failed: usize,
        /// Number of instances dispatched.
        total: usize,
    },

    /// One or more log fetches failed.
    #[error("Log fetch failed for {failed} of {total} logs")]
    LogFetchFailed {
        /// Number of failed fetches.
        failed: usize,
        /// Number of logs fetched.
        total: usize,
    },

    /// Wait finished but some labels did not complete successfully.
    #[error("Batch incomplete, labels not done: {}", not_done.join(", "))]
    BatchIncomplete {
        /// Labels whose final status is not `done`.
        not_done: Vec<String>,
    },

    /// The operator declined a confirmation prompt.
    #[error("Aborted")]
    Aborted,

    /// A manifest transform command failed.
    #[error("Transform failed: {0}")]
    Transform(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using flotilla Error.
pub type Result<T> = std::result::Result<T, Error>;
