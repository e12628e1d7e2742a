// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flotilla - Fleet Launcher
//!
//! This crate launches one compute instance per work item, runs a command on
//! each in the background, tags every instance for later discovery and
//! reconciles per-item status from tags and uploaded logs.
//!
//! There is no database. Instance tags and the blob store are the only
//! state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      flotilla-ctl (operator CLI)                  │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Launcher                                 │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐          │
//! │  │ Manifest │  │ Fan-out  │  │   Log    │  │  Status  │          │
//! │  │  Store   │  │          │  │Aggregator│  │Reconciler│          │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘          │
//! └──────────────────────────────────────────────────────────────────┘
//!          │             │               │             │
//!          ▼             ▼               ▼             ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────────┐
//! │  BlobStore (s3 / memory) │   │ InstanceProvider (aws / mock)     │
//! └──────────────────────────┘   └──────────────────────────────────┘
//! ```
//!
//! # Label Status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `failed` | The log ends with a non-zero `exited <code>`, or could not be read |
//! | `done` | The log ends with `exited 0` |
//! | `running` | A running or pending instance carries the label |
//! | `missing` | None of the above |
//!
//! # Configuration
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `FLOTILLA_BUCKET` | Bucket for manifests and logs |
//! | `FLOTILLA_OWNER` | Owner prefix (defaults to `$USER`) |
//! | `FLOTILLA_KEY`, `FLOTILLA_AMI`, `FLOTILLA_SG`, `FLOTILLA_TYPE`, `FLOTILLA_VPC` | Provisioning defaults |
//! | `FLOTILLA_ZONE`, `FLOTILLA_SPOT`, `FLOTILLA_GIGS` | Optional provisioning parameters |
//! | `FLOTILLA_CONFIG_DIR` | Directory of `preferences.json` |
//! | `FLOTILLA_AWS_BIN`, `FLOTILLA_SSH_BIN`, `FLOTILLA_SSH_USER` | CLI tool overrides |

#![deny(missing_docs)]

/// Error types for launcher operations.
pub mod error;

/// Tag parsing, encoding and tagify.
pub mod tags;

/// Blob key layout of manifests and logs.
pub mod layout;

/// Child process helpers.
pub mod process;

/// Remote command construction.
pub mod command;

/// Blob store backends.
pub mod blob;

/// Instance provider backends.
pub mod provider;

/// Launch manifests.
pub mod manifest;

/// Concurrent remote dispatch.
pub mod fanout;

/// Log listing, fetching and aggregation.
pub mod logs;

/// Label status reconciliation.
pub mod status;

/// Waiting for a launch to finish.
pub mod wait;

/// Settings resolution and preferences.
pub mod config;

/// Operator prompts.
pub mod prompt;

/// The operation surface.
pub mod launcher;

pub use error::{Error, Result};
pub use launcher::{LaunchReport, Launcher, LauncherBuilder, NewLaunch, RestartOptions};
pub use tags::TagSet;
