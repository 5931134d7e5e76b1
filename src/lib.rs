//! # Docket
//!
//! Background task layer for a document archive: consuming files into the
//! store, quarantining and retrying failures, conditional classifier
//! training, consistency checks, and trash eviction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────────┐
//! │  TaskRunner  │──▶│  Pipeline   │──▶│      SQLite      │
//! │ before/after │   │ consume +   │   │ documents, tasks │
//! │   hooks      │   │ retry       │   │ FTS5 index       │
//! └──────┬───────┘   └─────────────┘   └────────┬─────────┘
//!        │ failure                              │
//!        ▼                                      ▼
//! ┌──────────────┐               ┌──────────────────────────┐
//! │  quarantine  │               │ trainer, sanity, reaper  │
//! │  directory   │               │ index maintenance        │
//! └──────────────┘               └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docket init
//! docket consume ./inbox/scan.pdf
//! docket tasks                        # find the id of a failed task
//! docket retry <task-id> --clean
//! docket train
//! docket sanity
//! docket empty-trash
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Task error taxonomy |
//! | [`store`] | Documents and matching rules, live and all-records views |
//! | [`registry`] | Task metadata and status transitions |
//! | [`hooks`] | Publish/success/failure hooks and the task runner |
//! | [`consume`] | Ingestion pipeline and retry |
//! | [`extract`] | Format validation and text extraction |
//! | [`repair`] | Best-effort repair before a retry |
//! | [`classifier`] | Matching model and preprocessing |
//! | [`fingerprint`] | Corpus fingerprint for conditional training |
//! | [`training`] | Classifier trainer |
//! | [`sanity`] | Consistency checks and severity aggregation |
//! | [`trash`] | Soft delete and grace-period eviction |
//! | [`index`] | Full-text search index |
//! | [`progress`] | Consume progress reporting |
//! | [`tasks`] | Task entry points |

pub mod classifier;
pub mod config;
pub mod consume;
pub mod db;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod hooks;
pub mod index;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod registry;
pub mod repair;
pub mod sanity;
pub mod store;
pub mod tasks;
pub mod training;
pub mod trash;
