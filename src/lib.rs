//! # Intel Notebook
//!
//! Evidence core for a threat-actor intelligence notebook.
//!
//! Sources about a tracked actor arrive from analysts, feeds, and TAXII
//! collections. They are deduplicated by URL and content fingerprint,
//! scored, and ranked into evidence. Notebook generations run as journaled
//! background jobs, refreshed on a schedule and recovered when a process
//! dies mid-run. Write requests pass a sliding-window admission gate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ TAXII / HTTP │──▶│ SourceStore  │──▶│    SQLite    │
//! │   uploads    │   │ URL + fprint │   │ sources, IOC │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │
//!        ┌──────────────┬──────────────────────┤
//!        ▼              ▼                      ▼
//! ┌────────────┐ ┌──────────────┐      ┌──────────────┐
//! │  scoring   │ │   evidence   │      │   journal    │
//! │  writer    │ │   ranking    │      │ jobs, phases │
//! └────────────┘ └──────────────┘      └──────┬───────┘
//!                                              ▲
//!                               ┌──────────────┴──────┐
//!                               │ generation service  │
//!                               │ + scheduler loop    │
//!                               └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and timestamp helpers |
//! | [`fingerprint`] | Content fingerprints |
//! | [`ingest`] | Source and IOC upsert with dedup |
//! | [`scoring`] | Scoring writer |
//! | [`evidence`] | Ranked evidence queries |
//! | [`stix`] | STIX bundle import |
//! | [`collection_sync`] | TAXII collection sync |
//! | [`journal`] | Generation job journal |
//! | [`generation`] | Generation enqueue and running set |
//! | [`scheduler`] | Auto refresh and stale recovery |
//! | [`rate_limit`] | Write admission gate |
//! | [`server`] | HTTP API |

pub mod actors;
pub mod collection_sync;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod evidence;
pub mod fingerprint;
pub mod generation;
pub mod ingest;
pub mod journal;
pub mod migrate;
pub mod models;
pub mod rate_limit;
pub mod scheduler;
pub mod scoring;
pub mod server;
pub mod stix;
pub mod traits;
