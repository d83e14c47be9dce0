//! Core modules of the logmend repair pipeline.
//!
//! Everything the outer surfaces (CLI, navigator) depend on lives here.
//! The flow through the pipeline mirrors the module list: a log enters the
//! codec, the scanner classifies defects over the DAG, the engine plans
//! operations, a persistence backend applies them, and the materializer
//! replays the event stream back into a current view.
//!
//! ## Module Overview
//!
//! - **`record`**: tolerant line codec; byte-identical round-trips
//! - **`content`**: pure validation of tool-result blocks
//! - **`logfile`**: verbatim-preserving log reader/writer
//! - **`dag`**: parent/child index, classification, cycle detection
//! - **`scanner`**: the three-kind defect taxonomy with counters
//! - **`engine`**: deterministic, idempotent repair planning
//! - **`persist`**: the five-operation backend contract
//! - **`file_backend`** / **`event_backend`**: the two implementations
//! - **`schemas`** / **`event_store`**: append-only repair event store
//! - **`materialize`**: event replay plus the TTL view cache
//! - **`suggest`**: ranked parent candidates for orphan reattachment
//! - **`manager`**: the preview/confirm/undo façade
//! - **`error`**: canonical error type for all logmend operations

pub mod audit;
pub mod config;
pub mod content;
pub mod dag;
pub mod engine;
pub mod error;
pub mod event_backend;
pub mod event_store;
pub mod file_backend;
pub mod logfile;
pub mod manager;
pub mod materialize;
pub mod output;
pub mod persist;
pub mod record;
pub mod scanner;
pub mod schemas;
pub mod suggest;
pub mod time;
