//! Core engine for incremental song-metadata ingestion.
//!
//! This crate provides the pieces behind `songpipe`:
//!
//! - A fixed, typed row schema for song metadata (`schema` module).
//! - A permissive tab-separated parser producing Arrow batches
//!   (`parse` module).
//! - An append-only, versioned commit log with optimistic concurrency
//!   control (`commit_log` module), shared by the table and the checkpoint.
//! - An append-only song table stored as Parquet segments (`table` module).
//! - A durable processed-file checkpoint with a run lock (`checkpoint` module).
//! - The incremental loader tying them together (`loader` module).
//! - Derived views evaluated on demand with Arrow kernels (`views` module).
//!
//! Query-engine and CLI crates depend on this crate rather than
//! re-implementing storage or ingestion logic.
#![deny(missing_docs)]
pub mod checkpoint;
pub mod commit_log;
pub mod loader;
pub mod parse;
pub mod schema;
pub mod storage;
pub mod table;
pub mod views;
