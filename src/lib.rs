//! Reel Ingest Library
//!
//! Video upload ingestion: chunked uploads that are merged on request,
//! streaming direct uploads, and a sweeper for abandoned chunks. The HTTP
//! server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Chunk store, merger, direct receiver, classifier and sweeper
//! - `routes`: HTTP endpoints
//! - `jobs`: Processing hand-off for finished artifacts

pub mod config;
pub mod jobs;
pub mod routes;
pub mod state;
pub mod upload;
