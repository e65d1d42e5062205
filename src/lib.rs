//! Parallel chunked loader for vehicle telemetry files
//!
//! Lines from a delimited file are decoded into [`models::VehicleRecord`]s,
//! batched into fixed-size chunks and bulk-written to a [`sink::RecordSink`]
//! by several lanes running side by side under a concurrency cap.

pub mod chunk;
pub mod config;
pub mod database;
pub mod errors;
pub mod lane;
pub mod lifecycle;
pub mod models;
pub mod scheduler;
pub mod sink;
pub mod source;
