//! Partitioned aggregation-and-load pipeline for minute-resolution sensor
//! data: reads raw samples per calendar day, buckets them into fixed windows
//! with per-metric statistics, reshapes them into long form, resolves signal
//! ids and appends the result to ClickHouse.

pub mod config;
pub mod health;
pub mod migrate;
pub mod partition;
pub mod pipeline;
pub mod schedule;
pub mod signal;
pub mod source;
pub mod store;
