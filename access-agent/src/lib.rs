//! Access-log ingestion agent.
//!
//! Tails an nginx-style access log, parses each appended line on a pool of parser workers and
//! forwards the resulting points to InfluxDB (or a local file) on a pool of sink workers. A
//! single monitor task aggregates lifecycle events and serves them over HTTP.

pub mod config;
pub mod influx_client;
pub mod metrics;
pub mod monitor;
pub mod output_writer;
pub mod parsers;
pub mod pipeline;
pub mod record;
pub mod runner;
pub mod status_server;
pub mod tailer;
