//! Adapters: Postgres source, in-process command bus, HTTP surface, telemetry.

pub mod bus;
pub mod db;
pub mod error;
pub mod http;
pub mod telemetry;
