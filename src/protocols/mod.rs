//! Application protocols run by the worker pool.
//!
//! - `echo`: echoes every byte back, for throughput and integrity testing
//! - `ping`: line-based ping/pong, for health checks and latency testing

pub mod echo;
pub mod ping;
