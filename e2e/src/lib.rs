//! Scenario tests running a real proxy between raw-socket clients and
//! thread-based mock backends
pub mod http_utils;
pub mod mock;

#[cfg(test)]
mod tests;

/// read size of mock clients and backends
pub const BUFFER_SIZE: usize = 4096;
