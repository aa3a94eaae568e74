//! Configuration and logging shared by the relais binary, its engine and its tests.

pub mod config;
pub mod logging;
