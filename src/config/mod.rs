//! Process-wide driver configuration (spec §3, §4.6, §4.7).

mod config;

pub use config::*;
