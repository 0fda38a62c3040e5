//! Container supervision for nsbox: launch pipeline, child bootstrap,
//! exit-status mirroring, and resource reporting.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bootstrap;
pub mod lifecycle;
pub mod metrics;
pub mod process;
pub mod report;
pub mod supervisor;
pub mod workload;

pub use report::RunReport;
pub use supervisor::Supervisor;
