//! # nsbox-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire nsbox workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and knows nothing about syscalls; the types here describe
//! *what* a container launch asks for, while `nsbox-core` and
//! `nsbox-runtime` decide *how* the kernel is asked for it.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod spec;
pub mod types;
pub mod units;
