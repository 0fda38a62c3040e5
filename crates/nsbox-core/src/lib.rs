//! # nsbox-core
//!
//! Low-level Linux isolation primitives for the nsbox runtime.
//!
//! This crate provides safe abstractions over:
//! - **Privilege**: the up-front elevation check.
//! - **Namespaces**: PID, mount, network, UTS, and IPC isolation requested
//!   in a single `clone(2)`.
//! - **Cgroups v2**: memory and CPU limiting behind a narrow backend trait.
//! - **Filesystem**: the ordered `pivot_root(2)` jail with a private `/proc`.
//! - **Signals**: forwarding host signals to the container's PID 1.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod privilege;
pub mod signal;
