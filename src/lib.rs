//! Downloader Compatibility Layer
//!
//! Lets the downloader run on restricted mobile hosts that lack named
//! semaphores, shared memory or process creation, and whose descriptors,
//! sockets and standard input misbehave.
//!
//! # Architecture
//!
//! [`bootstrap`] brings the layer up once, in this order:
//! - [`diagnostic`] - turns off the host's descriptor-misuse abort
//! - [`probe`] - functional trial of each primitive category
//! - [`registry`] - substitutes emulations for missing categories and hands
//!   out every primitive ([`sync`], [`process`], [`shm`])
//! - [`tracker`] - resource tracker, neutralized once anything is emulated
//! - [`io`] - socket, URL-fetch and file-open provider
//! - [`stdin`] - always-empty standard input
//!
//! Downstream code receives the resulting [`CompatContext`] and creates its
//! locks, queues, processes and pools through [`CapabilityRegistry`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod bootstrap;
pub mod check;
pub mod config;
pub mod diagnostic;
pub mod io;
pub mod probe;
pub mod process;
pub mod registry;
pub mod shm;
pub mod stdin;
pub mod sync;
pub mod tracker;

// Re-export commonly used types
pub use bootstrap::{Bootstrap, BootstrapError, CapabilityReport, CompatContext, initialize};
pub use config::CompatConfig;
#[cfg(unix)]
pub use diagnostic::close_descriptor;
pub use diagnostic::{DiagnosticOutcome, disable_descriptor_diagnostic, export_diagnostic_env};
pub use io::{FaultClass, FileMode, IoFault, IoProvider};
pub use probe::{CapabilityProbe, Category, probe};
pub use registry::{Backing, CapabilityRegistry, PatchRecord, RegistryBuilder};
pub use stdin::{InputStream, NullStdin, StdinPolicy};
pub use sync::Acquire;
