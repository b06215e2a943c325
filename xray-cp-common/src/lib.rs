//! Shared types and utilities for the XRAY control plane.
//!
//! This crate holds the data model, the closed error catalog, the typed
//! configuration surface, the install-log redactor, and the configuration
//! renderer. It has no SSH, queue, or workflow logic of its own — that lives
//! in `xray-cpd`, which depends on this crate.

pub mod config;
pub mod errors;
pub mod redact;
pub mod render;
pub mod types;

pub use errors::{AppError, ErrorKind};
pub use types::{
    Host, HostId, HostStatus, Job, JobId, JobLogLine, JobResult, JobStatus, JobType, LogLevel,
    Secret, SecretId, SecretKind, User, XrayInstance,
};
