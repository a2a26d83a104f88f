//! Core of the gantry CI control plane.
//!
//! Subsystems, leaves first: the git cache ([`git`]), the definition
//! resolver ([`resolve`]), the machine-category controller ([`machines`]),
//! the test manager/scheduler ([`manager`]), the worker execution engine
//! ([`worker`]), and the thin artifact-storage adapter ([`artifacts`]).
//! The typed object store and entity model live in `gantry-db`.

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod git;
pub mod glob;
pub mod machines;
pub mod manager;
pub mod proto;
pub mod resolve;
pub mod scm;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{ManagerConfig, TestManager};
pub use resolve::{DefinitionResolver, ResolveError};
