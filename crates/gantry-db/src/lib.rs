//! Data layer for gantry: the in-memory transactional object store, the
//! entity definitions, and the algebraic types of resolved test
//! definitions.
//!
//! All cluster state lives here; it is rebuilt from git and the artifact
//! store on restart, so nothing is persisted.

pub mod bitstring;
pub mod defs;
pub mod models;
pub mod schema;
pub mod store;

pub use schema::{Database, GantryStore};
pub use store::{Id, IndexKey, Store, Table};
