pub mod atom_table;
pub mod client;
pub mod config;
pub mod error;
pub mod ground_model;
pub mod model;
pub mod page_store;
pub mod protocol;
pub mod readiness;
pub mod reasoner;
pub mod server;
pub mod session;
pub mod term;

pub use error::*;
