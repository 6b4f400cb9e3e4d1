//! Database module for PostgreSQL persistence.

mod pool;
pub mod procedures;
mod rows;

pub use pool::*;
pub use rows::*;
