//! # cairn-core
//! Foundation types, constants and collaborator traits for the cairn engine.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
pub mod weight;
