//! Core data model
//!
//! Process identity, registry records, cache entries and the process tree

pub mod models;
pub mod process_tree;
pub mod version;
