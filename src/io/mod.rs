//! Ensemble interchange formats.

pub mod json;

pub use json::{addtree_from_json, addtree_from_reader, addtree_to_json, addtree_to_writer};
