//! Project manifests
//!
//! A project directory carries a JSON manifest whose `scripts.start` entry is
//! the command that brings the project up.

pub mod manifest;

pub use manifest::Manifest;
