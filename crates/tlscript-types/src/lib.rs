#![forbid(unsafe_code)]
#![doc = "Error types shared by the tlscript workspace."]

pub mod error;

pub use error::*;
