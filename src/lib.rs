//! Read and rotate versioned secrets across secret stores and stamp them
//! into Kubernetes manifests.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod deadline;
pub mod error;
pub mod manifest;
pub mod paging;
pub mod template;
pub mod writer;

pub use error::{Error, Result};
