//! ORL Faces dataset partitioning and caching, with two reference classifiers trained on it.

pub mod data;
pub mod dataset;
pub mod error;
pub mod model;
pub mod training;

pub use error::{OrlFacesError, Result};
