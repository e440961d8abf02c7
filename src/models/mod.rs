//! # Models
//!
//! The item factor analysis model and the matrix helpers it shares.

pub mod ifa;
pub mod matrix_ops;
