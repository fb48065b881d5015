//! Output writers.

pub mod csv;
