//! Coordinator test utilities and end-to-end scenarios.

pub mod utils;

mod admission;
mod evaluation;
