pub mod crossover;
pub mod indicators;

#[cfg(test)]
mod indicators_tests;

pub use crossover::*;
pub use indicators::*;
