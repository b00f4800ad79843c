pub mod action;
pub mod change;
pub mod domain;
pub mod error;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
