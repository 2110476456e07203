//! Program loading and process creation.

pub mod elf;
pub mod process;
