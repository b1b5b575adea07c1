//! Platform-specific register tables for probe resolution.
//!
//! Maps DWARF register numbers to the register names the kernel tracer
//! accepts in probe argument descriptors.

pub mod register_mapping;

pub use register_mapping::{dwarf_reg_to_name, dwarf_reg_to_name_x86_64};
