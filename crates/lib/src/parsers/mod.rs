//! Small text parsers: plan-line tokenization and bootloader
//! configuration rewriting.

pub(crate) mod grub_cfg;
pub(crate) mod plan_line;
