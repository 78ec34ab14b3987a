//! CLI subcommands

pub mod cancel;
pub mod create;
pub mod result;
pub mod status;
pub mod workflows;
