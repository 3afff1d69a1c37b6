//! Loyalty Control - command-line client for the loyalty engine
//!
//! Opens the engine database directly; the daemon only needs to run for
//! scheduled credits to be applied without an explicit `sweep`.

pub mod cli;
pub mod commands;
pub mod output;
