//! CLI Commands

pub mod browser;
pub mod case;
pub mod config;
pub mod project;
pub mod run;
pub mod step;
