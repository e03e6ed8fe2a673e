//! scriptlink
//!
//! Bridges a desktop workspace to script-execution devices. The daemon and
//! orchestration live in the workspace crates; this crate is the headless
//! front end driven over stdin/stdout.

pub mod headless;

pub use headless::runner::run_headless;
