// === Public Modules (The Canonical Paths) ===
pub mod bus;
pub mod cosim;
pub mod engine;
pub mod error;
pub mod eval;
pub mod hardware;
pub mod ir;
pub mod logger;

// === Private Implementation Details ===
mod macros;

// === Convenience ===
pub mod config;
pub mod prelude;
