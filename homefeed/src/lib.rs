// Library interface for homefeed modules
// This allows tests and the binaries to import modules

pub mod actions;
pub mod composer;
pub mod controller;
pub mod error;
pub mod executor;
pub mod membership;
pub mod model;
pub mod overlay;
pub mod store;
