//! Agent relay core: run lifecycle, model streaming and the HTTP API.

pub mod cli;
pub mod config;
pub mod events;
pub mod model;
pub mod router;
pub mod run_manager;
pub mod settings_store;
