//! Domain layer: data model, observable state, pulse timing and settings.

pub mod models;
pub mod pulse;
pub mod settings;
pub mod signal;
