//! Domain layer sitting between the HTTP surface and persistence.

pub mod commands;
pub mod credentials;
pub mod devices;
pub mod liveness;
pub mod sessions;
