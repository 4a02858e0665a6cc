//! Background loops spawned alongside the HTTP listeners.

pub mod leases;
pub mod liveness;
pub mod sessions;
