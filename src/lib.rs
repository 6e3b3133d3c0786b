pub mod client;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod fleet;
pub mod geo_math;
pub mod models;
pub mod route;
pub mod schedule;
pub mod session;
pub mod termination;
