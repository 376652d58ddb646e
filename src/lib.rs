// Library for the daemon and tests

pub mod backup;
pub mod clock;
pub mod collector;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod error_capture;
pub mod health;
pub mod models;
pub mod retry;
pub mod routes;
pub mod store;
pub mod sysinfo_repo;
pub mod version;
pub mod window;
pub mod worker;
