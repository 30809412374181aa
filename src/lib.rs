pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod pki;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod tenancy;
pub mod tenant_models;
pub mod tenant_schema;
pub mod workers;

pub use workers::{default_handlers, JobExecution, JobHandler, Worker};
