pub mod config;
pub mod factory;
pub mod models;
pub mod repositories;
pub mod routes;
pub mod services;
