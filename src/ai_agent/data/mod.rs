pub mod cache;
pub mod models;
pub mod provider;
