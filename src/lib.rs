//! Incremental artifact cache for server-side rendering pipelines.

pub mod cache;
pub mod commands;
pub mod config;
pub mod infra;
