//! Idempotent synchronization and reconciliation engine for Amazon
//! marketplace settlements posted to Zoho Books.

pub mod config;
pub mod models;
pub mod services;
