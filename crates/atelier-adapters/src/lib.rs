//! Infrastructure adapters for atelier: configuration and credential
//! resolution. Everything network-facing lives in atelier-engine.

pub mod config;

pub use config::Config;
