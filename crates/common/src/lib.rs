//! Shared building blocks for askql crates.
//!
//! - **Configuration**: strongly typed application configuration (`config`).
//! - **Resilience**: circuit breakers and retry with backoff (`circuit_breaker`, `retry`).
//! - **Models**: query, catalog, audit and snapshot types (`models`).
//! - **Retrieval**: the schema index collaborator (`index`).
//! - **Persistence ports**: traits implemented by `askql-store` (`store`).
//! - **Privacy**: result masking and log scrubbing (`masking`, `scrubber`).
//! - **Telemetry**: optional OTLP layer (`telemetry`).
pub mod circuit_breaker;
pub mod config;
pub mod index;
pub mod masking;
pub mod models;
pub mod retry;
pub mod scrubber;
pub mod store;
pub mod telemetry;
