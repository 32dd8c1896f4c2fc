#![warn(missing_docs)]
#![allow(unused_crate_dependencies)]

//! Library entry point exposing the project's modules for reuse in the binary
//! and integration tests.

pub mod auth;
pub mod cloud;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod ollama;
pub mod placement;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod serializer;

pub use routes::AppState;
