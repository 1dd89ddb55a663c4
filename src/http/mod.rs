//! HTTP surface for the rate limiting service.
//!
//! Derives a client key from each request, asks the rate limiter for a
//! decision, and translates it into `X-RateLimit-*` headers and a JSON body.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{build_router, client_key, AppState};
