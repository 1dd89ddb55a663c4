//! Tollgate - In-memory Rate Limiting Service
//!
//! This crate enforces a per-key request quota over a time window. Two
//! interchangeable algorithms, fixed window and sliding window log, keep
//! their accounting in a concurrent store whose entries expire and are
//! swept in the background. A small HTTP surface derives the key from each
//! request and reports decisions through `X-RateLimit-*` headers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
