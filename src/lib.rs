//! Floodgate - Multi-Strategy Request Rate Limiting
//!
//! This crate decides, per incoming request, whether to admit, queue or reject
//! it. Named policies bind a limiting strategy (fixed window, sliding window,
//! token bucket or concurrency) to a partition key such as the client address,
//! and the [`gate::Gate`] enforces them in front of request handlers.

pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod ratelimit;
