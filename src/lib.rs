//! Palisade - In-Process Abuse Mitigation
//!
//! This crate implements an embedded abuse-mitigation accounting service: it
//! decides, for a named action performed by an identified caller, whether
//! the attempt is allowed right now, and enforces temporary blocking when a
//! caller exceeds its attempt budget within a sliding window. It owns no
//! network or storage surface; hosts call it synchronously before performing
//! a sensitive operation (login, registration, upload, fetch).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use palisade::config::PalisadeConfig;
//! use palisade::ratelimit::{LimiterEngine, Sweeper};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     tracing_subscriber::fmt().init();
//!
//!     let config = PalisadeConfig::default();
//!     let engine = Arc::new(LimiterEngine::from_config(&config));
//!     let _sweeper = Sweeper::spawn(engine.clone(), config.sweep.period());
//!
//!     let decision = engine.check("auth.login", "203.0.113.7");
//!     if !decision.allowed {
//!         // Surface decision.message (and engine.headers(..)) to the caller.
//!     }
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
