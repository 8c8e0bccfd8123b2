//! airlab-core: Core library for the AirLab collector
//!
//! Turns whatever an AirLab air-quality sensor publishes on an MQTT broker
//! into one validated, timestamped reading in SQLite.
//!
//! # Architecture
//!
//! ```text
//! MQTT broker → BusClient → mpsc queue → EpisodeController
//!                                             ↓
//!                               Normalizer (shapes, aliases)
//!                                             ↓
//!                        merged Reading → Validator → ReadingStore (SQLite)
//! ```
//!
//! # Modules
//!
//! - `metric`: Canonical metric set, plausibility ranges and field aliases
//! - `reading`: Partial/merged reading type
//! - `normalize`: Payload shapes and the normalizer
//! - `validate`: Range validation
//! - `bus`: Bus abstraction and in-process loopback bus
//! - `mqtt`: `rumqttc`-backed bus
//! - `episode`: Bounded collection episode state machine
//! - `storage`: SQLite schema and durable writer
//! - `retry`: Retry policy for storage contention
//! - `collector`: Single-shot pipeline
//! - `discover`: Raw traffic inspection
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error taxonomy and exit codes
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bus;
pub mod collector;
pub mod config;
pub mod discover;
pub mod episode;
pub mod error;
pub mod logging;
pub mod metric;
pub mod mqtt;
pub mod normalize;
pub mod reading;
pub mod retry;
pub mod storage;
pub mod validate;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
