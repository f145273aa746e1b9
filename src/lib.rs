//! The air-side control bridge's multiplexing engine, exposed as a library
//! so `main.rs` stays a thin wrapper and the engine itself is unit-testable
//! against mock [`transport::RadioLink`]/[`serial::SerialLink`]
//! implementations, the same way an MSP client library drives its parser
//! against an injected `Box<dyn SerialPort>`.

pub mod beacon;
pub mod config;
pub mod dedup;
pub mod downlink;
pub mod engine;
pub mod error;
pub mod framing;
pub mod hostmetrics;
pub mod rc_encode;
pub mod rc_shm;
pub mod seq;
pub mod serial;
pub mod transport;

pub use config::{Args, Config};
pub use engine::Engine;
pub use error::{DbError, DbResult};
