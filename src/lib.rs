//! # masmon
//!
//! Core library for monitoring and controlling a magic-angle spinning (MAS)
//! probe controller over TCP. The controller speaks a line-oriented protocol
//! with every byte shifted into the high half of the byte range; this crate
//! implements that protocol, a polling/command session loop, and a bounded
//! history of the measured spin rate with durable logging. Display is left to
//! whatever frontend consumes the session's event channel - the `masmon`
//! binary ships a headless one.
//!
//! ## Module overview
//!
//! - **`protocol`**: the wire codec (scrambled ASCII framing) and the command
//!   table that validates every outgoing command's code and arity.
//! - **`connection`**: one TCP session with the controller - lock-step
//!   send/receive with a wall-clock reply timeout and a connectivity
//!   self-test.
//! - **`session`**: the concurrency core. A loop that owns the connection,
//!   forwards queued operator commands, polls for status, recovers from
//!   transient timeouts in place, and surfaces dead connections to the
//!   operator as an explicit reconnect handshake.
//! - **`history`**: bounded time series of (timestamp, spin rate) samples
//!   with masked gap markers, amortized compaction/growth, range queries for
//!   plotting, and full/incremental persistence to timestamped log files.
//! - **`config`**: discovery and parsing of the spectrometer's legacy
//!   configuration inputs (command table, controller address symbols, plot
//!   ranges).
//! - **`error`**: the central [`MasError`] type.

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod protocol;
pub mod session;

pub use error::{MasError, MasResult};
