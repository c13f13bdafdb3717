//! Transport capability traits.
//!
//! The alignment loop never talks to a serial port or a VISA session
//! directly. Instead it depends on two narrow transport traits and lets the
//! process wiring decide what stands behind them: real adapters in the lab,
//! the mocks from [`crate::hardware::mock`] everywhere else.
//!
//! # Design
//!
//! Each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses `AlignResult` for errors
//! - Focuses on ONE transport
//!
//! # Thread Safety
//! All methods take `&self`; implementations use interior mutability
//! (Mutex/RwLock) for connection state.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::AlignResult;

/// Capability: grouped register transport to a servo chain.
///
/// Models the sync-write / sync-read transactions of a daisy-chained servo
/// bus. One transaction addresses many device ids at a single register
/// address, and the whole transaction either reaches the wire or none of it
/// does.
///
/// # Contract
/// - `grouped_write` must stage every frame before transmitting anything; a
///   staging failure leaves the bus untouched.
/// - `grouped_read` returns one raw little-endian value per requested id;
///   a missing id is the implementation's error to report.
/// - Register addresses and field widths come from the caller, the bus is
///   layout-agnostic.
#[async_trait]
pub trait ActuatorBus: Send + Sync {
    /// Open the underlying port.
    async fn open(&self) -> AlignResult<()>;

    /// Close the underlying port.
    async fn close(&self) -> AlignResult<()>;

    /// Write `width`-byte values to register `reg` on several devices in
    /// one transaction. Each frame is `(device id, little-endian bytes)`.
    async fn grouped_write(&self, reg: u8, width: u8, frames: &[(u8, Vec<u8>)])
        -> AlignResult<()>;

    /// Read `width` bytes from register `reg` on several devices in one
    /// transaction.
    async fn grouped_read(
        &self,
        reg: u8,
        width: u8,
        ids: &[u8],
    ) -> AlignResult<HashMap<u8, Vec<u8>>>;

    /// Write a `width`-byte value to register `reg` on a single device.
    async fn single_write(&self, id: u8, reg: u8, width: u8, value: u32) -> AlignResult<()>;
}

/// Capability: text-command instrument session.
///
/// Models a message-based instrument link (SCPI over VISA or socket). The
/// sampler composes command strings; the session moves them.
///
/// # Contract
/// - `query` returns the instrument's reply with line terminators stripped.
/// - `query_binary` performs a block transfer and hands back decoded
///   numeric points; scaling to instrument units is the implementation's
///   job.
#[async_trait]
pub trait InstrumentIo: Send + Sync {
    /// Open the session.
    async fn connect(&self) -> AlignResult<()>;

    /// Close the session.
    async fn close(&self) -> AlignResult<()>;

    /// Send a command, no reply expected.
    async fn write(&self, command: &str) -> AlignResult<()>;

    /// Send a command and read a text reply.
    async fn query(&self, command: &str) -> AlignResult<String>;

    /// Send a command and read a binary block reply as numeric points.
    async fn query_binary(&self, command: &str) -> AlignResult<Vec<f64>>;
}
