//! Read named registers from electricity meters over Modbus RTU and TCP
//!
//! Every supported meter model is described by a register table (defs/registers/*.yaml)
//! mapping field names like `voltage_l1_n` to register address, width, type and scale.
//! A MeterClient combines such a table with a transport and turns reads of field
//! names into Modbus requests and decoded, scaled values.

pub mod config;
pub mod error;
pub mod meter;
pub mod registers;
pub mod transport;

// Re-export common types for easier access
pub use config::{Config, ConnectionConfig, MeterConfig};
pub use error::{CommunicationError, DecodeError, MeterError};
pub use meter::{MeterClient, Readings};
#[cfg(feature = "async-tcp")]
pub use meter::AsyncMeterClient;
pub use registers::{get_register_table, ByteOrder, DataType, RegisterCatalog, RegisterKind, RegisterSpec, RegisterTable};
pub use transport::{Endpoint, MemoryTransport, Parity, Transport};
