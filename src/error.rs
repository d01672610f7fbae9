use std::time::Duration;
use thiserror::Error;

use crate::registers::DataType;

#[derive(Error, Debug)]
pub enum MeterError {
    /* Unknown model, broken definition or config file */
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Register {0} is not available on this meter")]
    UnknownField(String),
    #[error("Failed to decode register {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: DecodeError,
    },
    #[error("Communication error: {0}")]
    Communication(#[from] CommunicationError),
}

impl MeterError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MeterError::Configuration(msg.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} registers, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("{data_type} does not fit in {length} registers")]
    WidthMismatch { data_type: DataType, length: u16 },
}

#[derive(Error, Debug)]
pub enum CommunicationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Modbus frame error: {0:?}")]
    Modbus(rmodbus::ErrorKind),
    #[error("Device answered with Modbus exception {0:#04x}")]
    Exception(u8),
    #[cfg(feature = "rtu")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
