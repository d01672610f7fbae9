use std::fmt;
use std::time::Duration;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{CommunicationError, MeterError};
use crate::registers::RegisterKind;

pub mod frame;
pub mod memory;
pub mod tcp;
#[cfg(feature = "rtu")]
pub mod rtu;
#[cfg(feature = "async-tcp")]
pub mod tcp_async;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
#[cfg(feature = "rtu")]
pub use rtu::RtuTransport;
#[cfg(feature = "async-tcp")]
pub use tcp_async::AsyncTcpTransport;

/// Capability a meter client needs from the Modbus link.
///
/// Implementations own the connection, the client only asks for blocks of
/// consecutive 16 bit registers.
pub trait Transport {
    /// Open the link, implementations also connect on the first read
    fn connect(&mut self) -> Result<(), CommunicationError>;

    fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        (**self).connect()
    }

    fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError> {
        (**self).read_registers(slave_id, kind, address, count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        };
        write!(f, "{s}")
    }
}

/// Fully resolved connection parameters of one meter
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
        timeout: Duration,
    },
    Rtu {
        port: String,
        baudrate: u32,
        parity: Parity,
        timeout: Duration,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port, .. } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Rtu { port, baudrate, parity, .. } => write!(f, "{port}@{baudrate} ({parity})"),
        }
    }
}

/// Create the transport for an endpoint, nothing is opened until the first read
pub fn open(endpoint: &Endpoint) -> Result<Box<dyn Transport>, MeterError> {
    info!("Using Modbus endpoint {endpoint}");
    match endpoint {
        Endpoint::Tcp { host, port, timeout } => {
            return Ok(Box::new(TcpTransport::new(host, *port, *timeout)));
        }
        #[cfg(feature = "rtu")]
        Endpoint::Rtu { port, baudrate, parity, timeout } => {
            return Ok(Box::new(RtuTransport::new(port, *baudrate, *parity, *timeout)));
        }
        #[cfg(not(feature = "rtu"))]
        Endpoint::Rtu { port, .. } => {
            return Err(MeterError::config(format!(
                "Serial port {port} requested but serial support is not compiled in"
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let tcp = Endpoint::Tcp { host: "10.0.0.5".into(), port: 502, timeout: Duration::from_secs(2) };
        assert_eq!(tcp.to_string(), "tcp://10.0.0.5:502");

        let rtu = Endpoint::Rtu {
            port: "/dev/ttyUSB0".into(),
            baudrate: 38400,
            parity: Parity::Even,
            timeout: Duration::from_millis(500),
        };
        assert_eq!(rtu.to_string(), "/dev/ttyUSB0@38400 (even)");
    }

    #[test]
    fn test_open_tcp_is_lazy() {
        /* nothing listens there, creating the transport must still work */
        let endpoint = Endpoint::Tcp { host: "127.0.0.1".into(), port: 1, timeout: Duration::from_millis(100) };
        assert!(open(&endpoint).is_ok());
    }

    #[test]
    fn test_boxed_transport() {
        let mut memory = MemoryTransport::new();
        memory.set(10, &[7, 8]);
        let mut boxed: Box<dyn Transport> = Box::new(memory);
        boxed.connect().unwrap();
        assert_eq!(boxed.read_registers(1, RegisterKind::Holding, 10, 2).unwrap(), vec![7, 8]);
    }
}
