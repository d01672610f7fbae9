use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use log::{debug, info, warn};
use rmodbus::ModbusProto;

use crate::error::CommunicationError;
use crate::registers::RegisterKind;
use super::{frame, Transport};

/// Modbus TCP over a blocking socket.
///
/// The socket is opened on the first read and kept for the following ones. Any
/// I/O error drops it, the next read connects again.
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        return TcpTransport {
            host: host.to_string(),
            port,
            timeout,
            stream: None,
        };
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn open_stream(&self) -> Result<TcpStream, CommunicationError> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    let _ = stream.set_nodelay(true);
                    info!("Connected to Modbus TCP {addr}");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed to connect to {addr}: {e}");
                    last_error = Some(e);
                }
            }
        }

        let e = last_error.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, format!("{} does not resolve", self.host))
        });
        Err(self.io_error(e))
    }

    fn io_error(&self, e: std::io::Error) -> CommunicationError {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => CommunicationError::Timeout(self.timeout),
            _ => CommunicationError::Io(e),
        }
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, CommunicationError> {
        if self.stream.is_none() {
            self.stream = Some(self.open_stream()?);
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(CommunicationError::Io(ErrorKind::NotConnected.into())),
        };

        stream.write_all(request)?;

        let mut response = vec![0u8; frame::TCP_HEADER_LEN];
        stream.read_exact(&mut response)?;
        let len = frame::tcp_frame_len(&response)?;
        response.resize(len, 0);
        stream.read_exact(&mut response[frame::TCP_HEADER_LEN..])?;

        Ok(response)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        if self.stream.is_none() {
            self.stream = Some(self.open_stream()?);
        }
        Ok(())
    }

    fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError> {
        let (mreq, request) = frame::build_request(ModbusProto::TcpUdp, slave_id, kind, address, count)?;
        debug!("{}:{} slave {slave_id} reading {kind:?} {address}+{count}", self.host, self.port);

        let response = match self.exchange(&request) {
            Ok(r) => r,
            Err(e) => {
                /* the stream may hold half a frame now, start over next time */
                self.stream = None;
                return Err(match e {
                    CommunicationError::Io(io) => self.io_error(io),
                    other => other,
                });
            }
        };

        frame::parse_registers(&mreq, ModbusProto::TcpUdp, &response, count)
    }
}
