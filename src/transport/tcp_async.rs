use std::future::Future;
use std::time::Duration;
use log::{debug, info};
use rmodbus::ModbusProto;
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::TcpStream, time::timeout};

use crate::error::CommunicationError;
use crate::registers::RegisterKind;
use super::frame;

/// Modbus TCP on tokio, every connect, write and read is bounded by the timeout
pub struct AsyncTcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl AsyncTcpTransport {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        return AsyncTcpTransport {
            host: host.to_string(),
            port,
            timeout,
            stream: None,
        };
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn bounded<F, T>(limit: Duration, f: F) -> Result<T, CommunicationError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match timeout(limit, f).await {
            Ok(r) => Ok(r?),
            Err(_) => Err(CommunicationError::Timeout(limit)),
        }
    }

    pub async fn connect(&mut self) -> Result<(), CommunicationError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.host, self.port);
        let stream = Self::bounded(self.timeout, TcpStream::connect(addr.as_str())).await?;
        let _ = stream.set_nodelay(true);
        info!("Connected to Modbus TCP {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, CommunicationError> {
        self.connect().await?;
        let limit = self.timeout;
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(CommunicationError::Io(std::io::ErrorKind::NotConnected.into())),
        };

        Self::bounded(limit, stream.write_all(request)).await?;

        let mut response = vec![0u8; frame::TCP_HEADER_LEN];
        Self::bounded(limit, stream.read_exact(&mut response)).await?;
        let len = frame::tcp_frame_len(&response)?;
        response.resize(len, 0);
        Self::bounded(limit, stream.read_exact(&mut response[frame::TCP_HEADER_LEN..])).await?;

        Ok(response)
    }

    pub async fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError> {
        let (mreq, request) = frame::build_request(ModbusProto::TcpUdp, slave_id, kind, address, count)?;
        debug!("{}:{} slave {slave_id} reading {kind:?} {address}+{count}", self.host, self.port);

        let response = match self.exchange(&request).await {
            Ok(r) => r,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };

        frame::parse_registers(&mreq, ModbusProto::TcpUdp, &response, count)
    }
}
