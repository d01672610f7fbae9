use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use log::{debug, info};
use rmodbus::ModbusProto;
use serialport::{ClearBuffer, SerialPort};

use crate::error::CommunicationError;
use crate::registers::RegisterKind;
use super::{frame, Parity, Transport};

/// Modbus RTU on a serial line, 8 data bits and 1 stop bit
pub struct RtuTransport {
    path: String,
    baudrate: u32,
    parity: Parity,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

impl RtuTransport {
    pub fn new(path: &str, baudrate: u32, parity: Parity, timeout: Duration) -> Self {
        return RtuTransport {
            path: path.to_string(),
            baudrate,
            parity,
            timeout,
            port: None,
        };
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>, CommunicationError> {
        info!("Opening serial port {} with {} baud, parity {}", self.path, self.baudrate, self.parity);
        let port = serialport::new(self.path.as_str(), self.baudrate)
            .timeout(self.timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(self.parity.into())
            .open()?;
        Ok(port)
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, CommunicationError> {
        if self.port.is_none() {
            self.port = Some(self.open_port()?);
        }
        let port = match self.port.as_mut() {
            Some(p) => p,
            None => return Err(CommunicationError::Io(ErrorKind::NotConnected.into())),
        };

        /* answers to earlier, timed out requests must not be taken for ours */
        port.clear(ClearBuffer::Input)?;
        port.write_all(request)?;
        port.flush()?;

        let mut response = vec![0u8; frame::RTU_HEAD_LEN];
        port.read_exact(&mut response)?;
        let len = frame::rtu_frame_len(&response)?;
        response.resize(len, 0);
        port.read_exact(&mut response[frame::RTU_HEAD_LEN..])?;

        Ok(response)
    }
}

impl Transport for RtuTransport {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        if self.port.is_none() {
            self.port = Some(self.open_port()?);
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
        let (mreq, request) = frame::build_request(ModbusProto::Rtu, slave_id, kind, address, count)?;
        debug!("{} slave {slave_id} reading {kind:?} {address}+{count}", self.path);

        let response = self.exchange(&request).map_err(|e| match e {
            CommunicationError::Io(io) if io.kind() == ErrorKind::TimedOut => CommunicationError::Timeout(self.timeout),
            other => other,
        })?;

        /* checks slave id, function and crc */
        frame::parse_registers(&mreq, ModbusProto::Rtu, &response, count)
    }
}
