use std::collections::HashMap;
use log::debug;

use crate::error::CommunicationError;
use crate::registers::RegisterKind;
use super::{frame, Transport};

/// One read as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub slave_id: u8,
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
}

/// Register image held in memory, answers like a meter would.
///
/// Reading a register that was never set fails with the Modbus exception
/// "illegal data address" (0x02).
#[derive(Debug, Default)]
pub struct MemoryTransport {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    requests: Vec<Request>,
    fail_after: Option<usize>,
    connected: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store consecutive holding registers starting at address
    pub fn set(&mut self, address: u16, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            self.holding.insert(address.wrapping_add(i as u16), *w);
        }
    }

    pub fn set_input(&mut self, address: u16, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            self.input.insert(address.wrapping_add(i as u16), *w);
        }
    }

    /// Let every read after the given number of successful ones fail
    pub fn fail_after(&mut self, reads: usize) {
        self.fail_after = Some(reads);
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        self.connected = true;
        Ok(())
    }

    fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, CommunicationError> {
        /* same limits as a real request */
        frame::check_request(address, count)?;

        if let Some(limit) = self.fail_after {
            if self.requests.len() >= limit {
                return Err(CommunicationError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "simulated link failure",
                )));
            }
        }

        self.connected = true;
        self.requests.push(Request { slave_id, kind, address, count });
        debug!("Memory read slave {slave_id} {kind:?} {address}+{count}");

        let image = match kind {
            RegisterKind::Holding => &self.holding,
            RegisterKind::Input => &self.input,
        };

        let mut words = Vec::with_capacity(usize::from(count));
        for a in u32::from(address)..u32::from(address) + u32::from(count) {
            match image.get(&(a as u16)) {
                Some(w) => words.push(*w),
                None => return Err(CommunicationError::Exception(0x02)),
            }
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_image() {
        let mut t = MemoryTransport::new();
        t.set(100, &[1, 2, 3]);
        t.set_input(100, &[9]);

        assert_eq!(t.read_registers(1, RegisterKind::Holding, 101, 2).unwrap(), vec![2, 3]);
        assert_eq!(t.read_registers(1, RegisterKind::Input, 100, 1).unwrap(), vec![9]);
        assert_eq!(
            t.requests()[0],
            Request { slave_id: 1, kind: RegisterKind::Holding, address: 101, count: 2 }
        );
        assert_eq!(t.requests().len(), 2);
    }

    #[test]
    fn test_missing_register_is_exception() {
        let mut t = MemoryTransport::new();
        t.set(100, &[1]);
        let result = t.read_registers(1, RegisterKind::Holding, 100, 2);
        assert!(matches!(result, Err(CommunicationError::Exception(0x02))));
    }

    #[test]
    fn test_fail_after() {
        let mut t = MemoryTransport::new();
        t.set(0, &[1, 2]);
        t.fail_after(1);
        assert!(t.read_registers(1, RegisterKind::Holding, 0, 1).is_ok());
        assert!(matches!(
            t.read_registers(1, RegisterKind::Holding, 1, 1),
            Err(CommunicationError::Io(_))
        ));
    }

    #[test]
    fn test_request_limits() {
        let mut t = MemoryTransport::new();
        assert!(matches!(
            t.read_registers(1, RegisterKind::Holding, 0, 126),
            Err(CommunicationError::InvalidRequest(_))
        ));
        assert!(t.requests().is_empty());
    }
}
