use rmodbus::{client::ModbusRequest, ModbusProto};

use crate::error::CommunicationError;
use crate::registers::{RegisterKind, MAX_REGISTERS_PER_READ};

/// MBAP header of a Modbus TCP frame
pub const TCP_HEADER_LEN: usize = 6;
/// Slave id, function code and byte count (or exception code) of an RTU answer
pub const RTU_HEAD_LEN: usize = 3;

/// Reject reads the protocol cannot express
pub fn check_request(address: u16, count: u16) -> Result<(), CommunicationError> {
    if count == 0 || count > MAX_REGISTERS_PER_READ {
        return Err(CommunicationError::InvalidRequest(format!(
            "{count} registers requested, a read is limited to 1..={MAX_REGISTERS_PER_READ}"
        )));
    }
    if u32::from(address) + u32::from(count) > 0x1_0000 {
        return Err(CommunicationError::InvalidRequest(format!(
            "{count} registers starting at {address} exceed the address space"
        )));
    }

    Ok(())
}

/// Build the request frame, the returned ModbusRequest is needed to parse the answer
pub fn build_request(
    proto: ModbusProto,
    slave_id: u8,
    kind: RegisterKind,
    address: u16,
    count: u16,
) -> Result<(ModbusRequest, Vec<u8>), CommunicationError> {
    check_request(address, count)?;

    let mut mreq = ModbusRequest::new(slave_id, proto);
    let mut request = Vec::new();
    let result = match kind {
        RegisterKind::Holding => mreq.generate_get_holdings(address, count, &mut request),
        RegisterKind::Input => mreq.generate_get_inputs(address, count, &mut request),
    };
    result.map_err(CommunicationError::Modbus)?;
    return Ok((mreq, request));
}

/// Full length of a TCP answer, taken from the length field of its header
pub fn tcp_frame_len(header: &[u8]) -> Result<usize, CommunicationError> {
    if header.len() < TCP_HEADER_LEN {
        return Err(CommunicationError::Modbus(rmodbus::ErrorKind::FrameBroken));
    }
    if header[2] != 0 || header[3] != 0 {
        return Err(CommunicationError::Modbus(rmodbus::ErrorKind::FrameBroken));
    }
    let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    if len < 3 {
        return Err(CommunicationError::Modbus(rmodbus::ErrorKind::FrameBroken));
    }
    Ok(TCP_HEADER_LEN + len)
}

/// Full length of an RTU answer, CRC included
pub fn rtu_frame_len(head: &[u8]) -> Result<usize, CommunicationError> {
    if head.len() < RTU_HEAD_LEN {
        return Err(CommunicationError::Modbus(rmodbus::ErrorKind::FrameBroken));
    }
    if head[1] & 0x80 != 0 {
        /* slave, function, exception code, crc */
        return Ok(5);
    }
    Ok(RTU_HEAD_LEN + usize::from(head[2]) + 2)
}

/// Exception code of an answer, if it is one
pub fn exception_code(proto: ModbusProto, response: &[u8]) -> Option<u8> {
    let (func, code) = match proto {
        ModbusProto::TcpUdp => (response.get(7)?, response.get(8)?),
        _ => (response.get(1)?, response.get(2)?),
    };
    if func & 0x80 != 0 {
        return Some(*code);
    }
    None
}

/// Check the answer against the request and extract the register values
pub fn parse_registers(
    mreq: &ModbusRequest,
    proto: ModbusProto,
    response: &[u8],
    count: u16,
) -> Result<Vec<u16>, CommunicationError> {
    if let Some(code) = exception_code(proto, response) {
        return Err(CommunicationError::Exception(code));
    }

    let mut data = Vec::new();
    mreq.parse_u16(response, &mut data).map_err(CommunicationError::Modbus)?;

    if data.len() < usize::from(count) {
        return Err(CommunicationError::Modbus(rmodbus::ErrorKind::FrameBroken));
    }
    data.truncate(usize::from(count));
    Ok(data)
}

/// Answer a TCP request the way a meter would, with the given register values
#[cfg(test)]
pub(crate) fn tcp_answer(request: &[u8], values: &[u16]) -> Vec<u8> {
    let mut answer = Vec::new();
    answer.extend_from_slice(&request[0..4]);
    answer.extend_from_slice(&(3 + 2 * values.len() as u16).to_be_bytes());
    answer.push(request[6]);
    answer.push(request[7]);
    answer.push((values.len() * 2) as u8);
    for v in values {
        answer.extend_from_slice(&v.to_be_bytes());
    }
    answer
}

#[cfg(test)]
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// RTU frame from slave id, function code and payload, CRC appended low byte first
#[cfg(test)]
pub(crate) fn rtu_frame(slave_id: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![slave_id, function];
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Answer an RTU request the way a meter would, with the given register values
#[cfg(test)]
pub(crate) fn rtu_answer(request: &[u8], values: &[u16]) -> Vec<u8> {
    let mut payload = vec![(values.len() * 2) as u8];
    for v in values {
        payload.extend_from_slice(&v.to_be_bytes());
    }
    rtu_frame(request[0], request[1], &payload)
}
