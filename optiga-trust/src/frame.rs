//! CRC16 and the frame layouts of the I2C data link and the UART binding.

use super::{OptigaStatus, DL_HEADER_SIZE};

/// Folds one byte into the running CRC16
pub fn crc16_update(seed: u16, byte: u8) -> u16 {
    let h1 = (seed ^ byte as u16) & 0xFF;
    let h2 = h1 & 0x0F;
    let h3 = (h2 << 4) ^ h1;
    let h4 = h3 >> 4;

    (((((h3 << 1) ^ h4) << 4) ^ h2) << 3) ^ h4 ^ (seed >> 8)
}

/// CRC16 of a byte sequence, seed 0
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, byte| crc16_update(crc, *byte))
}

/// Hex dump used by the trace logs
pub(crate) fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<String>>()
        .join(" ")
}

pub const FRAME_TYPE_CONTROL: u8 = 0x80;
const SEQCTR_MASK: u8 = 0x60;
const SEQCTR_OFFSET: u8 = 5;
const FRNR_MASK: u8 = 0x0C;
const FRNR_OFFSET: u8 = 2;
const ACKNR_MASK: u8 = 0x03;

/// Sequence control field of the control byte
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SeqCtr {
    Ack = 0x00,
    Nack = 0x01,
    Resync = 0x02,
    Rfu = 0x03,
}

impl From<u8> for SeqCtr {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0x00 => SeqCtr::Ack,
            0x01 => SeqCtr::Nack,
            0x02 => SeqCtr::Resync,
            _ => SeqCtr::Rfu,
        }
    }
}

/// Decoded data link control byte
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ControlByte {
    pub control_frame: bool,
    pub seqctr: SeqCtr,
    pub frame_nr: u8,
    pub ack_nr: u8,
}

impl ControlByte {
    pub fn pack(&self) -> u8 {
        let frame_type = if self.control_frame {
            FRAME_TYPE_CONTROL
        } else {
            0x00
        };
        frame_type
            | ((self.seqctr as u8) << SEQCTR_OFFSET) & SEQCTR_MASK
            | (self.frame_nr << FRNR_OFFSET) & FRNR_MASK
            | self.ack_nr & ACKNR_MASK
    }

    pub fn unpack(byte: u8) -> ControlByte {
        ControlByte {
            control_frame: byte & FRAME_TYPE_CONTROL != 0,
            seqctr: SeqCtr::from((byte & SEQCTR_MASK) >> SEQCTR_OFFSET),
            frame_nr: (byte & FRNR_MASK) >> FRNR_OFFSET,
            ack_nr: byte & ACKNR_MASK,
        }
    }
}

/// Builds `[control][len BE][payload][crc16 BE]`
pub fn encode_dl_frame(control: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + DL_HEADER_SIZE);
    frame.push(control);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Payload length announced in a received frame header
pub fn dl_payload_length(frame: &[u8]) -> u16 {
    if frame.len() < 3 {
        return 0;
    }
    u16::from_be_bytes([frame[1], frame[2]])
}

/// Checks the CRC trailer, taken from the last two received bytes
pub fn dl_crc_valid(frame: &[u8]) -> bool {
    if frame.len() < DL_HEADER_SIZE {
        return false;
    }
    let crc_offset = frame.len() - 2;
    crc16(&frame[..crc_offset]) == u16::from_be_bytes([frame[crc_offset], frame[crc_offset + 1]])
}

pub const UART_START_SEQUENCE: [u8; 4] = [0xBE, 0xEF, 0xDE, 0xAD];
pub const UART_HEADER_SIZE: usize = 6;
pub const UART_MAX_FRAME_SIZE: usize = 2000 - 2;
pub const UART_MAX_PAYLOAD_SIZE: usize = UART_MAX_FRAME_SIZE - 8;
/// Length value sent by the peer when it failed the exchange
pub const UART_ERROR_LENGTH: u16 = 0xFFFF;

/// Builds `BE EF DE AD [len BE][payload][crc16 BE]`, CRC covering header and payload
pub fn encode_uart_frame(payload: &[u8]) -> Result<Vec<u8>, OptigaStatus> {
    if payload.len() > UART_MAX_PAYLOAD_SIZE {
        return Err(OptigaStatus::CommsInvalidInput);
    }
    let mut frame = Vec::with_capacity(payload.len() + UART_HEADER_SIZE + 2);
    frame.extend_from_slice(&UART_START_SEQUENCE);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Validates a received UART header and returns the announced payload length
pub fn decode_uart_header(header: &[u8]) -> Result<usize, OptigaStatus> {
    if header.len() < UART_HEADER_SIZE || header[..4] != UART_START_SEQUENCE {
        return Err(OptigaStatus::CommsError);
    }
    let length = u16::from_be_bytes([header[4], header[5]]);
    if length == UART_ERROR_LENGTH || length as usize > UART_MAX_PAYLOAD_SIZE {
        return Err(OptigaStatus::CommsError);
    }
    Ok(length as usize)
}

/// Checks the trailer of a complete UART frame and returns its payload
pub fn decode_uart_frame(frame: &[u8]) -> Result<&[u8], OptigaStatus> {
    let length = decode_uart_header(frame)?;
    let crc_offset = UART_HEADER_SIZE + length;
    if frame.len() < crc_offset + 2 {
        return Err(OptigaStatus::CommsError);
    }
    let received = u16::from_be_bytes([frame[crc_offset], frame[crc_offset + 1]]);
    if received != crc16(&frame[..crc_offset]) {
        return Err(OptigaStatus::CommsError);
    }
    Ok(&frame[UART_HEADER_SIZE..crc_offset])
}
