//! APDU codec helpers.
//!
//! Command layout: `[cmd][param][length BE][in-data]`, response layout:
//! `[status][undefined][length BE][out-data]`. In-data fields are mostly
//! `[tag][length BE][value]` triplets.

use super::super::{OptigaStatus, OPTIGA_CMD_APDU_HEADER_SIZE, OPTIGA_MAX_COMMS_BUFFER_SIZE};

pub const APDU_STATUS_SUCCESS: u8 = 0x00;
pub const APDU_STATUS_FAILURE: u8 = 0xFF;
/// Offset of in-data in a command and of out-data in a response
pub const APDU_INDATA_OFFSET: usize = OPTIGA_CMD_APDU_HEADER_SIZE;
/// Size of a tag plus its 2 byte length
pub const TLV_HEADER_SIZE: usize = 3;

/// Command bytes
pub const CMD_GET_DATA_OBJECT: u8 = 0x81;
/// Get data object without clearing the read object (used for the last error code)
pub const CMD_GET_DATA_OBJECT_NO_CLEAR: u8 = 0x01;
pub const CMD_SET_DATA_OBJECT: u8 = 0x82;
pub const CMD_SET_OBJECT_PROTECTED: u8 = 0x83;
pub const CMD_GET_RANDOM: u8 = 0x8C;
pub const CMD_ENCRYPT_SYM: u8 = 0x94;
pub const CMD_DECRYPT_SYM: u8 = 0x95;
pub const CMD_ENCRYPT_ASYM: u8 = 0x9E;
pub const CMD_DECRYPT_ASYM: u8 = 0x9F;
pub const CMD_CALC_HASH: u8 = 0xB0;
pub const CMD_CALC_SIGN: u8 = 0xB1;
pub const CMD_VERIFY_SIGN: u8 = 0xB2;
pub const CMD_CALC_SSEC: u8 = 0xB3;
pub const CMD_DERIVE_KEY: u8 = 0xB4;
pub const CMD_GEN_KEYPAIR: u8 = 0xB8;
pub const CMD_GEN_SYMKEY: u8 = 0xB9;
pub const CMD_OPEN_APPLICATION: u8 = 0xF0;
pub const CMD_CLOSE_APPLICATION: u8 = 0xF1;

/// Bounds-checked writer building one command APDU.
///
/// Every `put_*` fails with `CmdMemoryInsufficient` instead of writing past
/// the capacity; nothing is handed out before [`ApduWriter::finish`].
#[derive(Debug)]
pub struct ApduWriter {
    buffer: Vec<u8>,
    capacity: usize,
}

impl ApduWriter {
    pub fn new(cmd: u8, param: u8) -> ApduWriter {
        ApduWriter::with_capacity(cmd, param, OPTIGA_MAX_COMMS_BUFFER_SIZE)
    }

    pub fn with_capacity(cmd: u8, param: u8, capacity: usize) -> ApduWriter {
        let mut buffer = Vec::with_capacity(capacity.min(OPTIGA_MAX_COMMS_BUFFER_SIZE));
        buffer.extend_from_slice(&[cmd, param, 0x00, 0x00]);
        ApduWriter { buffer, capacity }
    }

    /// Length of the in-data written so far
    pub fn len(&self) -> usize {
        self.buffer.len() - APDU_INDATA_OFFSET
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes still available for in-data
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    fn reserve(&mut self, size: usize) -> Result<(), OptigaStatus> {
        if size > self.remaining() {
            Err(OptigaStatus::CmdMemoryInsufficient)
        } else {
            Ok(())
        }
    }

    pub fn put_u8(&mut self, value: u8) -> Result<&mut ApduWriter, OptigaStatus> {
        self.reserve(1)?;
        self.buffer.push(value);
        Ok(self)
    }

    pub fn put_u16(&mut self, value: u16) -> Result<&mut ApduWriter, OptigaStatus> {
        self.reserve(2)?;
        self.buffer.extend_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<&mut ApduWriter, OptigaStatus> {
        self.reserve(data.len())?;
        self.buffer.extend_from_slice(data);
        Ok(self)
    }

    /// `[tag][length BE][value]`
    pub fn put_tlv(&mut self, tag: u8, value: &[u8]) -> Result<&mut ApduWriter, OptigaStatus> {
        if value.len() > u16::MAX as usize {
            return Err(OptigaStatus::CmdMemoryInsufficient);
        }
        self.reserve(TLV_HEADER_SIZE + value.len())?;
        self.put_tag_header(tag, value.len() as u16)?;
        self.put_slice(value)
    }

    pub fn put_tag_header(&mut self, tag: u8, length: u16) -> Result<&mut ApduWriter, OptigaStatus> {
        self.reserve(TLV_HEADER_SIZE)?;
        self.buffer.push(tag);
        self.buffer.extend_from_slice(&length.to_be_bytes());
        Ok(self)
    }

    /// Tag with a 2 byte big endian value, e.g. an OID
    pub fn put_tag_u16(&mut self, tag: u8, value: u16) -> Result<&mut ApduWriter, OptigaStatus> {
        self.put_tlv(tag, &value.to_be_bytes())
    }

    pub fn put_tag_u8(&mut self, tag: u8, value: u8) -> Result<&mut ApduWriter, OptigaStatus> {
        self.put_tlv(tag, &[value])
    }

    /// Tag with zero length, used as a flag
    pub fn put_tag_empty(&mut self, tag: u8) -> Result<&mut ApduWriter, OptigaStatus> {
        self.put_tag_header(tag, 0)
    }

    /// Writes the in-data length into the header and hands out the APDU
    pub fn finish(mut self) -> Vec<u8> {
        let length = (self.len() as u16).to_be_bytes();
        self.buffer[2] = length[0];
        self.buffer[3] = length[1];
        self.buffer
    }
}

/// A response is failed when its status byte is `0xFF` or it has no header
pub fn response_failed(response: &[u8]) -> bool {
    response.len() < APDU_INDATA_OFFSET || response[0] == APDU_STATUS_FAILURE
}

/// Out-data of a response, without the header
pub fn response_data(response: &[u8]) -> &[u8] {
    response.get(APDU_INDATA_OFFSET..).unwrap_or(&[])
}

pub fn read_u16(buffer: &[u8], offset: usize) -> Result<u16, OptigaStatus> {
    match buffer.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(OptigaStatus::CmdError),
    }
}

/// Value of the TLV starting at `offset`, checked against the buffer
pub fn read_tlv(buffer: &[u8], offset: usize) -> Result<(u8, &[u8]), OptigaStatus> {
    let tag = *buffer.get(offset).ok_or(OptigaStatus::CmdError)?;
    let length = read_u16(buffer, offset + 1)? as usize;
    let start = offset + TLV_HEADER_SIZE;
    buffer
        .get(start..start + length)
        .map(|value| (tag, value))
        .ok_or(OptigaStatus::CmdError)
}
