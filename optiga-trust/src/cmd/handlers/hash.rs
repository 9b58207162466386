//! CalcHash: host data in chained APDUs, data object content, or intermediate
//! context import/export.

use super::super::apdu::{self, ApduWriter, CMD_CALC_HASH, TLV_HEADER_SIZE};
use super::{ApduHandler, HandlerContext};
use crate::{
    CalcHashParams, HashSequence, HashType, OptigaStatus, OPTIGA_CMD_APDU_HEADER_SIZE,
    OPTIGA_MAX_COMMS_BUFFER_SIZE,
};

/// Tag of an intermediate context, in and out
pub const TAG_INTERMEDIATE_CONTEXT: u8 = 0x06;
/// Requests the intermediate context in the response
pub const TAG_CONTEXT_OUT: u8 = 0x07;
/// Tag of the final digest in the response
pub const TAG_DIGEST_OUT: u8 = 0x01;
/// Added to the sequence tag when the data comes from a data object
pub const TAG_OID_DATA: u8 = 0x10;

/// Data fitting in one APDU next to the sequence header and both context headers
pub const HASH_APPARENT_BUFFER_SIZE: u32 =
    (OPTIGA_MAX_COMMS_BUFFER_SIZE - (OPTIGA_CMD_APDU_HEADER_SIZE + 3 * TLV_HEADER_SIZE)) as u32;

pub fn digest_length(hash_type: HashType) -> u16 {
    match hash_type {
        HashType::Sha256 => 0x20,
    }
}

impl CalcHashParams {
    pub(crate) fn start(&mut self) {
        self.data_sent = 0;
        self.apparent_context_size = self.context.as_ref().map_or(0, |c| c.len() as u16);
    }

    fn data_length(&self) -> u32 {
        self.data.as_ref().map_or(0, |d| d.len() as u32)
    }

    /// A START_FINAL over more data than one APDU holds becomes START, CONTINUE.., FINAL
    pub(crate) fn current_sequence(&self) -> u8 {
        let length = self.data_length();
        if self.sequence != HashSequence::StartFinal || length <= HASH_APPARENT_BUFFER_SIZE {
            return self.sequence as u8;
        }
        if self.data_sent == 0 {
            HashSequence::Start as u8
        } else if self.data_sent + HASH_APPARENT_BUFFER_SIZE < length {
            HashSequence::Continue as u8
        } else {
            HashSequence::Final as u8
        }
    }
}

impl ApduHandler for CalcHashParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        self.current_sequence = self.current_sequence();
        ctx.chaining = false;
        let mut writer = ApduWriter::new(CMD_CALC_HASH, self.hash_type as u8);

        if let Some(data) = &self.data {
            let budget = HASH_APPARENT_BUFFER_SIZE - self.apparent_context_size as u32;
            let chunk = budget.min(data.len() as u32 - self.data_sent) as usize;
            let start = self.data_sent as usize;
            writer.put_tlv(self.current_sequence, &data[start..start + chunk])?;
            self.data_sent += chunk as u32;
            if self.data_sent != data.len() as u32 {
                ctx.chaining = true;
            }
        } else if let Some((oid, offset, length)) = self.data_object {
            writer.put_tag_header(self.current_sequence | TAG_OID_DATA, 6)?;
            writer.put_u16(oid)?.put_u16(offset)?.put_u16(length)?;
        } else {
            writer.put_tag_empty(self.current_sequence)?;
        }

        if self.apparent_context_size != 0 {
            if let Some(context) = &self.context {
                writer.put_tlv(TAG_INTERMEDIATE_CONTEXT, context)?;
            }
            self.apparent_context_size = 0;
        }
        if self.export_context.is_some() && !ctx.chaining {
            writer.put_tag_empty(TAG_CONTEXT_OUT)?;
        }
        Ok(writer.finish())
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        if apdu::response_failed(response) {
            ctx.enter_on_device_error = false;
            return Err(OptigaStatus::CmdError);
        }
        if ctx.chaining {
            return Ok(());
        }
        if let Some(digest) = self.digest.as_mut() {
            let (tag, value) = apdu::read_tlv(response, apdu::APDU_INDATA_OFFSET)?;
            if tag != TAG_DIGEST_OUT || value.len() != digest_length(self.hash_type) as usize {
                return Err(OptigaStatus::CmdError);
            }
            digest.fill(value)?;
        } else if let Some(export) = self.export_context.as_mut() {
            let (tag, value) = apdu::read_tlv(response, apdu::APDU_INDATA_OFFSET)?;
            if tag != TAG_INTERMEDIATE_CONTEXT {
                return Err(OptigaStatus::CmdError);
            }
            export.fill(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ok_response, with_context};
    use super::*;
    use crate::OutBuffer;

    #[test]
    fn long_start_final_is_split() {
        let length = 2 * HASH_APPARENT_BUFFER_SIZE as usize + 10;
        let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::StartFinal);
        params.data = Some(vec![0x61; length]);
        params.start();
        let mut sequences = Vec::new();
        let mut hashed = 0;
        with_context(0, |ctx| loop {
            let apdu = params.prepare(ctx).unwrap();
            assert!(apdu.len() <= OPTIGA_MAX_COMMS_BUFFER_SIZE);
            sequences.push(apdu[4]);
            hashed += u16::from_be_bytes([apdu[5], apdu[6]]) as usize;
            if !ctx.chaining {
                break;
            }
        });
        assert_eq!(sequences, vec![0x00, 0x02, 0x03]);
        assert_eq!(hashed, length);
    }

    #[test]
    fn short_start_final_digest() {
        let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::StartFinal);
        params.data = Some(b"abc".to_vec());
        params.digest = Some(OutBuffer::with_capacity(32));
        params.start();
        with_context(0, |ctx| {
            let apdu = params.prepare(ctx).unwrap();
            assert_eq!(apdu, vec![0xB0, 0xE2, 0x00, 0x06, 0x01, 0x00, 0x03, 0x61, 0x62, 0x63]);
            let mut out = vec![TAG_DIGEST_OUT, 0x00, 0x20];
            out.extend_from_slice(&[0x5A; 32]);
            params.process_response(ctx, &ok_response(&out)).unwrap();
        });
        assert_eq!(params.digest.unwrap().as_slice(), &[0x5A; 32][..]);
    }

    #[test]
    fn context_import_and_export() {
        let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::Continue);
        params.data = Some(vec![1, 2]);
        params.context = Some(vec![0xC0; 4]);
        params.export_context = Some(OutBuffer::with_capacity(4));
        params.start();
        with_context(0, |ctx| {
            let apdu = params.prepare(ctx).unwrap();
            assert_eq!(
                &apdu[4..],
                &[0x02, 0x00, 0x02, 1, 2, 0x06, 0x00, 0x04, 0xC0, 0xC0, 0xC0, 0xC0, 0x07, 0x00, 0x00]
            );
            // larger than the export buffer
            assert_eq!(
                params.process_response(ctx, &ok_response(&[0x06, 0x00, 0x05, 1, 2, 3, 4, 5])),
                Err(OptigaStatus::CmdMemoryInsufficient)
            );
        });
        assert!(params.export_context.unwrap().is_empty());
    }

    #[test]
    fn hash_data_object() {
        let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::StartFinal);
        params.data_object = Some((0xE0E1, 0x0000, 0x0100));
        params.start();
        let apdu = with_context(0, |ctx| params.prepare(ctx).unwrap());
        assert_eq!(
            &apdu[4..],
            &[0x11, 0x00, 0x06, 0xE0, 0xE1, 0x00, 0x00, 0x01, 0x00]
        );
    }
}
