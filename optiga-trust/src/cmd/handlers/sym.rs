//! EncryptSym / DecryptSym: block ciphers, MACs, HMAC verification and
//! clearing the auto state, with internal chaining and strict sequences.

use std::convert::TryFrom;

use super::super::apdu::{self, ApduWriter, CMD_DECRYPT_SYM, CMD_ENCRYPT_SYM, TLV_HEADER_SIZE};
use super::super::state_machine::ProcessStep;
use super::{ApduHandler, HandlerContext};
use crate::{
    OptigaStatus, SymOperation, SymParams, SymSequence, OPTIGA_CMD_SYM_MAX_INDATA_LENGTH,
    OPTIGA_KEY_ID_SESSION_BASED, RESET_SEQUENCE,
};

pub const TAG_ASSOCIATED_DATA: u8 = 0x40;
pub const TAG_IV: u8 = 0x41;
pub const TAG_TOTAL_DATA_LENGTH: u8 = 0x42;
pub const TAG_VERIFICATION_DATA: u8 = 0x43;
pub const TAG_OUT_DATA: u8 = 0x61;

/// Key OID, sequence byte and data length
const FIXED_HEADER_LENGTH: u16 = (TLV_HEADER_SIZE + 2) as u16;
const SESSION_OID_LENGTH: u16 = 2;

impl SymParams {
    pub(crate) fn start(&mut self, decrypt: bool) {
        self.decrypt = decrypt;
        self.sent_length = 0;
        self.current_sequence = RESET_SEQUENCE;
        if let Some(out) = self.out_data.as_mut() {
            out.clear();
        }
    }

    fn in_data_length(&self) -> u32 {
        self.in_data.len() as u32
    }

    fn remaining_length(&self) -> u32 {
        self.in_data_length() - self.sent_length
    }

    fn is_hmac_verify(&self) -> bool {
        self.decrypt && self.mode.is_hmac()
    }

    fn is_final(&self) -> bool {
        self.current_sequence == SymSequence::StartFinal as u8
            || self.current_sequence == SymSequence::Final as u8
    }

    fn is_first(&self) -> bool {
        self.current_sequence == SymSequence::StartFinal as u8
            || self.current_sequence == SymSequence::Start as u8
    }

    /// In-data bytes besides the payload; 0 when the optional fields leave no room
    pub(crate) fn header_length(&self) -> u16 {
        let mut length = 0usize;
        let first = self.sequence == SymSequence::StartFinal || self.sequence == SymSequence::Start;
        if first && self.current_sequence == RESET_SEQUENCE {
            if !self.iv.is_empty() {
                length += TLV_HEADER_SIZE + self.iv.len();
            }
            if !self.associated_data.is_empty() {
                length += TLV_HEADER_SIZE + self.associated_data.len();
            }
            if self.total_input_length != 0 {
                length += TLV_HEADER_SIZE + 2;
            }
            if !self.generated_hmac.is_empty() {
                length +=
                    TLV_HEADER_SIZE + self.generated_hmac.len() + SESSION_OID_LENGTH as usize;
            }
        }
        let block = self.remaining_length().min(self.mode.block_size() as u32) as usize;
        let fixed = FIXED_HEADER_LENGTH as usize;
        if fixed + block + length > OPTIGA_CMD_SYM_MAX_INDATA_LENGTH as usize {
            0
        } else {
            (length + fixed) as u16
        }
    }

    /// Payload per APDU, a whole number of cipher blocks
    pub(crate) fn max_packet_length(&self, header_length: u16) -> u32 {
        let available = OPTIGA_CMD_SYM_MAX_INDATA_LENGTH.saturating_sub(header_length);
        let block = self.mode.block_size();
        match available / block {
            0 => self.remaining_length(),
            blocks => (blocks * block) as u32,
        }
    }

    /// Sequence byte of the next APDU, splitting a START_FINAL or FINAL over several APDUs
    pub(crate) fn next_sequence(&mut self, packet_length: u32, max_packet_length: u32) -> u8 {
        let length = self.in_data_length();
        let last = length == self.sent_length + packet_length;
        let next = match self.current_sequence {
            RESET_SEQUENCE => (match self.sequence {
                SymSequence::StartFinal if length <= max_packet_length => SymSequence::StartFinal,
                SymSequence::StartFinal => SymSequence::Start,
                SymSequence::Final if self.sent_length == 0 && length <= max_packet_length => {
                    SymSequence::Final
                }
                SymSequence::Final => SymSequence::Continue,
                other => other,
            }) as u8,
            s if s == SymSequence::Start as u8 => {
                if self.sequence == SymSequence::StartFinal && last {
                    SymSequence::Final as u8
                } else {
                    SymSequence::Continue as u8
                }
            }
            s if s == SymSequence::Continue as u8 => {
                let splitting = self.sequence == SymSequence::StartFinal
                    || self.sequence == SymSequence::Final;
                if splitting && last {
                    SymSequence::Final as u8
                } else {
                    s
                }
            }
            s => s,
        };
        self.current_sequence = next;
        next
    }

    fn clear_out(&mut self) {
        if let Some(out) = self.out_data.as_mut() {
            out.clear();
        }
    }

    fn write_apdu(&mut self, ctx: &HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        if self.in_data.len() > u32::MAX as usize {
            return Err(OptigaStatus::CmdInvalidInput);
        }
        let header_length = self.header_length();
        if header_length == 0 {
            return Err(OptigaStatus::CmdInvalidInput);
        }
        let max_packet_length = self.max_packet_length(header_length);
        if self.is_hmac_verify() && max_packet_length < self.in_data_length() {
            return Err(OptigaStatus::CmdInvalidInput);
        }
        let length_to_send = u16::try_from(max_packet_length.min(self.remaining_length()))
            .map_err(|_| OptigaStatus::CmdInvalidInput)?;

        let key_oid = if self.key_oid == OPTIGA_KEY_ID_SESSION_BASED
            && self.mode.is_hmac()
            && !self.decrypt
        {
            ctx.session_oid
        } else {
            self.key_oid
        };
        let cmd = if self.decrypt {
            CMD_DECRYPT_SYM
        } else {
            CMD_ENCRYPT_SYM
        };
        let mut writer = ApduWriter::new(cmd, self.mode as u8);
        writer.put_u16(key_oid)?;
        let sequence = self.next_sequence(length_to_send as u32, max_packet_length);
        writer.put_u8(sequence)?;
        if self.is_hmac_verify() {
            writer.put_u16(length_to_send + SESSION_OID_LENGTH)?;
            writer.put_u16(ctx.session_oid)?;
        } else {
            writer.put_u16(length_to_send)?;
        }
        let start = self.sent_length as usize;
        writer.put_slice(&self.in_data[start..start + length_to_send as usize])?;
        self.sent_length += length_to_send as u32;

        if self.is_first() {
            if !self.iv.is_empty() {
                writer.put_tlv(TAG_IV, &self.iv)?;
            }
            if !self.associated_data.is_empty() {
                writer.put_tlv(TAG_ASSOCIATED_DATA, &self.associated_data)?;
            }
            if self.total_input_length != 0 {
                writer.put_tag_u16(TAG_TOTAL_DATA_LENGTH, self.total_input_length)?;
            }
            if self.decrypt && !self.generated_hmac.is_empty() {
                writer.put_tlv(TAG_VERIFICATION_DATA, &self.generated_hmac)?;
            }
        }
        Ok(writer.finish())
    }
}

impl ApduHandler for SymParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        ctx.chaining = false;
        let apdu = self.write_apdu(ctx);
        if apdu.is_err() {
            self.clear_out();
        }
        apdu
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        ctx.chaining = false;
        if self.operation == SymOperation::ClearAutoState {
            ctx.step = ProcessStep::ReleaseSession;
            if apdu::response_failed(response) {
                ctx.enter_on_device_error = false;
                return Err(OptigaStatus::CmdError);
            }
            return Ok(());
        }
        if apdu::response_failed(response) {
            ctx.enter_on_device_error = false;
            self.clear_out();
            if self.is_hmac_verify() {
                ctx.step = ProcessStep::ReleaseSession;
            }
            return Err(OptigaStatus::CmdError);
        }
        if self.is_hmac_verify() {
            // verified; the session holding the secret is given back
            ctx.step = ProcessStep::ReleaseSession;
            return Ok(());
        }

        let is_final = self.is_final();
        let mut out_data: &[u8] = &[];
        if !self.mode.is_mac() || is_final {
            match apdu::read_tlv(response, apdu::APDU_INDATA_OFFSET) {
                Ok((TAG_OUT_DATA, value)) => out_data = value,
                _ => {
                    self.clear_out();
                    return Err(OptigaStatus::CmdError);
                }
            }
        }
        let mac_mode = self.mode.is_mac();
        if let Some(out) = self.out_data.as_mut() {
            if out.len() + out_data.len() > out.capacity() {
                if is_final && mac_mode {
                    // a MAC may be truncated to the caller's buffer
                    out_data = &out_data[..out.capacity() - out.len()];
                } else {
                    out.clear();
                    return Err(OptigaStatus::CmdMemoryInsufficient);
                }
            }
            out.append(out_data)?;
        }

        if self.in_data_length() != self.sent_length {
            ctx.chaining = true;
        } else if is_final {
            ctx.step = ProcessStep::ReleaseLock;
        } else {
            // the strict lock stays with this instance until the final sequence
            ctx.step = ProcessStep::Exit;
            ctx.keep_strict_lock = true;
        }
        Ok(())
    }
}
