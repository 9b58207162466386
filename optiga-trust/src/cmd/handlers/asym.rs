//! RSA EncryptAsym / DecryptAsym.

use super::super::apdu::{self, ApduWriter, CMD_DECRYPT_ASYM, CMD_ENCRYPT_ASYM};
use super::{ApduHandler, HandlerContext};
use crate::{DecryptAsymParams, EncryptAsymParams, OptigaStatus, PublicKeySource};

pub const TAG_MESSAGE: u8 = 0x61;
pub const TAG_SESSION_OID: u8 = 0x02;
pub const TAG_DECRYPT_KEY: u8 = 0x03;
pub const TAG_PUBLIC_KEY_OID: u8 = 0x04;
pub const TAG_ALGORITHM: u8 = 0x05;
pub const TAG_PUBLIC_KEY: u8 = 0x06;

/// Copies the message TLV of a response into `out`, clearing it on failure
fn copy_message(out: &mut crate::OutBuffer, response: &[u8]) -> Result<(), OptigaStatus> {
    let copied = apdu::read_tlv(response, apdu::APDU_INDATA_OFFSET)
        .and_then(|(_, message)| out.fill(message));
    if copied.is_err() {
        out.clear();
    }
    copied
}

impl EncryptAsymParams {
    fn write_in_data(&self, writer: &mut ApduWriter, session_oid: u16) -> Result<(), OptigaStatus> {
        match &self.message {
            Some(message) => writer.put_tlv(TAG_MESSAGE, message)?,
            None => writer.put_tag_u16(TAG_SESSION_OID, session_oid)?,
        };
        match &self.public_key {
            PublicKeySource::Oid(oid) => writer.put_tag_u16(TAG_PUBLIC_KEY_OID, *oid)?,
            PublicKeySource::Host(algorithm, key) => writer
                .put_tag_u8(TAG_ALGORITHM, *algorithm as u8)?
                .put_tlv(TAG_PUBLIC_KEY, key)?,
        };
        Ok(())
    }
}

impl ApduHandler for EncryptAsymParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_ENCRYPT_ASYM, self.scheme as u8);
        if let Err(status) = self.write_in_data(&mut writer, ctx.session_oid) {
            self.encrypted.clear();
            return Err(status);
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
            self.encrypted.clear();
            return Err(OptigaStatus::CmdError);
        }
        copy_message(&mut self.encrypted, response)
    }
}

impl ApduHandler for DecryptAsymParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_DECRYPT_ASYM, self.scheme as u8);
        writer.put_tlv(TAG_MESSAGE, &self.message)?;
        writer.put_tag_u16(TAG_DECRYPT_KEY, self.private_key_oid)?;
        if self.decrypted.is_none() {
            writer.put_tag_u16(TAG_SESSION_OID, ctx.session_oid)?;
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
            if let Some(decrypted) = self.decrypted.as_mut() {
                decrypted.clear();
            }
            return Err(OptigaStatus::CmdError);
        }
        match self.decrypted.as_mut() {
            Some(decrypted) => copy_message(decrypted, response),
            None => Ok(()),
        }
    }
}
