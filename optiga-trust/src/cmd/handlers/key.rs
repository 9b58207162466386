//! Key agreement, key derivation and key generation.

use super::super::apdu::{
    self, ApduWriter, CMD_CALC_SSEC, CMD_DERIVE_KEY, CMD_GEN_KEYPAIR, CMD_GEN_SYMKEY,
};
use super::{ApduHandler, HandlerContext};
use crate::{
    CalcSsecParams, DeriveKeyParams, GenKeyPairParams, GenSymKeyParams, OptigaStatus,
    OPTIGA_KEY_ID_SESSION_BASED,
};

/// CalcSSec parameter selecting ECDH
pub const KEY_AGREEMENT_ECDH: u8 = 0x01;

pub const TAG_SSEC_PRIVATE_KEY: u8 = 0x01;
pub const TAG_SSEC_ALGORITHM: u8 = 0x05;
pub const TAG_SSEC_PUBLIC_KEY: u8 = 0x06;
/// Export the result to the host
pub const TAG_EXPORT: u8 = 0x07;
/// Store the result in the session
pub const TAG_STORE_SESSION: u8 = 0x08;

pub const TAG_DERIVE_SECRET_OID: u8 = 0x01;
pub const TAG_DERIVE_DATA: u8 = 0x02;
pub const TAG_DERIVE_KEY_LENGTH: u8 = 0x03;
pub const TAG_DERIVE_INFO: u8 = 0x04;
/// The chip never derives fewer bytes
pub const DERIVE_KEY_MIN_LENGTH: u16 = 0x10;

pub const TAG_KEY_OID: u8 = 0x01;
pub const TAG_KEY_USAGE: u8 = 0x02;
pub const TAG_PRIVATE_KEY_OUT: u8 = 0x01;
pub const TAG_PUBLIC_KEY_OUT: u8 = 0x02;
pub const TAG_SYM_KEY_OUT: u8 = 0x01;

fn device_failure(ctx: &mut HandlerContext, response: &[u8]) -> Result<(), OptigaStatus> {
    if apdu::response_failed(response) {
        ctx.enter_on_device_error = false;
        return Err(OptigaStatus::CmdError);
    }
    Ok(())
}

impl ApduHandler for CalcSsecParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_CALC_SSEC, KEY_AGREEMENT_ECDH);
        writer.put_tag_u16(TAG_SSEC_PRIVATE_KEY, ctx.key_or_session(self.private_key_oid))?;
        writer.put_tag_u8(TAG_SSEC_ALGORITHM, self.algorithm as u8)?;
        writer.put_tlv(TAG_SSEC_PUBLIC_KEY, &self.public_key)?;
        if self.shared_secret.is_some() {
            writer.put_tag_empty(TAG_EXPORT)?;
        } else {
            writer.put_tag_u16(TAG_STORE_SESSION, ctx.session_oid)?;
        }
        Ok(writer.finish())
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        device_failure(ctx, response)?;
        if let Some(secret) = self.shared_secret.as_mut() {
            secret.fill(apdu::response_data(response))?;
        }
        Ok(())
    }
}

impl DeriveKeyParams {
    /// Length requested from the chip, raised to the minimum it derives
    fn length_to_request(&self) -> u16 {
        if self.derived_key_length > 0 && self.derived_key_length < DERIVE_KEY_MIN_LENGTH {
            DERIVE_KEY_MIN_LENGTH
        } else {
            self.derived_key_length
        }
    }
}

impl ApduHandler for DeriveKeyParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_DERIVE_KEY, self.derivation as u8);
        writer.put_tag_u16(TAG_DERIVE_SECRET_OID, ctx.key_or_session(self.input_secret_oid))?;
        writer.put_tag_u16(TAG_DERIVE_KEY_LENGTH, self.length_to_request())?;
        if !self.info.is_empty() {
            writer.put_tlv(TAG_DERIVE_INFO, &self.info)?;
        }
        // label followed by the random seed/salt
        let derivation_data = (self.label.len() + self.random.len()) as u16;
        writer.put_tag_header(TAG_DERIVE_DATA, derivation_data)?;
        writer.put_slice(&self.label)?.put_slice(&self.random)?;
        if self.derived_key.is_some() {
            writer.put_tag_empty(TAG_EXPORT)?;
        } else {
            writer.put_tag_u16(TAG_STORE_SESSION, ctx.session_oid)?;
        }
        Ok(writer.finish())
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        device_failure(ctx, response)?;
        if let Some(key) = self.derived_key.as_mut() {
            let derived = apdu::response_data(response)
                .get(..self.derived_key_length as usize)
                .ok_or(OptigaStatus::CmdError)?;
            key.fill(derived)?;
        }
        Ok(())
    }
}

impl ApduHandler for GenKeyPairParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_GEN_KEYPAIR, self.algorithm as u8);
        if self.private_key.is_none() {
            writer.put_tag_u16(TAG_KEY_OID, ctx.key_or_session(self.private_key_oid))?;
            writer.put_tag_u8(TAG_KEY_USAGE, self.key_usage)?;
        } else {
            writer.put_tag_empty(TAG_EXPORT)?;
        }
        Ok(writer.finish())
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        if apdu::response_failed(response) {
            self.public_key.clear();
        }
        device_failure(ctx, response)?;

        let out = apdu::response_data(response);
        let mut offset = 0;
        let mut found = false;
        while offset < out.len() {
            let (tag, value) = apdu::read_tlv(out, offset)?;
            match (tag, self.private_key.as_mut()) {
                (TAG_PUBLIC_KEY_OUT, _) => {
                    if let Err(status) = self.public_key.fill(value) {
                        self.public_key.clear();
                        return Err(status);
                    }
                }
                (TAG_PRIVATE_KEY_OUT, Some(private_key)) => {
                    if value.len() != self.algorithm.private_key_length() as usize {
                        return Err(OptigaStatus::CmdMemoryInsufficient);
                    }
                    private_key.fill(value)?;
                }
                _ => break,
            }
            found = true;
            offset += apdu::TLV_HEADER_SIZE + value.len();
        }
        if found {
            Ok(())
        } else {
            Err(OptigaStatus::CmdError)
        }
    }
}

impl ApduHandler for GenSymKeyParams {
    fn prepare(&mut self, _ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_GEN_SYMKEY, self.key_type as u8);
        if self.exported_key.is_none() {
            writer.put_tag_u16(TAG_KEY_OID, self.key_oid)?;
            writer.put_tag_u8(TAG_KEY_USAGE, self.key_usage)?;
        } else {
            writer.put_tag_empty(TAG_EXPORT)?;
        }
        Ok(writer.finish())
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        device_failure(ctx, response)?;
        if let Some(key) = self.exported_key.as_mut() {
            let (tag, value) = apdu::read_tlv(response, apdu::APDU_INDATA_OFFSET)?;
            if tag != TAG_SYM_KEY_OUT {
                return Err(OptigaStatus::CmdError);
            }
            key.fill(value)?;
        }
        Ok(())
    }
}

/// Whether CalcSSec needs a session: a session based private key or a secret kept on the chip
pub(crate) fn ssec_needs_session(params: &CalcSsecParams) -> bool {
    params.private_key_oid == OPTIGA_KEY_ID_SESSION_BASED || params.shared_secret.is_none()
}

/// Whether DeriveKey needs a session: a session based secret or a derived key kept on the chip
pub(crate) fn derive_needs_session(params: &DeriveKeyParams) -> bool {
    params.input_secret_oid == OPTIGA_KEY_ID_SESSION_BASED || params.derived_key.is_none()
}

/// Whether GenKeyPair keeps the private key in the session
pub(crate) fn keypair_needs_session(params: &GenKeyPairParams) -> bool {
    params.private_key_oid == OPTIGA_KEY_ID_SESSION_BASED && params.private_key.is_none()
}
