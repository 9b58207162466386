//! CalcSign and VerifySign.

use log::trace;

use super::super::apdu::{self, ApduWriter, CMD_CALC_SIGN, CMD_VERIFY_SIGN};
use super::{ApduHandler, HandlerContext};
use crate::{CalcSignParams, OptigaStatus, PublicKeySource, VerifySignParams};

pub const TAG_DIGEST: u8 = 0x01;
pub const TAG_SIGNATURE: u8 = 0x02;
pub const TAG_SIGN_KEY_OID: u8 = 0x03;
pub const TAG_PUBLIC_KEY_OID: u8 = 0x04;
pub const TAG_ALGORITHM: u8 = 0x05;
pub const TAG_PUBLIC_KEY: u8 = 0x06;

const DER_INTEGER: u8 = 0x02;

/// Removes the sign padding byte of a single byte length integer (`02 LL 00 xx`, xx <= 0x7F)
fn strip_integer(signature: &mut Vec<u8>, start: usize) -> bool {
    if signature.len() < start + 4 {
        return false;
    }
    let padded = signature[start] == DER_INTEGER
        && signature[start + 1] > 1
        && signature[start + 2] == 0x00
        && signature[start + 3] <= 0x7F;
    if padded {
        signature.remove(start + 2);
        signature[start + 1] -= 1;
    }
    padded
}

/// Drops redundant leading zeroes of the r and s integers of an ECDSA signature
pub fn remove_rs_padding(signature: &mut Vec<u8>) {
    if signature.len() < 2 {
        return;
    }
    let start_s = signature[1] as usize + 2;
    // s first so the offset of s stays valid
    let s = strip_integer(signature, start_s);
    let r = strip_integer(signature, 0);
    if r || s {
        trace!("Removed r/s padding, signature is {} bytes", signature.len());
    }
}

impl ApduHandler for CalcSignParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_CALC_SIGN, self.scheme as u8);
        let prepared = writer
            .put_tlv(TAG_DIGEST, &self.digest)
            .and_then(|w| w.put_tag_u16(TAG_SIGN_KEY_OID, ctx.key_or_session(self.private_key_oid)))
            .map(|_| ());
        if let Err(status) = prepared {
            self.signature.clear();
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
            self.signature.clear();
            return Err(OptigaStatus::CmdError);
        }
        if let Err(status) = self.signature.fill(apdu::response_data(response)) {
            self.signature.clear();
            return Err(status);
        }
        remove_rs_padding(self.signature.as_mut_vec());
        Ok(())
    }
}

impl ApduHandler for VerifySignParams {
    fn prepare(&mut self, _ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_VERIFY_SIGN, self.scheme as u8);
        writer.put_tlv(TAG_DIGEST, &self.digest)?;
        writer.put_tlv(TAG_SIGNATURE, &self.signature)?;
        match &self.public_key {
            PublicKeySource::Oid(oid) => {
                writer.put_tag_u16(TAG_PUBLIC_KEY_OID, *oid)?;
            }
            PublicKeySource::Host(algorithm, key) => {
                writer.put_tag_u8(TAG_ALGORITHM, *algorithm as u8)?;
                writer.put_tlv(TAG_PUBLIC_KEY, key)?;
            }
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
        Ok(())
    }
}
