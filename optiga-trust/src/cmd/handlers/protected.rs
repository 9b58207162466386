//! SetObjectProtected: manifest and fragments of a protected update, sent
//! under one strict lock.

use super::super::apdu::{self, ApduWriter, CMD_SET_OBJECT_PROTECTED};
use super::super::state_machine::ProcessStep;
use super::{ApduHandler, HandlerContext};
use crate::{OptigaStatus, ProtectedUpdateTag, SetObjectProtectedParams};

/// Base tag; the low bits carry the manifest/fragment tag
pub const TAG_SET_OBJECT_PROTECTED: u8 = 0x30;

impl ApduHandler for SetObjectProtectedParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        ctx.chaining = false;
        let mut writer = ApduWriter::new(CMD_SET_OBJECT_PROTECTED, self.manifest_version);
        let data = self.buffer.as_deref().unwrap_or(&[]);
        writer.put_tlv(TAG_SET_OBJECT_PROTECTED | self.tag as u8, data)?;
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
        if self.tag == ProtectedUpdateTag::Final {
            ctx.step = ProcessStep::ReleaseLock;
        } else {
            ctx.step = ProcessStep::Exit;
            ctx.keep_strict_lock = true;
        }
        Ok(())
    }
}
