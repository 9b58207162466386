//! GetRandom, optionally keeping the random (pre-master secret) in the session.

use super::super::apdu::{self, ApduWriter, CMD_GET_RANDOM};
use super::{ApduHandler, HandlerContext};
use crate::{GetRandomParams, OptigaStatus, RandomType};

/// Optional data prepended to a pre-master secret
pub const TAG_PRE_MASTER_OPTIONAL_DATA: u8 = 0x41;

impl ApduHandler for GetRandomParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_GET_RANDOM, self.random_type as u8);
        writer.put_u16(self.length)?;
        if self.store_in_session {
            writer.put_u16(ctx.session_oid)?;
            writer.put_tlv(TAG_PRE_MASTER_OPTIONAL_DATA, &self.optional_data)?;
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
        if self.random_type != RandomType::PreMasterSecret {
            let random = apdu::response_data(response)
                .get(..self.length as usize)
                .ok_or(OptigaStatus::CmdError)?;
            self.random.fill(random)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ok_response, with_context};
    use super::*;

    #[test]
    fn random_copied() {
        let mut params = GetRandomParams::new(RandomType::Trng, 4);
        with_context(0, |ctx| {
            let apdu = params.prepare(ctx).unwrap();
            assert_eq!(apdu, vec![0x8C, 0x00, 0x00, 0x02, 0x00, 0x04]);
            params
                .process_response(ctx, &ok_response(&[9, 8, 7, 6]))
                .unwrap();
        });
        assert_eq!(params.random.as_slice(), &[9, 8, 7, 6]);
    }

    #[test]
    fn pre_master_secret_in_session() {
        let mut params = GetRandomParams::new(RandomType::PreMasterSecret, 0x30);
        params.store_in_session = true;
        params.optional_data = vec![0x03, 0x03];
        with_context(0xE101, |ctx| {
            let apdu = params.prepare(ctx).unwrap();
            assert_eq!(
                apdu,
                vec![0x8C, 0x04, 0x00, 0x09, 0x00, 0x30, 0xE1, 0x01, 0x41, 0x00, 0x02, 0x03, 0x03]
            );
            params.process_response(ctx, &ok_response(&[])).unwrap();
        });
        assert!(params.random.is_empty());
    }

    #[test]
    fn short_random_response() {
        let mut params = GetRandomParams::new(RandomType::Drng, 8);
        let result = with_context(0, |ctx| params.process_response(ctx, &ok_response(&[1, 2])));
        assert_eq!(result, Err(OptigaStatus::CmdError));
    }
}
