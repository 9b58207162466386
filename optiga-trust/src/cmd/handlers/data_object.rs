//! GetDataObject / SetDataObject with chaining over objects larger than one APDU.

use log::{debug, warn};

use super::super::apdu::{
    self, ApduWriter, CMD_GET_DATA_OBJECT, CMD_GET_DATA_OBJECT_NO_CLEAR, CMD_SET_DATA_OBJECT,
};
use super::{ApduHandler, HandlerContext};
use crate::{
    GetDataObjectParams, OptigaStatus, SetDataObjectParams, WriteMode,
    OPTIGA_CMD_APDU_HEADER_SIZE, OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY, OPTIGA_LAST_ERROR_CODE_OID,
    OPTIGA_MAX_COMMS_BUFFER_SIZE,
};

/// Largest chunk read with one APDU
pub const MAX_READ_CHUNK: u16 = (OPTIGA_MAX_COMMS_BUFFER_SIZE - OPTIGA_CMD_APDU_HEADER_SIZE) as u16;
/// Largest chunk written with one APDU (OID and offset precede the data)
pub const MAX_WRITE_CHUNK: u16 =
    (OPTIGA_MAX_COMMS_BUFFER_SIZE - OPTIGA_CMD_APDU_HEADER_SIZE - 4) as u16;

/// The last error code object is read without clearing it
pub fn get_cmd(oid: u16) -> u8 {
    if oid == OPTIGA_LAST_ERROR_CODE_OID {
        CMD_GET_DATA_OBJECT_NO_CLEAR
    } else {
        CMD_GET_DATA_OBJECT
    }
}

impl GetDataObjectParams {
    fn abandon_read(&mut self) {
        self.buffer.clear();
        self.accumulated_size = 0;
        self.last_read_size = 0;
    }
}

impl ApduHandler for GetDataObjectParams {
    fn prepare(&mut self, _ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(get_cmd(self.oid), self.read_metadata as u8);
        writer.put_u16(self.oid)?;
        let size_to_read = MAX_READ_CHUNK.min(self.bytes_to_read.saturating_sub(self.accumulated_size));
        if !self.read_metadata {
            writer.put_u16(self.offset.wrapping_add(self.accumulated_size))?;
            writer.put_u16(size_to_read)?;
        }
        self.last_read_size = size_to_read;
        Ok(writer.finish())
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        ctx.chaining = false;
        if apdu::response_failed(response) {
            if self.accumulated_size != 0 {
                // reading past the end of the object finishes a chained read
                ctx.enter_on_device_error = true;
            } else {
                ctx.enter_on_device_error = false;
                self.buffer.clear();
            }
            return Err(OptigaStatus::CmdError);
        }
        match ctx.exit_status {
            OptigaStatus::DeviceError(OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY) => {
                debug!("Read of {:#06x} ended at {} bytes", self.oid, self.accumulated_size);
                self.accumulated_size = 0;
                self.last_read_size = 0;
                return Ok(());
            }
            OptigaStatus::DeviceError(code) => return Err(OptigaStatus::DeviceError(code)),
            _ => {}
        }

        let data = apdu::response_data(response);
        if data.len() > self.last_read_size as usize {
            warn!(
                "Read of {:#06x} returned {} bytes, {} requested",
                self.oid,
                data.len(),
                self.last_read_size
            );
            self.abandon_read();
            return Err(OptigaStatus::CmdMemoryInsufficient);
        }
        if let Err(status) = self.buffer.append(data) {
            self.abandon_read();
            return Err(status);
        }
        let data_read = data.len() as u16;
        self.accumulated_size += data_read;
        if self.last_read_size > data_read || self.accumulated_size == self.bytes_to_read {
            self.accumulated_size = 0;
            self.last_read_size = 0;
        } else {
            ctx.chaining = true;
        }
        Ok(())
    }
}

impl SetDataObjectParams {
    fn total_size(&self) -> Result<u16, OptigaStatus> {
        if self.mode == WriteMode::Count {
            return Ok(1);
        }
        // the offset field addresses at most 64 KiB
        if self.offset as usize + self.data.len() > u16::MAX as usize {
            warn!(
                "Write of {} bytes at {} exceeds object {:#06x}",
                self.data.len(),
                self.offset,
                self.oid
            );
            return Err(OptigaStatus::CmdInvalidInput);
        }
        Ok(self.data.len() as u16)
    }
}

impl ApduHandler for SetDataObjectParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        ctx.chaining = false;
        // fragments after the first one only write
        let param = if self.written_size == 0 {
            self.mode as u8
        } else {
            WriteMode::Write as u8
        };
        let total = self.total_size()?;
        let size_to_send = MAX_WRITE_CHUNK.min(total - self.written_size);

        let mut writer = ApduWriter::new(CMD_SET_DATA_OBJECT, param);
        writer.put_u16(self.oid)?;
        writer.put_u16(self.offset.wrapping_add(self.written_size))?;
        if self.mode == WriteMode::Count {
            writer.put_u8(self.count)?;
        } else {
            let start = self.written_size as usize;
            writer.put_slice(&self.data[start..start + size_to_send as usize])?;
        }
        self.written_size += size_to_send;
        if self.written_size != total {
            ctx.chaining = true;
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

#[cfg(test)]
mod tests {
    use super::super::tests::{failed_response, ok_response, with_context};
    use super::*;
    use crate::OutBuffer;

    #[test]
    fn read_chunks_until_complete() {
        let mut params = GetDataObjectParams::new(0xF1D0, 0x10, 2000);
        with_context(0, |ctx| {
            let apdu = params.prepare(ctx).unwrap();
            assert_eq!(
                apdu,
                vec![0x81, 0x00, 0x00, 0x06, 0xF1, 0xD0, 0x00, 0x10, 0x06, 0x11]
            );
            params
                .process_response(ctx, &ok_response(&vec![0xAB; MAX_READ_CHUNK as usize]))
                .unwrap();
            assert!(ctx.chaining);

            let apdu = params.prepare(ctx).unwrap();
            assert_eq!(&apdu[6..10], &[0x06, 0x21, 0x01, 0xBF]);
            params.process_response(ctx, &ok_response(&[0xCD; 100])).unwrap();
            // short answer: the object ended
            assert!(!ctx.chaining);
        });
        assert_eq!(params.buffer.len(), MAX_READ_CHUNK as usize + 100);
    }

    #[test]
    fn metadata_and_last_error_code() {
        let mut params = GetDataObjectParams::metadata(0xE0E0, 64);
        let apdu = with_context(0, |ctx| params.prepare(ctx).unwrap());
        assert_eq!(apdu, vec![0x81, 0x01, 0x00, 0x02, 0xE0, 0xE0]);

        let mut params = GetDataObjectParams::new(OPTIGA_LAST_ERROR_CODE_OID, 0, 1);
        let apdu = with_context(0, |ctx| params.prepare(ctx).unwrap());
        assert_eq!(apdu[0], 0x01);
    }

    #[test]
    fn read_past_end_completes_chained_read() {
        let mut params = GetDataObjectParams::new(0xF1D0, 0, 3000);
        with_context(0, |ctx| {
            params.prepare(ctx).unwrap();
            params
                .process_response(ctx, &ok_response(&vec![1; MAX_READ_CHUNK as usize]))
                .unwrap();
            params.prepare(ctx).unwrap();
            assert_eq!(
                params.process_response(ctx, &failed_response()),
                Err(OptigaStatus::CmdError)
            );
            assert!(ctx.enter_on_device_error);

            // device error query answered "out of boundary"
            ctx.exit_status = OptigaStatus::DeviceError(OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY);
            params.process_response(ctx, &ok_response(&[0x08])).unwrap();
            assert!(!ctx.chaining);
        });
        assert_eq!(params.buffer.len(), MAX_READ_CHUNK as usize);
    }

    #[test]
    fn first_read_failure_leaves_handler() {
        let mut params = GetDataObjectParams::new(0xF1D0, 0, 10);
        with_context(0, |ctx| {
            params.prepare(ctx).unwrap();
            assert!(params.process_response(ctx, &failed_response()).is_err());
            assert!(!ctx.enter_on_device_error);
        });
        assert!(params.buffer.is_empty());
    }

    #[test]
    fn read_larger_than_buffer() {
        let mut params = GetDataObjectParams::new(0xF1D0, 0, 4);
        with_context(0, |ctx| {
            params.prepare(ctx).unwrap();
            assert_eq!(
                params.process_response(ctx, &ok_response(&[1, 2, 3, 4, 5])),
                Err(OptigaStatus::CmdMemoryInsufficient)
            );
        });
        assert!(params.buffer.is_empty());
    }

    #[test]
    fn chip_answering_more_than_requested() {
        let mut params = GetDataObjectParams::new(0xF1D0, 0, 2000);
        with_context(0, |ctx| {
            params.prepare(ctx).unwrap();
            params
                .process_response(ctx, &ok_response(&vec![1; MAX_READ_CHUNK as usize]))
                .unwrap();
            assert!(ctx.chaining);
            params.prepare(ctx).unwrap();
            assert_eq!(params.last_read_size, 2000 - MAX_READ_CHUNK);
            assert_eq!(
                params.process_response(ctx, &ok_response(&[2; 500])),
                Err(OptigaStatus::CmdMemoryInsufficient)
            );
        });
        assert!(params.buffer.is_empty());
        assert_eq!(params.accumulated_size, 0);
        assert_eq!(params.last_read_size, 0);
    }

    #[test]
    fn chained_read_overflowing_buffer_starts_over() {
        let mut params = GetDataObjectParams::new(0xF1D0, 0, 3000);
        params.buffer = OutBuffer::with_capacity(MAX_READ_CHUNK as usize + 10);
        with_context(0, |ctx| {
            params.prepare(ctx).unwrap();
            params
                .process_response(ctx, &ok_response(&vec![1; MAX_READ_CHUNK as usize]))
                .unwrap();
            params.prepare(ctx).unwrap();
            assert_eq!(
                params.process_response(ctx, &ok_response(&[2; 100])),
                Err(OptigaStatus::CmdMemoryInsufficient)
            );
        });
        assert!(params.buffer.is_empty());
        assert_eq!(params.accumulated_size, 0);
        assert_eq!(params.last_read_size, 0);
    }

    #[test]
    fn write_past_offset_range_rejected() {
        let mut params =
            SetDataObjectParams::new(0xF1D1, 0, WriteMode::EraseAndWrite, vec![0x5A; 65546]);
        with_context(0, |ctx| {
            assert_eq!(params.prepare(ctx), Err(OptigaStatus::CmdInvalidInput));
            assert!(!ctx.chaining);
        });

        let mut params = SetDataObjectParams::new(0xF1D1, 0x10, WriteMode::Write, vec![0; 0xFFF0]);
        with_context(0, |ctx| {
            assert_eq!(params.prepare(ctx), Err(OptigaStatus::CmdInvalidInput));
        });

        // the largest write that still fits the offset field
        let mut params = SetDataObjectParams::new(0xF1D1, 0, WriteMode::Write, vec![0; 0xFFFF]);
        with_context(0, |ctx| {
            params.prepare(ctx).unwrap();
            assert!(ctx.chaining);
        });
    }

    #[test]
    fn write_in_fragments() {
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let mut params = SetDataObjectParams::new(0xF1D1, 0, WriteMode::EraseAndWrite, data.clone());
        let mut sent = Vec::new();
        with_context(0, |ctx| {
            let first = params.prepare(ctx).unwrap();
            assert_eq!(first[1], 0x40);
            assert_eq!(first.len(), OPTIGA_MAX_COMMS_BUFFER_SIZE);
            assert!(ctx.chaining);
            sent.extend_from_slice(&first[8..]);
            loop {
                let apdu = params.prepare(ctx).unwrap();
                assert_eq!(apdu[1], 0x00);
                let offset = u16::from_be_bytes([apdu[6], apdu[7]]) as usize;
                assert_eq!(offset, sent.len());
                sent.extend_from_slice(&apdu[8..]);
                if !ctx.chaining {
                    break;
                }
            }
        });
        assert_eq!(sent, data);
    }

    #[test]
    fn write_counter() {
        let mut params = SetDataObjectParams::count(0xE120, 5);
        let apdu = with_context(0, |ctx| {
            let apdu = params.prepare(ctx).unwrap();
            assert!(!ctx.chaining);
            apdu
        });
        assert_eq!(apdu, vec![0x82, 0x02, 0x00, 0x05, 0xE1, 0x20, 0x00, 0x00, 0x05]);
    }
}
