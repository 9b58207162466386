//! OpenApplication / CloseApplication, including hibernate context handling.

use log::{debug, warn};

use super::super::apdu::{self, ApduWriter, CMD_CLOSE_APPLICATION, CMD_OPEN_APPLICATION};
use super::{ApduHandler, HandlerContext};
use crate::{
    CloseAppParams, ManageContext, OpenAppParams, OptigaStatus, OPTIGA_APPLICATION_ID,
    OPTIGA_APP_CONTEXT_SIZE, OPTIGA_CMD_PARAM_HIBERNATE, OPTIGA_CMD_PARAM_INITIALIZE_APP_CONTEXT,
    OPTIGA_DATASTORE_NOT_CONFIGURED,
};

pub fn param(hibernate: bool) -> u8 {
    if hibernate {
        OPTIGA_CMD_PARAM_HIBERNATE
    } else {
        OPTIGA_CMD_PARAM_INITIALIZE_APP_CONTEXT
    }
}

/// Loads the saved context handle; an all-zero handle was never saved
pub(crate) fn restore_context(ctx: &mut HandlerContext) -> Result<(), OptigaStatus> {
    if ctx.datastore_id != OPTIGA_DATASTORE_NOT_CONFIGURED {
        let saved = ctx.datastore.read(ctx.datastore_id)?;
        if saved.len() < OPTIGA_APP_CONTEXT_SIZE {
            warn!("Saved context handle is {} bytes", saved.len());
            return Err(OptigaStatus::CmdError);
        }
        ctx.context_handle
            .copy_from_slice(&saved[..OPTIGA_APP_CONTEXT_SIZE]);
    }
    if ctx.context_handle.iter().all(|b| *b == 0) {
        warn!("No saved context handle to restore");
        return Err(OptigaStatus::CmdError);
    }
    Ok(())
}

pub(crate) fn store_context(ctx: &mut HandlerContext) -> Result<(), OptigaStatus> {
    if ctx.datastore_id != OPTIGA_DATASTORE_NOT_CONFIGURED {
        ctx.datastore.write(ctx.datastore_id, &ctx.context_handle[..])?;
    }
    Ok(())
}

/// Forgets the context handle in memory and in the datastore
pub(crate) fn clear_context(ctx: &mut HandlerContext) -> Result<(), OptigaStatus> {
    *ctx.context_handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
    store_context(ctx)
}

impl ApduHandler for OpenAppParams {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        let mut writer = ApduWriter::new(CMD_OPEN_APPLICATION, param(self.hibernate));
        writer.put_slice(&OPTIGA_APPLICATION_ID)?;
        if self.hibernate {
            restore_context(ctx)?;
            writer.put_slice(&ctx.context_handle[..])?;
            debug!("Open application restoring the saved context");
        }
        // a handle is only good for one restore
        clear_context(ctx).map_err(|_| OptigaStatus::CmdError)?;
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
        ctx.manage_context = ManageContext::None;
        Ok(())
    }
}

impl ApduHandler for CloseAppParams {
    fn prepare(&mut self, _ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        Ok(ApduWriter::new(CMD_CLOSE_APPLICATION, param(self.hibernate)).finish())
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
        if self.hibernate {
            let handle = apdu::response_data(response)
                .get(..OPTIGA_APP_CONTEXT_SIZE)
                .ok_or(OptigaStatus::CmdError)?;
            ctx.context_handle.copy_from_slice(handle);
            if store_context(ctx).is_err() {
                *ctx.context_handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
                return Err(OptigaStatus::CmdError);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{failed_response, ok_response};
    use super::*;
    use crate::pal::MemoryDatastore;
    use crate::PalDatastore;

    const HANDLE: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn open_without_hibernate() {
        let store = MemoryDatastore::default();
        let mut handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
        let mut ctx = HandlerContext::new(&mut handle, &store);
        let apdu = OpenAppParams::default().prepare(&mut ctx).unwrap();
        assert_eq!(&apdu[..4], &[0xF0, 0x00, 0x00, 0x10]);
        assert_eq!(&apdu[4..], &OPTIGA_APPLICATION_ID);
    }

    #[test]
    fn close_saves_then_open_restores() {
        let store = MemoryDatastore::default();
        let mut handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
        let mut ctx = HandlerContext::new(&mut handle, &store);
        ctx.datastore_id = 0x33;

        let mut close = CloseAppParams { hibernate: true };
        assert_eq!(close.prepare(&mut ctx).unwrap(), vec![0xF1, 0x01, 0x00, 0x00]);
        close.process_response(&mut ctx, &ok_response(&HANDLE)).unwrap();
        assert_eq!(store.read(0x33).unwrap(), HANDLE.to_vec());

        *ctx.context_handle = [0u8; 8];
        let apdu = OpenAppParams { hibernate: true }.prepare(&mut ctx).unwrap();
        assert_eq!(&apdu[..4], &[0xF0, 0x01, 0x00, 0x18]);
        assert_eq!(&apdu[20..], &HANDLE);
        // consumed
        assert_eq!(store.read(0x33).unwrap(), vec![0u8; 8]);
        assert_eq!(*ctx.context_handle, [0u8; 8]);
    }

    #[test]
    fn open_hibernate_without_saved_handle() {
        let store = MemoryDatastore::default();
        store.write(0x33, &[0u8; 8]).unwrap();
        let mut handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
        let mut ctx = HandlerContext::new(&mut handle, &store);
        ctx.datastore_id = 0x33;
        assert_eq!(
            OpenAppParams { hibernate: true }.prepare(&mut ctx),
            Err(OptigaStatus::CmdError)
        );
    }

    #[test]
    fn failed_close_keeps_handler_out() {
        let store = MemoryDatastore::default();
        let mut handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
        let mut ctx = HandlerContext::new(&mut handle, &store);
        let mut close = CloseAppParams { hibernate: true };
        assert_eq!(
            close.process_response(&mut ctx, &failed_response()),
            Err(OptigaStatus::CmdError)
        );
        assert!(!ctx.enter_on_device_error);
    }
}
