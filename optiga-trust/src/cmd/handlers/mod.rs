//! One handler per chip operation.
//!
//! A handler is driven twice per exchange: `prepare` builds the command APDU,
//! `process_response` decodes the answer into the caller's buffers. Handlers
//! steer the command state machine only through [`HandlerContext`].

pub mod app;
pub mod asym;
pub mod data_object;
pub mod hash;
pub mod key;
pub mod protected;
pub mod random;
pub mod sign_verify;
pub mod sym;

use super::super::{
    CalcHashParams, CalcSignParams, CalcSsecParams, CloseAppParams, DecryptAsymParams,
    DeriveKeyParams, EncryptAsymParams, GenKeyPairParams, GenSymKeyParams, GetDataObjectParams,
    GetRandomParams, ManageContext, OpenAppParams, OptigaStatus, PalDatastore,
    SetDataObjectParams, SetObjectProtectedParams, SymParams, VerifySignParams,
    OPTIGA_APP_CONTEXT_SIZE,
};
use super::state_machine::ProcessStep;

/// Command byte, parameter byte and operation mode of the last dispatched APDU
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ApduInfo {
    pub cmd: u8,
    pub param: u8,
    pub operation_mode: u8,
}

/// View of the command instance and chip context handed to a handler
pub struct HandlerContext<'a> {
    /// Session OID leased by the instance, 0 without a session
    pub(crate) session_oid: u16,
    /// Set by a handler when another exchange must follow
    pub(crate) chaining: bool,
    /// Whether a device error sends the state machine back into the handler
    pub(crate) enter_on_device_error: bool,
    pub(crate) exit_status: OptigaStatus,
    pub(crate) step: ProcessStep,
    /// Set when the strict lock must be kept after the callback
    pub(crate) keep_strict_lock: bool,
    pub(crate) manage_context: ManageContext,
    pub(crate) datastore_id: u16,
    pub(crate) context_handle: &'a mut [u8; OPTIGA_APP_CONTEXT_SIZE],
    pub(crate) datastore: &'a dyn PalDatastore,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        context_handle: &'a mut [u8; OPTIGA_APP_CONTEXT_SIZE],
        datastore: &'a dyn PalDatastore,
    ) -> HandlerContext<'a> {
        HandlerContext {
            session_oid: 0,
            chaining: false,
            enter_on_device_error: true,
            exit_status: OptigaStatus::LibSuccess,
            step: ProcessStep::ProcessOptigaResponse,
            keep_strict_lock: false,
            manage_context: ManageContext::None,
            datastore_id: 0,
            context_handle,
            datastore,
        }
    }

    /// Session OID, or `oid` when it names a key object
    pub(crate) fn key_or_session(&self, oid: u16) -> u16 {
        if oid == super::super::OPTIGA_KEY_ID_SESSION_BASED {
            self.session_oid
        } else {
            oid
        }
    }
}

pub trait ApduHandler {
    /// Builds the next command APDU
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus>;
    /// Decodes the response of the last exchange
    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus>;
}

/// An operation in flight on a command instance, together with its parameters
#[derive(Clone, Debug)]
pub enum Operation {
    OpenApplication(OpenAppParams),
    CloseApplication(CloseAppParams),
    GetDataObject(GetDataObjectParams),
    SetDataObject(SetDataObjectParams),
    GetRandom(GetRandomParams),
    CalcHash(CalcHashParams),
    CalcSign(CalcSignParams),
    VerifySign(VerifySignParams),
    CalcSsec(CalcSsecParams),
    DeriveKey(DeriveKeyParams),
    GenKeyPair(GenKeyPairParams),
    EncryptAsym(EncryptAsymParams),
    DecryptAsym(DecryptAsymParams),
    EncryptSym(SymParams),
    DecryptSym(SymParams),
    SetObjectProtected(SetObjectProtectedParams),
    GenSymKey(GenSymKeyParams),
}

macro_rules! dispatch {
    ($op:expr, $params:ident => $body:expr) => {
        match $op {
            Operation::OpenApplication($params) => $body,
            Operation::CloseApplication($params) => $body,
            Operation::GetDataObject($params) => $body,
            Operation::SetDataObject($params) => $body,
            Operation::GetRandom($params) => $body,
            Operation::CalcHash($params) => $body,
            Operation::CalcSign($params) => $body,
            Operation::VerifySign($params) => $body,
            Operation::CalcSsec($params) => $body,
            Operation::DeriveKey($params) => $body,
            Operation::GenKeyPair($params) => $body,
            Operation::EncryptAsym($params) => $body,
            Operation::DecryptAsym($params) => $body,
            Operation::EncryptSym($params) => $body,
            Operation::DecryptSym($params) => $body,
            Operation::SetObjectProtected($params) => $body,
            Operation::GenSymKey($params) => $body,
        }
    };
}

impl Operation {
    /// APDU command and parameter this operation dispatches
    pub fn apdu_info(&self) -> ApduInfo {
        use super::apdu::*;
        let (cmd, param, operation_mode) = match self {
            Operation::OpenApplication(p) => (CMD_OPEN_APPLICATION, app::param(p.hibernate), 0),
            Operation::CloseApplication(p) => (CMD_CLOSE_APPLICATION, app::param(p.hibernate), 0),
            Operation::GetDataObject(p) => (data_object::get_cmd(p.oid), p.read_metadata as u8, 0),
            Operation::SetDataObject(p) => (CMD_SET_DATA_OBJECT, p.mode as u8, 0),
            Operation::GetRandom(p) => (CMD_GET_RANDOM, p.random_type as u8, 0),
            Operation::CalcHash(p) => (CMD_CALC_HASH, p.hash_type as u8, 0),
            Operation::CalcSign(p) => (CMD_CALC_SIGN, p.scheme as u8, 0),
            Operation::VerifySign(p) => (CMD_VERIFY_SIGN, p.scheme as u8, 0),
            Operation::CalcSsec(_) => (CMD_CALC_SSEC, key::KEY_AGREEMENT_ECDH, 0),
            Operation::DeriveKey(p) => (CMD_DERIVE_KEY, p.derivation as u8, 0),
            Operation::GenKeyPair(p) => (CMD_GEN_KEYPAIR, p.algorithm as u8, 0),
            Operation::EncryptAsym(p) => (CMD_ENCRYPT_ASYM, p.scheme as u8, 0),
            Operation::DecryptAsym(p) => (CMD_DECRYPT_ASYM, p.scheme as u8, 0),
            Operation::EncryptSym(p) => (CMD_ENCRYPT_SYM, p.mode as u8, p.operation as u8),
            Operation::DecryptSym(p) => (CMD_DECRYPT_SYM, p.mode as u8, p.operation as u8),
            Operation::SetObjectProtected(p) => (CMD_SET_OBJECT_PROTECTED, p.manifest_version, 0),
            Operation::GenSymKey(p) => (CMD_GEN_SYMKEY, p.key_type as u8, 0),
        };
        ApduInfo {
            cmd,
            param,
            operation_mode,
        }
    }
}

impl ApduHandler for Operation {
    fn prepare(&mut self, ctx: &mut HandlerContext) -> Result<Vec<u8>, OptigaStatus> {
        dispatch!(self, params => params.prepare(ctx))
    }

    fn process_response(
        &mut self,
        ctx: &mut HandlerContext,
        response: &[u8],
    ) -> Result<(), OptigaStatus> {
        dispatch!(self, params => params.process_response(ctx, response))
    }
}
