//! Nested state machine driving one command instance.
//!
//! A step either continues inline or exits and waits for the next event of
//! the chip context (a scheduler grant or a registered continuation).

use log::{debug, warn};

use super::apdu::{self, APDU_STATUS_FAILURE, CMD_CLOSE_APPLICATION, CMD_GET_DATA_OBJECT_NO_CLEAR};
use super::handlers::{ApduHandler, HandlerContext, Operation};
use super::queue::RequestType;
use super::{CmdEvent, CmdInstance, OptigaContext, Shared};
use crate::{
    ManageContext, OptigaStatus, OPTIGA_CMD_PARAM_INITIALIZE_APP_CONTEXT,
    OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS, OPTIGA_CMD_SCHEDULER_RUNNING_TIME_MS,
    OPTIGA_HIBERNATE_CONTEXT_ID, OPTIGA_LAST_ERROR_CODE_OID, OPTIGA_MAX_COMMS_BUFFER_SIZE,
    OPTIGA_PROTECTION_LEVEL_MASK,
};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OpenStep {
    AcquireLock,
    Start,
    Done,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CloseStep {
    Start,
    /// The lock is released after the callback when the context was saved
    Done { save_context: bool },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PrepareStep {
    RequestLock,
    RequestSession,
    ResetStrictLock,
    RequestStrictLock,
    PrepareApdu,
}

/// Reading the last error code after a failed APDU
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ErrorStage {
    Prepare,
    Tx,
    Rx,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProcessStep {
    ProcessOptigaResponse,
    GetDeviceError(ErrorStage),
    ReleaseSession,
    ReleaseLock,
    Exit,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CmdState {
    Idle,
    CommsOpen(OpenStep),
    CommsClose(CloseStep),
    PrepareCommand(PrepareStep),
    ProcessResponse(ProcessStep),
    ErrorHandler,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Flow {
    Continue,
    Exit,
}

/// GetDataObject of one byte of the last error code object, without clearing it
fn last_error_apdu() -> Vec<u8> {
    let mut tx = vec![CMD_GET_DATA_OBJECT_NO_CLEAR, 0x00, 0x00, 0x06];
    tx.extend_from_slice(&OPTIGA_LAST_ERROR_CODE_OID.to_be_bytes());
    tx.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    tx
}

impl OptigaContext {
    /// Runs the instance of `index` until it waits for the next event
    pub(super) fn execute(&mut self, index: usize) {
        let OptigaContext { shared, slots, .. } = self;
        let instance = match slots[index].instance.as_mut() {
            Some(instance) => instance,
            None => {
                warn!("Continuation for released instance {}", index);
                shared.arm_scheduler();
                return;
            }
        };
        while step(shared, instance, index) == Flow::Continue {}
    }
}

fn step(shared: &mut Shared, instance: &mut CmdInstance, index: usize) -> Flow {
    debug!("Instance {} in {:?}", index, instance.state);
    match instance.state {
        CmdState::Idle => {
            warn!("Instance {} executed without an operation", index);
            shared.arm_scheduler();
            Flow::Exit
        }
        CmdState::CommsOpen(open) => comms_open(shared, instance, index, open),
        CmdState::CommsClose(close) => comms_close(shared, instance, index, close),
        CmdState::PrepareCommand(prepare) => prepare_command(shared, instance, index, prepare),
        CmdState::ProcessResponse(process) => process_response(shared, instance, index, process),
        CmdState::ErrorHandler => {
            shared.reset_slot(index);
            instance.complete(instance.exit_status);
            Flow::Exit
        }
    }
}

/// A lower layer reported `status`: the instance leaves through the error handler
fn fail_with_event(instance: &mut CmdInstance, status: OptigaStatus) {
    warn!("Command {:#04x} failed with {}", instance.apdu.cmd, status);
    instance.exit_status = status;
    instance.state = CmdState::ErrorHandler;
}

/// Forgets a context handle being saved by a hibernating close that failed
fn clear_app_context(shared: &mut Shared, instance: &mut CmdInstance) {
    if instance.apdu.param == OPTIGA_CMD_PARAM_INITIALIZE_APP_CONTEXT
        || instance.options.manage_context != ManageContext::Save
    {
        return;
    }
    shared.context_handle = Default::default();
    if shared.datastore_id == OPTIGA_HIBERNATE_CONTEXT_ID {
        let cleared = shared.context_handle;
        if let Err(status) = shared.datastore.write(shared.datastore_id, &cleared) {
            instance.exit_status = status;
            instance.state = CmdState::ErrorHandler;
        }
    }
}

/// Outcome of a handler call besides its result
struct HandlerRun<T> {
    result: Result<T, OptigaStatus>,
    step: ProcessStep,
    keep_strict_lock: bool,
}

/// Calls the handler of the instance's operation with a view of the instance and chip context
fn run_handler<T>(
    shared: &mut Shared,
    instance: &mut CmdInstance,
    f: impl FnOnce(&mut Operation, &mut HandlerContext) -> Result<T, OptigaStatus>,
) -> HandlerRun<T> {
    let operation = match instance.operation.as_mut() {
        Some(operation) => operation,
        None => {
            return HandlerRun {
                result: Err(OptigaStatus::CmdError),
                step: ProcessStep::ReleaseLock,
                keep_strict_lock: false,
            }
        }
    };
    let mut ctx = HandlerContext::new(&mut shared.context_handle, shared.datastore.as_ref());
    ctx.session_oid = instance.session_oid;
    ctx.chaining = instance.chaining;
    ctx.enter_on_device_error = instance.enter_on_device_error;
    ctx.exit_status = instance.exit_status;
    ctx.manage_context = instance.options.manage_context;
    ctx.datastore_id = shared.datastore_id;

    let result = f(operation, &mut ctx);

    instance.chaining = ctx.chaining;
    instance.enter_on_device_error = ctx.enter_on_device_error;
    instance.options.manage_context = ctx.manage_context;
    HandlerRun {
        result,
        step: ctx.step,
        keep_strict_lock: ctx.keep_strict_lock,
    }
}

fn comms_open(shared: &mut Shared, instance: &mut CmdInstance, index: usize, open: OpenStep) -> Flow {
    match open {
        OpenStep::AcquireLock => {
            shared.request(index, RequestType::Lock);
            instance.state = CmdState::CommsOpen(OpenStep::Start);
            Flow::Exit
        }
        OpenStep::Start => {
            let opened = shared.comms.open(&instance.options);
            shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_RUNNING_TIME_MS);
            match opened {
                Ok(()) => {
                    instance.state = CmdState::CommsOpen(OpenStep::Done);
                    Flow::Exit
                }
                Err(status) => {
                    fail_with_event(instance, status);
                    Flow::Continue
                }
            }
        }
        OpenStep::Done => {
            shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_RUNNING_TIME_MS);
            instance.state = CmdState::PrepareCommand(PrepareStep::PrepareApdu);
            Flow::Exit
        }
    }
}

fn comms_close(
    shared: &mut Shared,
    instance: &mut CmdInstance,
    index: usize,
    close: CloseStep,
) -> Flow {
    match close {
        CloseStep::Start => {
            let mut options = instance.options;
            if shared.protection_level_state == 0 {
                options.manage_context = ManageContext::None;
            }
            shared.protection_level_state = 0;
            let save_context = options.manage_context == ManageContext::Save;
            instance.state = CmdState::CommsClose(CloseStep::Done { save_context });
            if let Err(status) = shared.comms.close(&options) {
                fail_with_event(instance, status);
            }
            if !save_context {
                shared.reset_slot(index);
            }
            Flow::Continue
        }
        CloseStep::Done { save_context } => {
            instance.complete(OptigaStatus::LibSuccess);
            if save_context {
                shared.reset_slot(index);
            }
            Flow::Exit
        }
    }
}

fn prepare_command(
    shared: &mut Shared,
    instance: &mut CmdInstance,
    index: usize,
    prepare: PrepareStep,
) -> Flow {
    match prepare {
        PrepareStep::RequestLock | PrepareStep::RequestSession => {
            let request = if prepare == PrepareStep::RequestSession {
                RequestType::Session
            } else {
                RequestType::Lock
            };
            shared.request(index, request);
            instance.state = CmdState::PrepareCommand(PrepareStep::PrepareApdu);
            Flow::Exit
        }
        PrepareStep::ResetStrictLock => {
            shared.queue.release_strict_lock(index);
            instance.state = CmdState::PrepareCommand(PrepareStep::RequestStrictLock);
            Flow::Continue
        }
        PrepareStep::RequestStrictLock => {
            shared.request(index, RequestType::StrictLock);
            instance.state = CmdState::PrepareCommand(PrepareStep::PrepareApdu);
            Flow::Exit
        }
        PrepareStep::PrepareApdu => {
            let run = run_handler(shared, instance, |operation, ctx| operation.prepare(ctx));
            let tx = match run.result {
                Ok(tx) => tx,
                Err(status) => {
                    instance.exit_status = status;
                    instance.state = CmdState::ErrorHandler;
                    return Flow::Continue;
                }
            };
            shared.protection_level_state |= instance.options.protection_level;
            if let Err(status) = shared.transceive(&tx, &instance.options) {
                clear_app_context(shared, instance);
                fail_with_event(instance, status);
                return Flow::Continue;
            }
            shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
            instance.state = CmdState::ProcessResponse(ProcessStep::ProcessOptigaResponse);
            instance.enter_on_device_error = true;
            Flow::Exit
        }
    }
}

fn process_response(
    shared: &mut Shared,
    instance: &mut CmdInstance,
    index: usize,
    process: ProcessStep,
) -> Flow {
    match process {
        ProcessStep::ProcessOptigaResponse => process_optiga_response(shared, instance, index),
        ProcessStep::GetDeviceError(stage) => get_device_error(shared, instance, index, stage),
        ProcessStep::ReleaseSession => {
            if instance.session_oid != 0 {
                shared.queue.free_session(instance.session_oid);
                debug!("Instance {} released session {:#06x}", index, instance.session_oid);
                instance.session_oid = 0;
            }
            instance.state = if instance.exit_status.is_success() {
                CmdState::ProcessResponse(ProcessStep::ReleaseLock)
            } else {
                CmdState::ProcessResponse(ProcessStep::GetDeviceError(ErrorStage::Prepare))
            };
            Flow::Continue
        }
        ProcessStep::ReleaseLock => {
            shared.reset_slot(index);
            instance.state = CmdState::ProcessResponse(ProcessStep::Exit);
            Flow::Continue
        }
        ProcessStep::Exit => {
            instance.complete(instance.exit_status);
            Flow::Exit
        }
    }
}

fn process_optiga_response(shared: &mut Shared, instance: &mut CmdInstance, index: usize) -> Flow {
    if !instance.enter_on_device_error {
        instance.state = CmdState::ErrorHandler;
        return Flow::Continue;
    }
    // the handler is entered again after the last error code was read
    let reentry = matches!(instance.exit_status, OptigaStatus::DeviceError(_));
    let response = std::mem::replace(&mut shared.response, Vec::new());
    let run = run_handler(shared, instance, |operation, ctx| {
        operation.process_response(ctx, &response)
    });
    shared.response = response;
    if run.keep_strict_lock {
        shared.event.start(shared.timer.now_ms());
    }

    match run.result {
        Ok(()) => {
            instance.exit_status = OptigaStatus::LibSuccess;
            if instance.apdu.cmd == CMD_CLOSE_APPLICATION {
                shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
                instance.state = CmdState::CommsClose(CloseStep::Start);
                Flow::Exit
            } else if !instance.chaining {
                let next = match run.step {
                    ProcessStep::Exit | ProcessStep::ReleaseSession => run.step,
                    _ => ProcessStep::ReleaseLock,
                };
                instance.state = CmdState::ProcessResponse(next);
                Flow::Continue
            } else {
                shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
                instance.options.protection_level &= OPTIGA_PROTECTION_LEVEL_MASK;
                instance.state = CmdState::PrepareCommand(PrepareStep::PrepareApdu);
                Flow::Exit
            }
        }
        Err(status) => {
            instance.exit_status = status;
            let chip_failed = shared.response.first() == Some(&APDU_STATUS_FAILURE);
            instance.state = if status == OptigaStatus::CmdMemoryInsufficient || reentry {
                CmdState::ProcessResponse(ProcessStep::ReleaseLock)
            } else if run.step == ProcessStep::ReleaseSession {
                CmdState::ProcessResponse(ProcessStep::ReleaseSession)
            } else if !chip_failed {
                // the chip succeeded but the response could not be decoded
                CmdState::ProcessResponse(ProcessStep::ReleaseLock)
            } else {
                CmdState::ProcessResponse(ProcessStep::GetDeviceError(ErrorStage::Prepare))
            };
            Flow::Continue
        }
    }
}

fn get_device_error(
    shared: &mut Shared,
    instance: &mut CmdInstance,
    index: usize,
    stage: ErrorStage,
) -> Flow {
    match stage {
        ErrorStage::Prepare => {
            shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
            instance.state = CmdState::ProcessResponse(ProcessStep::GetDeviceError(ErrorStage::Tx));
            Flow::Exit
        }
        ErrorStage::Tx => {
            let transceived = shared.transceive(&last_error_apdu(), &instance.options);
            shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
            if transceived.is_err() {
                instance.exit_status = OptigaStatus::CmdError;
                instance.state = CmdState::ErrorHandler;
                return Flow::Continue;
            }
            instance.state = CmdState::ProcessResponse(ProcessStep::GetDeviceError(ErrorStage::Rx));
            Flow::Exit
        }
        ErrorStage::Rx => {
            let code = if apdu::response_failed(&shared.response) {
                None
            } else {
                apdu::response_data(&shared.response).first().copied()
            };
            match code {
                Some(code) if code != 0 => {
                    debug!("Instance {} device error {:#04x}", index, code);
                    instance.exit_status = OptigaStatus::DeviceError(code);
                    instance.state = CmdState::ProcessResponse(ProcessStep::ProcessOptigaResponse);
                    shared.register(CmdEvent::Execute(index), OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
                    Flow::Exit
                }
                _ => {
                    instance.exit_status = OptigaStatus::DeviceError(0);
                    instance.state = CmdState::ErrorHandler;
                    Flow::Continue
                }
            }
        }
    }
}

impl Shared {
    /// Sends `tx` and keeps the response in the shared buffer
    pub(super) fn transceive(
        &mut self,
        tx: &[u8],
        options: &crate::CommsOptions,
    ) -> Result<(), OptigaStatus> {
        let mut rx = vec![0u8; OPTIGA_MAX_COMMS_BUFFER_SIZE];
        let length = self.comms.transceive(tx, &mut rx, options)?;
        rx.truncate(length);
        self.response = rx;
        Ok(())
    }
}

