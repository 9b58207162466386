//! Command layer.
//!
//! One [`OptigaContext`] owns the communication stack of a chip and up to
//! `OPTIGA_CMD_MAX_REGISTRATIONS` command instances. Instances request the chip
//! through the execution queue; a single one-shot event drives either the
//! scheduler or the state machine of the granted instance, so at most one APDU
//! is in flight per chip.

pub mod apdu;
pub mod handlers;
pub mod queue;
pub mod state_machine;

use log::{debug, info, warn};
use std::sync::Arc;

use self::handlers::{key, ApduInfo, Operation};
use self::queue::{ExecutionQueue, QueueSlot, RequestType, Schedule, SlotState};
use self::state_machine::{CmdState, OpenStep, PrepareStep, ProcessStep};
use super::{
    CalcHashParams, CalcSignParams, CalcSsecParams, CloseAppParams, CommsOptions,
    DecryptAsymParams, DeriveKeyParams, EncryptAsymParams, GenKeyPairParams, GenSymKeyParams,
    GetDataObjectParams, GetRandomParams, ManageContext, OpenAppParams, OptigaComms, OptigaStatus,
    PalDatastore, PalOsEvent, PalTimer, ProtectedUpdateTag, SetDataObjectParams,
    SetObjectProtectedParams, ShieldedOption, SymOperation, SymParams, SymSequence,
    VerifySignParams, OPTIGA_APP_CONTEXT_SIZE, OPTIGA_CMD_MAX_REGISTRATIONS,
    OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS, OPTIGA_CMD_SCHEDULER_RUNNING_TIME_MS,
    OPTIGA_DATASTORE_NOT_CONFIGURED, OPTIGA_KEY_ID_SESSION_BASED,
};

/// Callbacks of the chip context event
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CmdEvent {
    Scheduler,
    /// Continue the state machine of the instance in this slot
    Execute(usize),
}

/// Scheduler runs in a row without a grant before `run_until_idle` gives up
const MAX_IDLE_SCHEDULER_RUNS: u32 = 3;

pub type CmdCallback = Box<dyn FnMut(OptigaStatus)>;

/// State shared by all instances of one chip
pub(crate) struct Shared {
    comms: Box<dyn OptigaComms>,
    timer: Arc<dyn PalTimer>,
    datastore: Box<dyn PalDatastore>,
    /// Last APDU response
    response: Vec<u8>,
    queue: ExecutionQueue,
    context_handle: [u8; OPTIGA_APP_CONTEXT_SIZE],
    event: PalOsEvent<CmdEvent>,
    /// Protection levels used since the application was opened
    protection_level_state: u8,
    datastore_id: u16,
    defaults: CommsOptions,
}

impl Shared {
    fn register(&mut self, event: CmdEvent, delay_ms: u32) {
        let now = self.timer.now_ms();
        self.event.register_oneshot(event, now, delay_ms);
    }

    fn arm_scheduler(&mut self) {
        self.register(CmdEvent::Scheduler, OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS);
    }

    fn request(&mut self, index: usize, request_type: RequestType) {
        let now = self.timer.now_us();
        self.queue.update_slot(index, request_type, now);
    }

    /// Gives the chip back and wakes the scheduler
    fn reset_slot(&mut self, index: usize) {
        self.queue.reset_slot(index);
        let now = self.timer.now_ms();
        self.event.start(now);
    }
}

pub(crate) struct CmdInstance {
    session_oid: u16,
    state: CmdState,
    chaining: bool,
    enter_on_device_error: bool,
    exit_status: OptigaStatus,
    /// Last dispatched command
    apdu: ApduInfo,
    options: CommsOptions,
    operation: Option<Operation>,
    callback: CmdCallback,
    busy: bool,
}

impl CmdInstance {
    fn new(callback: CmdCallback, options: CommsOptions) -> CmdInstance {
        CmdInstance {
            session_oid: 0,
            state: CmdState::Idle,
            chaining: false,
            enter_on_device_error: false,
            exit_status: OptigaStatus::LibSuccess,
            apdu: ApduInfo::default(),
            options,
            operation: None,
            callback,
            busy: false,
        }
    }

    /// Ends the operation and reports `status`
    fn complete(&mut self, status: OptigaStatus) {
        debug!("Command {:#04x} completed with {}", self.apdu.cmd, status);
        self.busy = false;
        self.state = CmdState::Idle;
        (self.callback)(status);
    }
}

struct InstanceEntry {
    generation: u32,
    instance: Option<CmdInstance>,
}

/// Refers to one command instance of an [`OptigaContext`]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CmdHandle {
    index: usize,
    generation: u32,
}

impl CmdHandle {
    /// Execution queue slot of the instance
    pub fn slot(self) -> usize {
        self.index
    }
}

/// Chip context: communication stack, execution queue and command instances
pub struct OptigaContext {
    shared: Shared,
    slots: Vec<InstanceEntry>,
    instance_id: u8,
}

impl OptigaContext {
    /// Takes the chip instance `instance_id`; only one context per instance may exist
    pub fn new(
        instance_id: u8,
        comms: Box<dyn OptigaComms>,
        timer: Arc<dyn PalTimer>,
        datastore: Box<dyn PalDatastore>,
    ) -> Result<OptigaContext, OptigaStatus> {
        if !super::acquire_instance(instance_id) {
            warn!("Chip instance {} already has a context", instance_id);
            return Err(OptigaStatus::UtilInstanceInUse);
        }
        let slots = (0..OPTIGA_CMD_MAX_REGISTRATIONS)
            .map(|_| InstanceEntry {
                generation: 0,
                instance: None,
            })
            .collect();
        Ok(OptigaContext {
            shared: Shared {
                comms,
                timer,
                datastore,
                response: Vec::new(),
                queue: ExecutionQueue::default(),
                context_handle: [0u8; OPTIGA_APP_CONTEXT_SIZE],
                event: PalOsEvent::new(CmdEvent::Scheduler),
                protection_level_state: 0,
                datastore_id: OPTIGA_DATASTORE_NOT_CONFIGURED,
                defaults: CommsOptions::default(),
            },
            slots,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    /// Datastore entry of the hibernate context handle
    pub fn set_datastore_id(&mut self, datastore_id: u16) {
        self.shared.datastore_id = datastore_id;
    }

    /// Shielded connection settings of instances created from now on
    pub fn set_default_protection(&mut self, protection_level: u8, protocol_version: u8) {
        self.shared.defaults.protection_level = protection_level;
        self.shared.defaults.protocol_version = protocol_version;
    }

    /// Creates a command instance reporting completions to `callback`.
    ///
    /// Fails with `CmdError` when every queue slot is taken.
    pub fn create<F>(&mut self, callback: F) -> Result<CmdHandle, OptigaStatus>
    where
        F: FnMut(OptigaStatus) + 'static,
    {
        let first = self.shared.queue.count_state(SlotState::NotAssigned)
            == OPTIGA_CMD_MAX_REGISTRATIONS;
        let index = match self.shared.queue.assign_slot() {
            Some(index) => index,
            None => {
                warn!("All {} command slots are assigned", OPTIGA_CMD_MAX_REGISTRATIONS);
                return Err(OptigaStatus::CmdError);
            }
        };
        if first {
            let now = self.shared.timer.now_ms();
            self.shared.event.start(now);
        }
        let entry = &mut self.slots[index];
        entry.instance = Some(CmdInstance::new(Box::new(callback), self.shared.defaults));
        debug!("Command instance created in slot {}", index);
        Ok(CmdHandle {
            index,
            generation: entry.generation,
        })
    }

    /// Releases the instance, its session and its queue slot
    pub fn destroy(&mut self, handle: CmdHandle) -> Result<(), OptigaStatus> {
        let index = self.validate(handle)?;
        let entry = &mut self.slots[index];
        if let Some(instance) = entry.instance.take() {
            if instance.busy {
                warn!("Command instance {} destroyed with an operation in flight", index);
            }
            if instance.session_oid != 0 {
                self.shared.queue.free_session(instance.session_oid);
            }
        }
        entry.generation = entry.generation.wrapping_add(1);
        self.shared.queue.deassign_slot(index);
        if self.shared.queue.count_state(SlotState::NotAssigned) == OPTIGA_CMD_MAX_REGISTRATIONS {
            self.shared.event.stop();
            self.shared.event.take();
        }
        Ok(())
    }

    fn validate(&self, handle: CmdHandle) -> Result<usize, OptigaStatus> {
        match self.slots.get(handle.index) {
            Some(entry) if entry.generation == handle.generation && entry.instance.is_some() => {
                Ok(handle.index)
            }
            _ => Err(OptigaStatus::CmdInvalidInput),
        }
    }

    fn instance(&self, handle: CmdHandle) -> Result<&CmdInstance, OptigaStatus> {
        let index = self.validate(handle)?;
        self.slots[index]
            .instance
            .as_ref()
            .ok_or(OptigaStatus::CmdInvalidInput)
    }

    fn instance_mut(&mut self, handle: CmdHandle) -> Result<&mut CmdInstance, OptigaStatus> {
        let index = self.validate(handle)?;
        self.slots[index]
            .instance
            .as_mut()
            .ok_or(OptigaStatus::CmdInvalidInput)
    }

    /// Slot of an instance that may start an operation
    fn ready_instance(&self, handle: CmdHandle) -> Result<usize, OptigaStatus> {
        if self.instance(handle)?.busy {
            return Err(OptigaStatus::UtilInstanceInUse);
        }
        Ok(handle.index)
    }

    pub fn is_busy(&self, handle: CmdHandle) -> Result<bool, OptigaStatus> {
        Ok(self.instance(handle)?.busy)
    }

    /// Session OID leased by the instance, 0 without a session
    pub fn session_oid(&self, handle: CmdHandle) -> Result<u16, OptigaStatus> {
        Ok(self.instance(handle)?.session_oid)
    }

    pub fn state(&self, handle: CmdHandle) -> Result<CmdState, OptigaStatus> {
        Ok(self.instance(handle)?.state)
    }

    pub fn queue_slot(&self, handle: CmdHandle) -> Result<QueueSlot, OptigaStatus> {
        let index = self.validate(handle)?;
        Ok(*self.shared.queue.slot(index))
    }

    pub fn sessions_in_use(&self) -> usize {
        self.shared.queue.sessions_in_use()
    }

    /// Event waiting to be dispatched
    pub fn pending_event(&self) -> Option<CmdEvent> {
        self.shared.event.pending()
    }

    pub fn set_shielded_connection_option(
        &mut self,
        handle: CmdHandle,
        option: ShieldedOption,
    ) -> Result<(), OptigaStatus> {
        let instance = self.instance_mut(handle)?;
        match option {
            ShieldedOption::ProtectionLevel(level) => instance.options.protection_level = level,
            ShieldedOption::ProtocolVersion(version) => instance.options.protocol_version = version,
            ShieldedOption::ManageContext(manage) => instance.options.manage_context = manage,
        }
        Ok(())
    }

    /// Gives the parameter block of the last operation back once it completed
    pub fn take_operation(&mut self, handle: CmdHandle) -> Result<Operation, OptigaStatus> {
        let instance = self.instance_mut(handle)?;
        if instance.busy {
            return Err(OptigaStatus::UtilInstanceInUse);
        }
        instance.operation.take().ok_or(OptigaStatus::CmdError)
    }

    /// Returns the session of an idle instance to the pool
    pub fn release_session(&mut self, handle: CmdHandle) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        if let Some(instance) = self.slots[index].instance.as_mut() {
            if instance.session_oid != 0 {
                self.shared.queue.free_session(instance.session_oid);
                instance.session_oid = 0;
            }
        }
        Ok(())
    }

    /// Dispatches the pending event if its delay elapsed
    pub fn tick(&mut self) -> bool {
        let now = self.shared.timer.now_ms();
        match self.shared.event.take_due(now) {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatches the pending event without waiting for its delay
    pub fn run_pending(&mut self) -> bool {
        match self.shared.event.take() {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatches events until no instance has an operation in flight.
    ///
    /// Fails with `Busy` when the scheduler keeps finding nothing to grant.
    pub fn run_until_idle(&mut self) -> Result<(), OptigaStatus> {
        let mut idle_runs = 0;
        while self.any_busy() {
            let granted = match self.shared.event.take() {
                Some(CmdEvent::Scheduler) => self.run_scheduler(),
                Some(event) => {
                    self.dispatch(event);
                    true
                }
                None => {
                    self.shared.arm_scheduler();
                    false
                }
            };
            if granted {
                idle_runs = 0;
            } else {
                idle_runs += 1;
                if idle_runs >= MAX_IDLE_SCHEDULER_RUNS {
                    warn!("Scheduler makes no progress");
                    return Err(OptigaStatus::Busy);
                }
            }
        }
        Ok(())
    }

    fn any_busy(&self) -> bool {
        self.slots
            .iter()
            .filter_map(|entry| entry.instance.as_ref())
            .any(|instance| instance.busy)
    }

    fn dispatch(&mut self, event: CmdEvent) {
        match event {
            CmdEvent::Scheduler => {
                self.run_scheduler();
            }
            CmdEvent::Execute(index) => self.execute(index),
        }
    }

    /// One scheduler run, returns whether a slot was granted
    fn run_scheduler(&mut self) -> bool {
        if self.shared.queue.idle() {
            self.shared.arm_scheduler();
            return false;
        }
        self.shared.event.stop();
        let mut held_sessions = [false; OPTIGA_CMD_MAX_REGISTRATIONS];
        for (held, entry) in held_sessions.iter_mut().zip(self.slots.iter()) {
            *held = entry
                .instance
                .as_ref()
                .map_or(false, |instance| instance.session_oid != 0);
        }
        match self.shared.queue.schedule(&held_sessions) {
            Schedule::Granted { slot, session } => {
                if let (Some(instance), Some(session_oid)) =
                    (self.slots[slot].instance.as_mut(), session)
                {
                    debug!("Slot {} leased session {:#06x}", slot, session_oid);
                    instance.session_oid = session_oid;
                }
                debug!("Slot {} granted the chip", slot);
                self.shared
                    .register(CmdEvent::Execute(slot), OPTIGA_CMD_SCHEDULER_RUNNING_TIME_MS);
                true
            }
            Schedule::Idle | Schedule::NoneSelectable => {
                self.shared.arm_scheduler();
                false
            }
        }
    }

    fn holds_strict_lock(&self, index: usize) -> bool {
        let slot = self.shared.queue.slot(index);
        slot.request_type == RequestType::StrictLock && slot.state == SlotState::Processing
    }

    /// Hands `operation` to the instance and runs it up to its first request
    fn start(
        &mut self,
        index: usize,
        operation: Operation,
        state: CmdState,
        manage_context: Option<ManageContext>,
    ) -> Result<(), OptigaStatus> {
        let instance = self.slots[index]
            .instance
            .as_mut()
            .ok_or(OptigaStatus::CmdInvalidInput)?;
        instance.apdu = operation.apdu_info();
        instance.operation = Some(operation);
        instance.state = state;
        instance.exit_status = OptigaStatus::LibSuccess;
        instance.chaining = false;
        instance.enter_on_device_error = false;
        if let Some(manage_context) = manage_context {
            instance.options.manage_context = manage_context;
        }
        instance.busy = true;
        debug!("Slot {} starts command {:#04x}", index, instance.apdu.cmd);
        self.execute(index);
        Ok(())
    }

    fn start_locked(&mut self, handle: CmdHandle, operation: Operation) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        self.start(
            index,
            operation,
            CmdState::PrepareCommand(PrepareStep::RequestLock),
            None,
        )
    }

    fn start_with_session(
        &mut self,
        handle: CmdHandle,
        operation: Operation,
        needs_session: bool,
    ) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        let step = if needs_session {
            PrepareStep::RequestSession
        } else {
            PrepareStep::RequestLock
        };
        self.start(index, operation, CmdState::PrepareCommand(step), None)
    }

    /// Fails when `oid` names the session but the instance holds none
    fn check_session_key(&self, handle: CmdHandle, oid: u16) -> Result<(), OptigaStatus> {
        if oid == OPTIGA_KEY_ID_SESSION_BASED && self.instance(handle)?.session_oid == 0 {
            warn!("Session based key without an acquired session");
            return Err(OptigaStatus::CmdInvalidInput);
        }
        Ok(())
    }

    /// Opens the application, restoring a hibernated context when asked
    pub fn open_application(
        &mut self,
        handle: CmdHandle,
        params: OpenAppParams,
    ) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        let manage_context = if params.hibernate {
            Some(ManageContext::Restore)
        } else {
            None
        };
        info!("Open application on chip instance {}", self.instance_id);
        self.start(
            index,
            Operation::OpenApplication(params),
            CmdState::CommsOpen(OpenStep::AcquireLock),
            manage_context,
        )
    }

    /// Closes the application; with hibernate the context handle is saved
    pub fn close_application(
        &mut self,
        handle: CmdHandle,
        params: CloseAppParams,
    ) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        let manage_context = if params.hibernate {
            Some(ManageContext::Save)
        } else {
            None
        };
        info!("Close application on chip instance {}", self.instance_id);
        self.start(
            index,
            Operation::CloseApplication(params),
            CmdState::PrepareCommand(PrepareStep::RequestLock),
            manage_context,
        )
    }

    pub fn get_data_object(
        &mut self,
        handle: CmdHandle,
        params: GetDataObjectParams,
    ) -> Result<(), OptigaStatus> {
        self.start_locked(handle, Operation::GetDataObject(params))
    }

    pub fn set_data_object(
        &mut self,
        handle: CmdHandle,
        params: SetDataObjectParams,
    ) -> Result<(), OptigaStatus> {
        self.start_locked(handle, Operation::SetDataObject(params))
    }

    /// Random bytes; a pre-master secret is kept in a session of the instance
    pub fn get_random(
        &mut self,
        handle: CmdHandle,
        params: GetRandomParams,
    ) -> Result<(), OptigaStatus> {
        let needs_session = params.store_in_session;
        self.start_with_session(handle, Operation::GetRandom(params), needs_session)
    }

    pub fn calc_hash(
        &mut self,
        handle: CmdHandle,
        mut params: CalcHashParams,
    ) -> Result<(), OptigaStatus> {
        params.start();
        self.start_locked(handle, Operation::CalcHash(params))
    }

    pub fn calc_sign(
        &mut self,
        handle: CmdHandle,
        params: CalcSignParams,
    ) -> Result<(), OptigaStatus> {
        self.check_session_key(handle, params.private_key_oid)?;
        let needs_session = params.private_key_oid == OPTIGA_KEY_ID_SESSION_BASED;
        self.start_with_session(handle, Operation::CalcSign(params), needs_session)
    }

    pub fn verify_sign(
        &mut self,
        handle: CmdHandle,
        params: VerifySignParams,
    ) -> Result<(), OptigaStatus> {
        self.start_locked(handle, Operation::VerifySign(params))
    }

    pub fn calc_ssec(
        &mut self,
        handle: CmdHandle,
        params: CalcSsecParams,
    ) -> Result<(), OptigaStatus> {
        self.check_session_key(handle, params.private_key_oid)?;
        let needs_session = key::ssec_needs_session(&params);
        self.start_with_session(handle, Operation::CalcSsec(params), needs_session)
    }

    pub fn derive_key(
        &mut self,
        handle: CmdHandle,
        params: DeriveKeyParams,
    ) -> Result<(), OptigaStatus> {
        self.check_session_key(handle, params.input_secret_oid)?;
        let needs_session = key::derive_needs_session(&params);
        self.start_with_session(handle, Operation::DeriveKey(params), needs_session)
    }

    pub fn gen_keypair(
        &mut self,
        handle: CmdHandle,
        params: GenKeyPairParams,
    ) -> Result<(), OptigaStatus> {
        let needs_session = key::keypair_needs_session(&params);
        self.start_with_session(handle, Operation::GenKeyPair(params), needs_session)
    }

    /// RSA encryption of a message, or of the secret held in the instance's session
    pub fn encrypt_asym(
        &mut self,
        handle: CmdHandle,
        params: EncryptAsymParams,
    ) -> Result<(), OptigaStatus> {
        if params.message.is_none() && self.instance(handle)?.session_oid == 0 {
            warn!("Encrypting session data without an acquired session");
            return Err(OptigaStatus::CmdInvalidInput);
        }
        self.start_locked(handle, Operation::EncryptAsym(params))
    }

    /// RSA decryption, exported or kept in a session of the instance
    pub fn decrypt_asym(
        &mut self,
        handle: CmdHandle,
        params: DecryptAsymParams,
    ) -> Result<(), OptigaStatus> {
        let needs_session = params.decrypted.is_none();
        self.start_with_session(handle, Operation::DecryptAsym(params), needs_session)
    }

    pub fn encrypt_sym(&mut self, handle: CmdHandle, params: SymParams) -> Result<(), OptigaStatus> {
        self.start_sym(handle, params, false)
    }

    /// Decryption, HMAC verification or clearing the auto state
    pub fn decrypt_sym(&mut self, handle: CmdHandle, params: SymParams) -> Result<(), OptigaStatus> {
        self.start_sym(handle, params, true)
    }

    /// Symmetric sequences run under a strict lock held from START to FINAL
    fn start_sym(
        &mut self,
        handle: CmdHandle,
        mut params: SymParams,
        decrypt: bool,
    ) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        let (session_oid, previous) = {
            let instance = self.instance(handle)?;
            (instance.session_oid, instance.apdu)
        };
        params.start(decrypt);

        let needs_session = if decrypt {
            params.mode.is_hmac() && params.operation == SymOperation::Hmac
        } else {
            params.mode.is_hmac() && params.key_oid == OPTIGA_KEY_ID_SESSION_BASED
        };
        if needs_session && session_oid == 0 {
            warn!("HMAC over a session without an acquired session");
            return Err(OptigaStatus::CmdInvalidInput);
        }

        let continuing = params.sequence == SymSequence::Continue
            || params.sequence == SymSequence::Final;
        let strict_lock_held = self.holds_strict_lock(index);
        if continuing && !strict_lock_held {
            warn!("{:?} without a strict lock held by the instance", params.sequence);
            return Err(OptigaStatus::CmdInvalidInput);
        }

        let operation = if decrypt {
            Operation::DecryptSym(params)
        } else {
            Operation::EncryptSym(params)
        };
        let info = operation.apdu_info();
        if continuing && (previous.cmd != info.cmd || previous.param != info.param) {
            // the strict lock belongs to another sequence; give it up
            warn!(
                "Sequence of command {:#04x} continued by command {:#04x}",
                previous.cmd, info.cmd
            );
            self.shared.reset_slot(index);
            return Err(OptigaStatus::CmdInvalidInput);
        }

        let step = if strict_lock_held && !continuing {
            PrepareStep::ResetStrictLock
        } else {
            PrepareStep::RequestStrictLock
        };
        self.start(index, operation, CmdState::PrepareCommand(step), None)
    }

    /// Protected update: manifest, then fragments, under one strict lock
    pub fn set_object_protected(
        &mut self,
        handle: CmdHandle,
        params: SetObjectProtectedParams,
    ) -> Result<(), OptigaStatus> {
        let index = self.ready_instance(handle)?;
        let previous = self.instance(handle)?.apdu;
        let continuing = params.tag != ProtectedUpdateTag::Start;
        let strict_lock_held = self.holds_strict_lock(index);
        if continuing && !strict_lock_held {
            warn!("Protected update fragment without a strict lock held by the instance");
            return Err(OptigaStatus::CmdInvalidInput);
        }
        if continuing && previous.cmd != apdu::CMD_SET_OBJECT_PROTECTED {
            warn!("Protected update continued after command {:#04x}", previous.cmd);
            self.shared.reset_slot(index);
            return Err(OptigaStatus::CmdInvalidInput);
        }

        let state = if params.buffer.is_none() && params.tag == ProtectedUpdateTag::Final {
            // nothing to send, only the strict lock is given up
            CmdState::ProcessResponse(ProcessStep::ReleaseLock)
        } else if strict_lock_held && !continuing {
            CmdState::PrepareCommand(PrepareStep::ResetStrictLock)
        } else {
            CmdState::PrepareCommand(PrepareStep::RequestStrictLock)
        };
        self.start(index, Operation::SetObjectProtected(params), state, None)
    }

    pub fn gen_symkey(
        &mut self,
        handle: CmdHandle,
        params: GenSymKeyParams,
    ) -> Result<(), OptigaStatus> {
        self.start_locked(handle, Operation::GenSymKey(params))
    }
}

impl Drop for OptigaContext {
    fn drop(&mut self) {
        super::release_instance(self.instance_id);
    }
}
