//! Host side protocol stack for OPTIGA Trust secure elements.
//!
//! Layers, bottom up: physical layer (I2C, UART or a simulated chip), data link
//! (ARQ with CRC16 and resync), transport (fragment chaining), presentation
//! (shielded connection boundary) and the command layer which schedules many
//! command instances over one chip and encodes/decodes the APDUs.

#[macro_use]
extern crate lazy_static;

use log::error;
use std::sync::{Arc, Mutex};

include!("./types.rs");

pub mod cmd;
mod comms_cfg;
pub mod frame;
#[cfg(feature = "hardware-backend")]
pub mod hw_impl;
pub mod ifx_i2c;
pub mod pal;
pub mod presentation;
pub mod sw_impl;
pub mod uart;

#[cfg(test)]
mod unit_tests;

pub use cmd::{CmdCallback, CmdHandle, OptigaContext};
pub use comms_cfg::{manage_context_from_str, OPTIGA_I2C_BASE_ADDRESS, SIM_DEFAULT_DROP_PERIOD};
pub use pal::{FileDatastore, ManualTimer, MemoryDatastore, PalOsEvent, SystemTimer};

/// Size of the shared APDU buffer of a chip context
pub const OPTIGA_MAX_COMMS_BUFFER_SIZE: usize = 0x615;
/// APDU header: command, parameter, 2 bytes length
pub const OPTIGA_CMD_APDU_HEADER_SIZE: usize = 4;
/// Number of command instances that can be registered with one chip context
pub const OPTIGA_CMD_MAX_REGISTRATIONS: usize = 6;
/// Number of chip side session contexts
pub const OPTIGA_CMD_MAX_SESSIONS: usize = 4;
/// OID of the first session context; the others follow consecutively
pub const OPTIGA_CMD_SESSION_BASE_OID: u16 = 0xE100;
/// Scheduler poll period while nothing can be granted
pub const OPTIGA_CMD_SCHEDULER_IDLING_TIME_MS: u32 = 1000;
/// Delay before a granted or continuing instance is executed
pub const OPTIGA_CMD_SCHEDULER_RUNNING_TIME_MS: u32 = 50;
/// Key/secret OID value selecting the session acquired by the instance
pub const OPTIGA_KEY_ID_SESSION_BASED: u16 = 0x0000;
/// Size of the saved shielded connection context handle
pub const OPTIGA_APP_CONTEXT_SIZE: usize = 8;
/// Datastore slot holding the hibernate context handle
pub const OPTIGA_HIBERNATE_CONTEXT_ID: u16 = 0x33;
pub const OPTIGA_DATASTORE_NOT_CONFIGURED: u16 = 0x00;
/// Data object keeping the last error code of the chip
pub const OPTIGA_LAST_ERROR_CODE_OID: u16 = 0xF1C2;
/// Device error code reported when reading past the end of a data object
pub const OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY: u8 = 0x08;
/// Open/close application parameter without hibernate
pub const OPTIGA_CMD_PARAM_INITIALIZE_APP_CONTEXT: u8 = 0x00;
/// Open/close application parameter restoring/saving the hibernate context
pub const OPTIGA_CMD_PARAM_HIBERNATE: u8 = 0x01;
/// Largest in-data field of a symmetric APDU
pub const OPTIGA_CMD_SYM_MAX_INDATA_LENGTH: u16 = 640;
/// Marker of a symmetric sequence that has not been sent yet
pub(crate) const RESET_SEQUENCE: u8 = 0xFF;
/// Unique application identifier of the Trust application
pub const OPTIGA_APPLICATION_ID: [u8; 16] = [
    0xD2, 0x76, 0x00, 0x00, 0x04, 0x47, 0x65, 0x6E, 0x41, 0x75, 0x74, 0x68, 0x41, 0x70, 0x70, 0x6C,
];

/// Protection levels of the shielded connection
pub const OPTIGA_COMMS_NO_PROTECTION: u8 = 0x00;
pub const OPTIGA_COMMS_COMMAND_PROTECTION: u8 = 0x01;
pub const OPTIGA_COMMS_RESPONSE_PROTECTION: u8 = 0x02;
pub const OPTIGA_COMMS_FULL_PROTECTION: u8 = 0x03;
/// Marks a command which re-establishes the shielded connection
pub const OPTIGA_COMMS_RE_ESTABLISH: u8 = 0x80;
pub const OPTIGA_PROTECTION_LEVEL_MASK: u8 = 0x03;
pub const OPTIGA_COMMS_PROTOCOL_VERSION_PRE_SHARED_SECRET: u8 = 0x01;

/// Data link constants
pub const DL_MAX_FRAME_SIZE: usize = 300;
pub const DL_HEADER_SIZE: usize = 5;
pub const DL_TRANS_REPEAT: u8 = 3;
pub const DL_DEFAULT_FRAME_SIZE: u16 = 0x115;
pub const TL_MAX_EXIT_TIMEOUT_MS: u32 = 180_000;
pub const TL_HEADER_SIZE: usize = 1;

/// Moves one frame to or from the chip.
///
/// Implementations are synchronous: a call returns once the transfer completed
/// or failed. `CommsFatal` signals a failure the link cannot recover from.
pub trait PhysicalLayer {
    fn init(&mut self) -> Result<(), OptigaStatus>;
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), OptigaStatus>;
    /// Receives one frame into `buffer`, returns its length
    fn receive_frame(&mut self, buffer: &mut [u8]) -> Result<usize, OptigaStatus>;
}

impl<P: PhysicalLayer + ?Sized> PhysicalLayer for Box<P> {
    fn init(&mut self) -> Result<(), OptigaStatus> {
        (**self).init()
    }
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), OptigaStatus> {
        (**self).send_frame(frame)
    }
    fn receive_frame(&mut self, buffer: &mut [u8]) -> Result<usize, OptigaStatus> {
        (**self).receive_frame(buffer)
    }
}

/// Monotonic time source; both counters wrap around at `u32::MAX`
pub trait PalTimer: Send + Sync {
    fn now_ms(&self) -> u32;
    fn now_us(&self) -> u32;
}

/// Non-volatile key/value storage
pub trait PalDatastore {
    fn read(&self, id: u16) -> Result<Vec<u8>, OptigaStatus>;
    fn write(&self, id: u16, data: &[u8]) -> Result<(), OptigaStatus>;
}

/// Shielded connection settings applied to one exchange
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CommsOptions {
    pub protection_level: u8,
    pub protocol_version: u8,
    pub manage_context: ManageContext,
}

impl Default for CommsOptions {
    fn default() -> CommsOptions {
        CommsOptions {
            protection_level: OPTIGA_COMMS_NO_PROTECTION,
            protocol_version: OPTIGA_COMMS_PROTOCOL_VERSION_PRE_SHARED_SECRET,
            manage_context: ManageContext::None,
        }
    }
}

/// The communication stack as seen by the command layer
pub trait OptigaComms {
    fn open(&mut self, options: &CommsOptions) -> Result<(), OptigaStatus>;
    fn close(&mut self, options: &CommsOptions) -> Result<(), OptigaStatus>;
    /// Sends an APDU and receives the response into `rx`, returns the response length
    fn transceive(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        options: &CommsOptions,
    ) -> Result<usize, OptigaStatus>;
}

struct OptigaResourceManager {
    acquired: Vec<u8>,
}

lazy_static! {
    static ref OPTIGA_RESOURCE_MANAGER: Mutex<OptigaResourceManager> =
        Mutex::new(OptigaResourceManager {
            acquired: Vec::new()
        });
}

impl OptigaResourceManager {
    // Aquire an acceptance to create a context for the chip instance
    fn acquire(&mut self, instance_id: u8) -> bool {
        if self.acquired.contains(&instance_id) {
            false
        } else {
            self.acquired.push(instance_id);
            true
        }
    }

    // Release a reservation of the chip instance
    fn release(&mut self, instance_id: u8) -> bool {
        match self.acquired.iter().position(|id| *id == instance_id) {
            Some(pos) => {
                self.acquired.remove(pos);
                true
            }
            None => false,
        }
    }
}

pub(crate) fn acquire_instance(instance_id: u8) -> bool {
    match OPTIGA_RESOURCE_MANAGER.lock() {
        Ok(mut manager) => manager.acquire(instance_id),
        Err(_) => false,
    }
}

pub(crate) fn release_instance(instance_id: u8) -> bool {
    match OPTIGA_RESOURCE_MANAGER.lock() {
        Ok(mut manager) => manager.release(instance_id),
        Err(_) => false,
    }
}

/// Creates the chip context for the configured interface
pub fn setup_optiga_context(cfg: OptigaCommsCfg) -> Result<OptigaContext, String> {
    let timer: Arc<dyn PalTimer> = Arc::new(SystemTimer::default());
    let datastore: Box<dyn PalDatastore> = match &cfg.datastore_path {
        Some(path) => Box::new(FileDatastore::new(path)),
        None => Box::new(MemoryDatastore::default()),
    };
    let comms: Box<dyn OptigaComms> = match cfg.iface_type {
        OptigaIfaceType::Simulator => Box::new(sw_impl::simulated_comms(&cfg)?),
        #[cfg(feature = "hardware-backend")]
        OptigaIfaceType::I2c => Box::new(hw_impl::i2c_comms(&cfg, timer.clone())?),
        #[cfg(feature = "hardware-backend")]
        OptigaIfaceType::Uart => Box::new(hw_impl::uart_comms(&cfg)?),
        _ => {
            let err = format!("Interface {:?} is not available", cfg.iface_type);
            error!("{}", err);
            return Err(err);
        }
    };
    let mut context = OptigaContext::new(cfg.instance_id, comms, timer, datastore)
        .map_err(|status| status.to_string())?;
    context.set_datastore_id(cfg.datastore_id);
    context.set_default_protection(cfg.protection_level, cfg.protocol_version);
    Ok(context)
}
