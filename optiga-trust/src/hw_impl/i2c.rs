//! IFX I2C physical layer: frames go through the DATA register, the I2C_STATE
//! register tells when the chip has a response and how long it is.

use log::{debug, error, trace, warn};
use std::ffi::CString;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::super::frame;
use super::super::{OptigaIfaceI2c, OptigaStatus, PalTimer, PhysicalLayer};

/// Register the frames are written to and read from
pub const PL_REG_DATA: u8 = 0x80;
/// Frame size register
pub const PL_REG_DATA_REG_LEN: u8 = 0x81;
/// Busy/response-ready flags and the length of the pending response
pub const PL_REG_I2C_STATE: u8 = 0x82;

pub const PL_STATE_BUSY: u8 = 0x80;
pub const PL_STATE_RESPONSE_READY: u8 = 0x40;
const PL_I2C_STATE_SIZE: usize = 4;
/// Interval between I2C_STATE reads while the chip prepares a response
pub const PL_DATA_POLLING_INTERVAL_US: u32 = 5000;

/// Raw transfers with the chip's slave address already selected
pub trait I2cBus {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<()>;
}

/// `ioctl` selecting the slave address of an `i2c-dev` handle
const I2C_SLAVE: u16 = 0x0703;

/// Linux `i2c-dev` character device
pub struct LinuxI2c {
    fd: libc::c_int,
    path: String,
}

impl LinuxI2c {
    pub fn open(bus: u8, slave_address: u8) -> Result<LinuxI2c, String> {
        let path = format!("/dev/i2c-{}", bus);
        let c_path = CString::new(path.clone()).map_err(|err| err.to_string())?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            let err = format!("Unable to open {}: {}", path, io::Error::last_os_error());
            error!("{}", err);
            return Err(err);
        }
        let device = LinuxI2c { fd, path };
        if unsafe { libc::ioctl(device.fd, I2C_SLAVE as _, slave_address as libc::c_ulong) } < 0 {
            let err = format!(
                "Unable to select slave {:#04x} on {}: {}",
                slave_address,
                device.path,
                io::Error::last_os_error()
            );
            error!("{}", err);
            return Err(err);
        }
        debug!("Opened {} for slave {:#04x}", device.path, slave_address);
        Ok(device)
    }
}

impl I2cBus for LinuxI2c {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let written =
            unsafe { libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len()) };
        match written {
            n if n < 0 => Err(io::Error::last_os_error()),
            n if n as usize != data.len() => Err(io::Error::from(io::ErrorKind::WriteZero)),
            _ => Ok(()),
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<()> {
        let read =
            unsafe { libc::read(self.fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        match read {
            n if n < 0 => Err(io::Error::last_os_error()),
            n if n as usize != buffer.len() => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            _ => Ok(()),
        }
    }
}

impl Drop for LinuxI2c {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Register protocol of the chip over any [`I2cBus`]
pub struct I2cPhysicalLayer<B: I2cBus> {
    bus: B,
    timer: Arc<dyn PalTimer>,
    guard_time_us: u32,
    polling_interval_us: u32,
    polling_retries: u32,
    frame_size: u16,
    last_transfer_us: Option<u32>,
}

impl<B: I2cBus> I2cPhysicalLayer<B> {
    pub fn new(
        bus: B,
        cfg: &OptigaIfaceI2c,
        frame_size: u16,
        timer: Arc<dyn PalTimer>,
    ) -> I2cPhysicalLayer<B> {
        I2cPhysicalLayer {
            bus,
            timer,
            guard_time_us: cfg.guard_time_us,
            polling_interval_us: cfg.polling_interval_us,
            polling_retries: cfg.polling_retries,
            frame_size,
            last_transfer_us: None,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Keeps the guard time between the end of a transfer and the next one
    fn wait_guard_time(&self) {
        if let Some(last) = self.last_transfer_us {
            let elapsed = self.timer.now_us().wrapping_sub(last);
            if elapsed < self.guard_time_us {
                thread::sleep(Duration::from_micros((self.guard_time_us - elapsed) as u64));
            }
        }
    }

    /// Runs `transfer`, repeating it while the chip does not acknowledge
    fn with_retries<F>(&mut self, what: &str, mut transfer: F) -> Result<(), OptigaStatus>
    where
        F: FnMut(&mut B) -> io::Result<()>,
    {
        for attempt in 0..=self.polling_retries {
            self.wait_guard_time();
            let result = transfer(&mut self.bus);
            self.last_transfer_us = Some(self.timer.now_us());
            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.polling_retries => {
                    trace!("I2C {} not acknowledged ({}), retrying", what, err);
                    thread::sleep(Duration::from_micros(self.polling_interval_us as u64));
                }
                Err(err) => {
                    warn!("I2C {} failed after {} attempts: {}", what, attempt + 1, err);
                }
            }
        }
        Err(OptigaStatus::CommsError)
    }

    fn write_register(&mut self, register: u8, data: &[u8]) -> Result<(), OptigaStatus> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(register);
        packet.extend_from_slice(data);
        self.with_retries("write", |bus| bus.write(&packet))
    }

    fn read_register(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), OptigaStatus> {
        self.with_retries("register select", |bus| bus.write(&[register]))?;
        self.with_retries("read", |bus| bus.read(buffer))
    }

    /// Waits for a response, returns its length
    fn poll_response(&mut self) -> Result<usize, OptigaStatus> {
        let mut state = [0u8; PL_I2C_STATE_SIZE];
        for _ in 0..=self.polling_retries {
            self.read_register(PL_REG_I2C_STATE, &mut state)?;
            let length = u16::from_be_bytes([state[2], state[3]]) as usize;
            if state[0] & PL_STATE_RESPONSE_READY != 0 && length != 0 {
                return Ok(length);
            }
            if state[0] & PL_STATE_BUSY != 0 {
                trace!("Chip busy");
            }
            thread::sleep(Duration::from_micros(PL_DATA_POLLING_INTERVAL_US as u64));
        }
        warn!("I2C response not ready after {} polls", self.polling_retries + 1);
        Err(OptigaStatus::CommsError)
    }
}

impl<B: I2cBus> PhysicalLayer for I2cPhysicalLayer<B> {
    /// Negotiates the frame size with the chip
    fn init(&mut self) -> Result<(), OptigaStatus> {
        self.write_register(PL_REG_DATA_REG_LEN, &self.frame_size.to_be_bytes())?;
        let mut length = [0u8; 2];
        self.read_register(PL_REG_DATA_REG_LEN, &mut length)?;
        let accepted = u16::from_be_bytes(length);
        if accepted < self.frame_size {
            error!(
                "Chip accepts frames of {} bytes, {} requested",
                accepted, self.frame_size
            );
            return Err(OptigaStatus::CommsFatal);
        }
        debug!("I2C frame size {}", self.frame_size);
        Ok(())
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), OptigaStatus> {
        trace!("PL >> {}", frame::to_hex(frame));
        self.write_register(PL_REG_DATA, frame)
    }

    fn receive_frame(&mut self, buffer: &mut [u8]) -> Result<usize, OptigaStatus> {
        let length = self.poll_response()?;
        if length > buffer.len() {
            warn!("Response of {} bytes does not fit {}", length, buffer.len());
            return Err(OptigaStatus::CommsMemoryInsufficient);
        }
        self.read_register(PL_REG_DATA, &mut buffer[..length])?;
        trace!("PL << {}", frame::to_hex(&buffer[..length]));
        Ok(length)
    }
}
