//! Physical chip bindings: I2C through Linux `i2c-dev`, UART through a serial port.

use log::{debug, error};
use std::sync::Arc;
use std::time::Duration;

use super::ifx_i2c::IfxI2cComms;
use super::uart::{read_port_name, UartComms};
use super::{OptigaCommsCfg, OptigaIfaceI2c, OptigaIfaceUart, PalTimer};
use super::{DL_HEADER_SIZE, DL_MAX_FRAME_SIZE, TL_HEADER_SIZE};

pub mod i2c;

pub use i2c::{I2cBus, I2cPhysicalLayer, LinuxI2c};

/// Read timeout of the serial port, covers the slowest chip command
const UART_READ_TIMEOUT_MS: u64 = 5000;

fn check_frame_size(frame_size: u16) -> Result<(), String> {
    if (frame_size as usize) <= DL_HEADER_SIZE + TL_HEADER_SIZE
        || frame_size as usize > DL_MAX_FRAME_SIZE
    {
        let err = format!("Unsupported frame size {:#x}", frame_size);
        error!("{}", err);
        return Err(err);
    }
    Ok(())
}

/// Builds the IFX I2C stack on top of `/dev/i2c-<bus>`
pub fn i2c_comms(
    cfg: &OptigaCommsCfg,
    timer: Arc<dyn PalTimer>,
) -> Result<IfxI2cComms<I2cPhysicalLayer<LinuxI2c>>, String> {
    check_frame_size(cfg.frame_size)?;
    let iface = cfg.i2c.clone().unwrap_or_else(OptigaIfaceI2c::default);
    let bus = LinuxI2c::open(iface.bus, iface.slave_address)?;
    let pl = I2cPhysicalLayer::new(bus, &iface, cfg.frame_size, timer.clone());
    Ok(IfxI2cComms::new(pl, timer, cfg.frame_size))
}

/// Opens the serial port named in the UART configuration file
pub fn uart_comms(
    cfg: &OptigaCommsCfg,
) -> Result<UartComms<Box<dyn serialport::SerialPort>>, String> {
    let iface = cfg.uart.clone().unwrap_or_else(OptigaIfaceUart::default);
    let port_name = read_port_name(&iface.config_file).map_err(|status| status.to_string())?;
    let settings = serialport::SerialPortSettings {
        baud_rate: iface.baud,
        data_bits: serialport::DataBits::Eight,
        flow_control: serialport::FlowControl::None,
        parity: serialport::Parity::None,
        stop_bits: serialport::StopBits::One,
        timeout: Duration::from_millis(UART_READ_TIMEOUT_MS),
    };
    let port = serialport::open_with_settings(&port_name, &settings).map_err(|err| {
        let err = format!("Unable to open {}: {}", port_name, err);
        error!("{}", err);
        err
    })?;
    debug!("Opened {} at {} baud", port_name, iface.baud);
    Ok(UartComms::new(port))
}
