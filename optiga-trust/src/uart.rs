//! UART binding: each APDU travels in one `BE EF DE AD` envelope, no data link layer.

use log::{debug, error, trace, warn};
use std::fs;
use std::io::{Read, Write};

use super::frame::{self, UART_HEADER_SIZE};
use super::{CommsOptions, OptigaComms, OptigaStatus};

/// File naming the serial port, read when the channel is created
pub const UART_CONFIG_FILE_NAME: &str = "optiga_comms.ini";
pub const UART_BAUD_RATE: u32 = 115_200;

/// Reads the port name from the first line of the configuration file
pub fn read_port_name(path: &str) -> Result<String, OptigaStatus> {
    let content = fs::read_to_string(path).map_err(|err| {
        error!("Unable to open {}: {}", path, err);
        OptigaStatus::CommsError
    })?;
    match content.lines().next().map(str::trim) {
        Some(port) if !port.is_empty() => Ok(port.to_owned()),
        _ => {
            error!("Unable to read a port name from {}", path);
            Err(OptigaStatus::CommsError)
        }
    }
}

pub struct UartComms<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> UartComms<S> {
    pub fn new(stream: S) -> UartComms<S> {
        UartComms { stream }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), OptigaStatus> {
        self.stream.read_exact(buffer).map_err(|err| {
            warn!("UART read failed: {}", err);
            OptigaStatus::CommsError
        })
    }
}

impl<S: Read + Write> OptigaComms for UartComms<S> {
    fn open(&mut self, _options: &CommsOptions) -> Result<(), OptigaStatus> {
        debug!("UART channel open");
        Ok(())
    }

    fn close(&mut self, _options: &CommsOptions) -> Result<(), OptigaStatus> {
        debug!("UART channel closed");
        Ok(())
    }

    fn transceive(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        _options: &CommsOptions,
    ) -> Result<usize, OptigaStatus> {
        let request = frame::encode_uart_frame(tx)?;
        trace!("UART >> {}", frame::to_hex(&request));
        self.stream
            .write_all(&request)
            .and_then(|_| self.stream.flush())
            .map_err(|err| {
                warn!("UART write failed: {}", err);
                OptigaStatus::CommsError
            })?;

        let mut response = vec![0u8; UART_HEADER_SIZE];
        self.read_exact(&mut response)?;
        let length = frame::decode_uart_header(&response)?;
        response.resize(UART_HEADER_SIZE + length + 2, 0);
        self.read_exact(&mut response[UART_HEADER_SIZE..])?;
        trace!("UART << {}", frame::to_hex(&response));

        let payload = frame::decode_uart_frame(&response)?;
        if payload.len() > rx.len() {
            return Err(OptigaStatus::CommsMemoryInsufficient);
        }
        rx[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }
}
