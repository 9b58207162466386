//! I2C transport layer: splits packets into data link frames and reassembles responses.
//!
//! Every frame starts with the PCTR byte: chaining value in bits 0..2, presence of a
//! presentation layer header in bit 3.

use log::{debug, warn};

use super::data_link::{DataLink, DL_EVENT_ERROR, DL_EVENT_RX_SUCCESS};
use super::super::{OptigaStatus, PalTimer, PhysicalLayer, DL_HEADER_SIZE, TL_HEADER_SIZE};
use std::sync::Arc;

pub const TL_CHAINING_NO: u8 = 0x00;
pub const TL_CHAINING_FIRST: u8 = 0x01;
pub const TL_CHAINING_INTERMEDIATE: u8 = 0x02;
pub const TL_CHAINING_LAST: u8 = 0x04;
pub const TL_CHAINING_ERROR: u8 = 0x07;
pub const TL_PCTR_CHAIN_MASK: u8 = 0x07;
pub const TL_PRESENCE_BIT: u8 = 0x08;
/// Times a packet is sent again after the peer reported a chaining error
pub const TL_CHAINING_ERROR_RETRY: u8 = 1;

/// Chaining values allowed to precede a received chaining value
fn allowed_previous(current: u8) -> &'static [u8] {
    match current {
        TL_CHAINING_NO | TL_CHAINING_FIRST => &[TL_CHAINING_NO, TL_CHAINING_LAST],
        TL_CHAINING_INTERMEDIATE | TL_CHAINING_LAST => {
            &[TL_CHAINING_FIRST, TL_CHAINING_INTERMEDIATE]
        }
        _ => &[],
    }
}

/// Checks a received fragment against the previous chaining value.
/// FIRST and INTERMEDIATE fragments must fill the frame completely.
pub fn chaining_valid(previous: u8, current: u8, frame_len: usize, max_packet: usize) -> bool {
    if !allowed_previous(current).contains(&previous) {
        return false;
    }
    match current {
        TL_CHAINING_FIRST | TL_CHAINING_INTERMEDIATE => frame_len == max_packet + TL_HEADER_SIZE,
        _ => frame_len >= TL_HEADER_SIZE && frame_len <= max_packet + TL_HEADER_SIZE,
    }
}

/// Splits a packet into `(chaining value, fragment)` pairs
pub fn fragments(packet: &[u8], max_packet: usize) -> Vec<(u8, &[u8])> {
    if packet.len() <= max_packet {
        return vec![(TL_CHAINING_NO, packet)];
    }
    let chunks: Vec<&[u8]> = packet.chunks(max_packet).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let chaining = if i == 0 {
                TL_CHAINING_FIRST
            } else if i == last {
                TL_CHAINING_LAST
            } else {
                TL_CHAINING_INTERMEDIATE
            };
            (chaining, chunk)
        })
        .collect()
}

enum Exchange {
    Done(Vec<u8>),
    PeerChainingError,
}

pub struct Transport<P: PhysicalLayer> {
    dl: DataLink<P>,
    frame_size: u16,
    max_packet: usize,
}

impl<P: PhysicalLayer> Transport<P> {
    pub fn new(pl: P, timer: Arc<dyn PalTimer>, frame_size: u16) -> Transport<P> {
        Transport {
            dl: DataLink::new(pl, timer),
            frame_size,
            max_packet: frame_size as usize - (DL_HEADER_SIZE + TL_HEADER_SIZE),
        }
    }

    pub fn init(&mut self) -> Result<(), OptigaStatus> {
        debug!(
            "Transport init, frame size {:#x}, max packet {}",
            self.frame_size, self.max_packet
        );
        self.dl.init()
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn data_link(&self) -> &DataLink<P> {
        &self.dl
    }

    pub fn data_link_mut(&mut self) -> &mut DataLink<P> {
        &mut self.dl
    }

    /// Sends a packet and returns the reassembled response.
    /// The response may not exceed `rx_capacity` bytes.
    pub fn transceive(
        &mut self,
        packet: &[u8],
        presence: bool,
        rx_capacity: usize,
    ) -> Result<Vec<u8>, OptigaStatus> {
        if packet.is_empty() {
            return Err(OptigaStatus::CommsInvalidInput);
        }
        let mut attempt = 0;
        loop {
            match self.exchange(packet, presence, rx_capacity)? {
                Exchange::Done(response) => return Ok(response),
                Exchange::PeerChainingError if attempt < TL_CHAINING_ERROR_RETRY => {
                    attempt += 1;
                    warn!("Peer reported a chaining error, sending the packet again");
                }
                Exchange::PeerChainingError => {
                    warn!("Peer reported a chaining error again");
                    return Err(OptigaStatus::CommsError);
                }
            }
        }
    }

    fn exchange(
        &mut self,
        packet: &[u8],
        presence: bool,
        rx_capacity: usize,
    ) -> Result<Exchange, OptigaStatus> {
        let presence_bit = if presence { TL_PRESENCE_BIT } else { 0x00 };
        let parts = fragments(packet, self.max_packet);
        let last = parts.len() - 1;
        let mut first_response = None;

        for (i, (chaining, chunk)) in parts.into_iter().enumerate() {
            let mut frame = Vec::with_capacity(chunk.len() + TL_HEADER_SIZE);
            frame.push(chaining | presence_bit);
            frame.extend_from_slice(chunk);
            debug!("TL tx fragment {:#04x}, {} bytes", chaining, chunk.len());

            let event = self.dl.send_frame(&frame)?;
            if event.flags & DL_EVENT_ERROR != 0 {
                return Err(OptigaStatus::CommsError);
            }
            if event.flags & DL_EVENT_RX_SUCCESS != 0 {
                let pctr = event.data.first().copied().unwrap_or(TL_CHAINING_ERROR);
                if pctr & TL_PCTR_CHAIN_MASK == TL_CHAINING_ERROR {
                    return Ok(Exchange::PeerChainingError);
                }
                if i != last {
                    warn!("Peer answered before the last fragment");
                    return Err(OptigaStatus::CommsError);
                }
                first_response = Some(event.data);
            }
        }

        self.receive(first_response, rx_capacity)
    }

    fn receive(
        &mut self,
        mut pending: Option<Vec<u8>>,
        rx_capacity: usize,
    ) -> Result<Exchange, OptigaStatus> {
        let mut response = Vec::new();
        let mut previous = TL_CHAINING_NO;
        let mut chaining_error_sent = false;

        loop {
            let data = match pending.take() {
                Some(data) => data,
                None => {
                    let event = self.dl.receive_frame()?;
                    if event.flags & DL_EVENT_ERROR != 0 {
                        return Err(OptigaStatus::CommsError);
                    }
                    event.data
                }
            };
            let pctr = match data.first() {
                Some(pctr) => *pctr,
                None => return Err(OptigaStatus::CommsError),
            };
            let chaining = pctr & TL_PCTR_CHAIN_MASK;
            if chaining == TL_CHAINING_ERROR {
                return Ok(Exchange::PeerChainingError);
            }

            if !chaining_valid(previous, chaining, data.len(), self.max_packet) {
                if chaining_error_sent {
                    warn!("Invalid chaining after restart of the response");
                    return Err(OptigaStatus::CommsError);
                }
                warn!(
                    "Invalid chaining {:#04x} after {:#04x}, asking for the response again",
                    chaining, previous
                );
                chaining_error_sent = true;
                response.clear();
                previous = TL_CHAINING_NO;
                let event = self.dl.send_frame(&[TL_CHAINING_ERROR])?;
                if event.flags & DL_EVENT_ERROR != 0 {
                    return Err(OptigaStatus::CommsError);
                }
                if event.flags & DL_EVENT_RX_SUCCESS != 0 {
                    pending = Some(event.data);
                }
                continue;
            }

            let body = &data[TL_HEADER_SIZE..];
            if response.len() + body.len() > rx_capacity {
                return Err(OptigaStatus::CommsMemoryInsufficient);
            }
            response.extend_from_slice(body);
            debug!("TL rx fragment {:#04x}, {} bytes", chaining, body.len());
            previous = chaining;

            if chaining == TL_CHAINING_NO || chaining == TL_CHAINING_LAST {
                return Ok(Exchange::Done(response));
            }
        }
    }
}
