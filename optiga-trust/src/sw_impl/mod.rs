//! In-process simulated chip behind the real I2C protocol stack.
//!
//! [`SimulatedLink`] plays the chip side of the data link and transport layers
//! as a [`PhysicalLayer`], so frames produced by the host stack are parsed,
//! acknowledged and answered the way the chip would. Complete APDUs are handed
//! to an [`ApduResponder`], normally a [`SimulatedChip`].

mod chip;

pub use self::chip::SimulatedChip;

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};

use super::frame::{self, ControlByte, SeqCtr};
use super::ifx_i2c::transport::{
    self, TL_CHAINING_ERROR, TL_CHAINING_FIRST, TL_CHAINING_INTERMEDIATE, TL_CHAINING_LAST,
    TL_CHAINING_NO, TL_PCTR_CHAIN_MASK,
};
use super::ifx_i2c::IfxI2cComms;
use super::pal::ManualTimer;
use super::{
    OptigaChipType, OptigaCommsCfg, OptigaStatus, PalTimer, PhysicalLayer, DL_HEADER_SIZE,
    TL_HEADER_SIZE,
};

const SEQ_NR_MAX: u8 = 0x03;
/// Simulated time spent by one bus transfer
const TRANSFER_TIME_MS: u32 = 10;
/// Simulated time spent by a transfer that fails
const FAILED_TRANSFER_TIME_MS: u32 = 1000;

/// Answers one complete command APDU
pub trait ApduResponder {
    fn respond(&mut self, apdu: &[u8]) -> Vec<u8>;
}

/// Misbehaviour injected into the simulated link
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LinkFault {
    None,
    /// Every transfer fails
    AlwaysFail,
    /// Every n-th frame sent by the host is lost
    DropEveryNth(u8),
}

impl From<OptigaChipType> for LinkFault {
    fn from(chip_type: OptigaChipType) -> LinkFault {
        match chip_type {
            OptigaChipType::SimAlwaysFail => LinkFault::AlwaysFail,
            OptigaChipType::SimLossyLink(period) => LinkFault::DropEveryNth(period),
            _ => LinkFault::None,
        }
    }
}

/// Chip side of the data link and transport layers
pub struct SimulatedLink<R: ApduResponder> {
    responder: R,
    timer: Arc<ManualTimer>,
    fault: LinkFault,
    max_packet: usize,
    host_frames: u32,
    tx_seq_nr: u8,
    rx_seq_nr: u8,
    /// Frames waiting to be read by the host
    replies: VecDeque<Vec<u8>>,
    /// Last data frame sent and not acknowledged yet
    unacked: Option<Vec<u8>>,
    /// Command packet being reassembled
    incoming: Vec<u8>,
    collecting: bool,
    /// Response fragments not sent yet, PCTR included
    outgoing: VecDeque<Vec<u8>>,
    last_response: Vec<u8>,
}

impl<R: ApduResponder> SimulatedLink<R> {
    pub fn new(
        responder: R,
        frame_size: u16,
        fault: LinkFault,
        timer: Arc<ManualTimer>,
    ) -> SimulatedLink<R> {
        SimulatedLink {
            responder,
            timer,
            fault,
            max_packet: frame_size as usize - (DL_HEADER_SIZE + TL_HEADER_SIZE),
            host_frames: 0,
            tx_seq_nr: SEQ_NR_MAX,
            rx_seq_nr: SEQ_NR_MAX,
            replies: VecDeque::new(),
            unacked: None,
            incoming: Vec::new(),
            collecting: false,
            outgoing: VecDeque::new(),
            last_response: Vec::new(),
        }
    }

    pub fn responder(&self) -> &R {
        &self.responder
    }

    pub fn responder_mut(&mut self) -> &mut R {
        &mut self.responder
    }

    /// Number of frames the host has sent so far, lost ones included
    pub fn host_frames(&self) -> u32 {
        self.host_frames
    }

    fn reset_link(&mut self) {
        self.tx_seq_nr = SEQ_NR_MAX;
        self.rx_seq_nr = SEQ_NR_MAX;
        self.replies.clear();
        self.unacked = None;
        self.incoming.clear();
        self.collecting = false;
        self.outgoing.clear();
    }

    fn lost(&self) -> bool {
        match self.fault {
            LinkFault::DropEveryNth(period) if period > 0 => {
                self.host_frames % period as u32 == 0
            }
            _ => false,
        }
    }

    fn queue_control(&mut self, seqctr: SeqCtr) {
        let control = ControlByte {
            control_frame: true,
            seqctr,
            frame_nr: 0,
            ack_nr: self.rx_seq_nr,
        };
        self.replies
            .push_back(frame::encode_dl_frame(control.pack(), &[]));
    }

    /// Wraps the next response fragment into a data frame
    fn next_data_frame(&mut self) -> Option<Vec<u8>> {
        let payload = self.outgoing.pop_front()?;
        self.tx_seq_nr = (self.tx_seq_nr + 1) & SEQ_NR_MAX;
        let control = ControlByte {
            control_frame: false,
            seqctr: SeqCtr::Ack,
            frame_nr: self.tx_seq_nr,
            ack_nr: self.rx_seq_nr,
        };
        let data_frame = frame::encode_dl_frame(control.pack(), &payload);
        self.unacked = Some(data_frame.clone());
        Some(data_frame)
    }

    fn queue_response(&mut self, response: Vec<u8>) {
        self.outgoing = transport::fragments(&response, self.max_packet)
            .into_iter()
            .map(|(chaining, chunk)| {
                let mut packet = Vec::with_capacity(chunk.len() + TL_HEADER_SIZE);
                packet.push(chaining);
                packet.extend_from_slice(chunk);
                packet
            })
            .collect();
        self.last_response = response;
        if let Some(data_frame) = self.next_data_frame() {
            self.replies.push_back(data_frame);
        }
    }

    fn chaining_error(&mut self) {
        warn!("Simulated chip received an unexpected fragment");
        self.incoming.clear();
        self.collecting = false;
        self.outgoing = VecDeque::from(vec![vec![TL_CHAINING_ERROR]]);
        if let Some(data_frame) = self.next_data_frame() {
            self.replies.push_back(data_frame);
        }
    }

    fn handle_control_frame(&mut self, control: ControlByte) {
        match control.seqctr {
            SeqCtr::Resync => {
                debug!("Simulated chip resynchronised");
                self.reset_link();
            }
            SeqCtr::Nack => {
                if let Some(data_frame) = self.unacked.clone() {
                    self.replies.push_back(data_frame);
                }
            }
            SeqCtr::Ack if control.ack_nr == self.tx_seq_nr => self.unacked = None,
            _ => {}
        }
    }

    fn handle_data_frame(&mut self, control: ControlByte, payload: &[u8]) {
        if control.frame_nr != (self.rx_seq_nr + 1) & SEQ_NR_MAX {
            debug!(
                "Simulated chip got frame {} again, rx seq {}",
                control.frame_nr, self.rx_seq_nr
            );
            self.queue_control(SeqCtr::Ack);
            return;
        }
        self.rx_seq_nr = control.frame_nr;
        // a new frame from the host implies our previous frame arrived
        self.unacked = None;

        let pctr = match payload.first() {
            Some(pctr) => *pctr,
            None => return self.queue_control(SeqCtr::Nack),
        };
        let body = &payload[TL_HEADER_SIZE..];
        match pctr & TL_PCTR_CHAIN_MASK {
            TL_CHAINING_NO => {
                self.incoming = body.to_vec();
                self.collecting = false;
                self.process_packet();
            }
            TL_CHAINING_FIRST => {
                self.incoming = body.to_vec();
                self.collecting = true;
                self.queue_control(SeqCtr::Ack);
            }
            TL_CHAINING_INTERMEDIATE if self.collecting => {
                self.incoming.extend_from_slice(body);
                self.queue_control(SeqCtr::Ack);
            }
            TL_CHAINING_LAST if self.collecting => {
                self.incoming.extend_from_slice(body);
                self.collecting = false;
                self.process_packet();
            }
            TL_CHAINING_ERROR => {
                debug!("Host asked for the response again");
                let response = std::mem::replace(&mut self.last_response, Vec::new());
                self.queue_response(response);
            }
            _ => self.chaining_error(),
        }
    }

    fn process_packet(&mut self) {
        let packet = std::mem::replace(&mut self.incoming, Vec::new());
        trace!("Simulated chip << {}", frame::to_hex(&packet));
        let response = self.responder.respond(&packet);
        trace!("Simulated chip >> {}", frame::to_hex(&response));
        self.queue_response(response);
    }

    fn transfer(&self) -> Result<(), OptigaStatus> {
        if self.fault == LinkFault::AlwaysFail {
            self.timer.advance_ms(FAILED_TRANSFER_TIME_MS);
            Err(OptigaStatus::CommsError)
        } else {
            self.timer.advance_ms(TRANSFER_TIME_MS);
            Ok(())
        }
    }
}

impl<R: ApduResponder> PhysicalLayer for SimulatedLink<R> {
    fn init(&mut self) -> Result<(), OptigaStatus> {
        self.reset_link();
        Ok(())
    }

    fn send_frame(&mut self, data_frame: &[u8]) -> Result<(), OptigaStatus> {
        self.transfer()?;
        self.host_frames += 1;
        if self.lost() {
            debug!("Simulated link lost host frame {}", self.host_frames);
            return Ok(());
        }
        if data_frame.len() < DL_HEADER_SIZE {
            return Ok(());
        }
        let payload_len = frame::dl_payload_length(data_frame) as usize;
        if data_frame.len() != payload_len + DL_HEADER_SIZE
            || !frame::dl_crc_valid(data_frame)
        {
            warn!("Simulated chip got a corrupted frame");
            self.queue_control(SeqCtr::Nack);
            return Ok(());
        }
        let control = ControlByte::unpack(data_frame[0]);
        if control.control_frame {
            self.handle_control_frame(control);
        } else {
            let payload = data_frame[3..3 + payload_len].to_vec();
            self.handle_data_frame(control, &payload);
        }
        Ok(())
    }

    fn receive_frame(&mut self, buffer: &mut [u8]) -> Result<usize, OptigaStatus> {
        self.transfer()?;
        let data_frame = match self.replies.pop_front() {
            Some(data_frame) => data_frame,
            None => self.next_data_frame().ok_or(OptigaStatus::CommsError)?,
        };
        let len = data_frame.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data_frame[..len]);
        Ok(len)
    }
}

/// Builds the I2C stack in front of a freshly reset simulated chip
pub fn simulated_comms(
    cfg: &OptigaCommsCfg,
) -> Result<IfxI2cComms<SimulatedLink<SimulatedChip>>, String> {
    if (cfg.frame_size as usize) <= DL_HEADER_SIZE + TL_HEADER_SIZE
        || cfg.frame_size as usize > super::DL_MAX_FRAME_SIZE
    {
        return Err(format!("Unsupported frame size {:#x}", cfg.frame_size));
    }
    let timer = Arc::new(ManualTimer::default());
    let link = SimulatedLink::new(
        SimulatedChip::default(),
        cfg.frame_size,
        LinkFault::from(cfg.chip_type),
        timer.clone(),
    );
    let timer: Arc<dyn PalTimer> = timer;
    Ok(IfxI2cComms::new(link, timer, cfg.frame_size))
}
