//! I2C data link layer: sequence numbered frames, CRC16, ACK/NACK, resend and resync.
//!
//! Physical layer calls complete synchronously; their outcome is queued as an
//! event and the state machine advances until it reports upwards.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, trace, warn};

use super::super::frame::{self, ControlByte, SeqCtr};
use super::super::{
    OptigaStatus, PalTimer, PhysicalLayer, DL_HEADER_SIZE, DL_MAX_FRAME_SIZE, DL_TRANS_REPEAT,
    TL_MAX_EXIT_TIMEOUT_MS,
};

/// A frame was delivered to the peer
pub const DL_EVENT_TX_SUCCESS: u8 = 0x01;
/// A data frame was received from the peer
pub const DL_EVENT_RX_SUCCESS: u8 = 0x02;
/// The link failed, resend and resync were exhausted
pub const DL_EVENT_ERROR: u8 = 0x04;

const SEQ_NR_MAX: u8 = 0x03;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DlState {
    Uninit,
    Idle,
    Tx,
    Rx,
    RxDataFrame,
    RxControlFrame,
    Ack,
    Nack,
    Resend,
    Discard,
    Error,
}

/// Report of the data link to the transport layer
#[derive(Clone, Debug, PartialEq)]
pub struct DlEvent {
    pub flags: u8,
    /// Payload of the received data frame, empty without `DL_EVENT_RX_SUCCESS`
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum PlEvent {
    Success,
    Error,
    Fatal,
}

pub struct DataLink<P: PhysicalLayer> {
    pl: P,
    timer: Arc<dyn PalTimer>,
    state: DlState,
    tx_seq_nr: u8,
    rx_seq_nr: u8,
    resynced: bool,
    error: bool,
    retransmit_counter: u8,
    rx_only: bool,
    api_start_ms: u32,
    tx_payload: Vec<u8>,
    rx_frame: Vec<u8>,
    rx_len: usize,
    rx_data: Vec<u8>,
    pending: VecDeque<PlEvent>,
    upward: Option<DlEvent>,
}

impl<P: PhysicalLayer> DataLink<P> {
    pub fn new(pl: P, timer: Arc<dyn PalTimer>) -> DataLink<P> {
        DataLink {
            pl,
            timer,
            state: DlState::Uninit,
            tx_seq_nr: SEQ_NR_MAX,
            rx_seq_nr: SEQ_NR_MAX,
            resynced: false,
            error: false,
            retransmit_counter: 0,
            rx_only: false,
            api_start_ms: 0,
            tx_payload: Vec::new(),
            rx_frame: vec![0u8; DL_MAX_FRAME_SIZE],
            rx_len: 0,
            rx_data: Vec::new(),
            pending: VecDeque::new(),
            upward: None,
        }
    }

    /// Resets the sequence numbers and initialises the physical layer
    pub fn init(&mut self) -> Result<(), OptigaStatus> {
        self.tx_seq_nr = SEQ_NR_MAX;
        self.rx_seq_nr = SEQ_NR_MAX;
        self.resynced = false;
        self.error = false;
        self.pending.clear();
        self.upward = None;
        self.state = DlState::Uninit;
        self.pl.init()?;
        self.state = DlState::Idle;
        Ok(())
    }

    pub fn state(&self) -> DlState {
        self.state
    }

    pub fn tx_seq_nr(&self) -> u8 {
        self.tx_seq_nr
    }

    pub fn rx_seq_nr(&self) -> u8 {
        self.rx_seq_nr
    }

    pub fn physical_layer(&self) -> &P {
        &self.pl
    }

    pub fn physical_layer_mut(&mut self) -> &mut P {
        &mut self.pl
    }

    /// Sends one data frame and runs the link until the exchange is reported
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<DlEvent, OptigaStatus> {
        if self.state != DlState::Idle {
            return Err(OptigaStatus::CommsError);
        }
        if payload.is_empty() || payload.len() > DL_MAX_FRAME_SIZE - DL_HEADER_SIZE {
            return Err(OptigaStatus::CommsInvalidInput);
        }
        self.tx_payload.clear();
        self.tx_payload.extend_from_slice(payload);
        self.state = DlState::Tx;
        self.retransmit_counter = 0;
        self.rx_only = false;
        self.api_start_ms = self.timer.now_ms();
        self.send_frame_internal(self.tx_payload.len(), SeqCtr::Ack, false);
        self.run()
    }

    /// Waits for a data frame from the peer
    pub fn receive_frame(&mut self) -> Result<DlEvent, OptigaStatus> {
        if self.state != DlState::Idle {
            return Err(OptigaStatus::CommsError);
        }
        self.state = DlState::Rx;
        self.rx_only = true;
        self.retransmit_counter = 0;
        self.api_start_ms = self.timer.now_ms();
        self.pl_receive();
        self.run()
    }

    fn run(&mut self) -> Result<DlEvent, OptigaStatus> {
        while let Some(event) = self.pending.pop_front() {
            self.pl_event_handler(event);
            if let Some(report) = self.upward.take() {
                self.pending.clear();
                return Ok(report);
            }
        }
        error!("Data link stalled in state {:?}", self.state);
        self.state = DlState::Idle;
        Err(OptigaStatus::CommsError)
    }

    fn pl_send(&mut self, frame: &[u8]) {
        trace!("DL >> {}", frame::to_hex(frame));
        let event = match self.pl.send_frame(frame) {
            Ok(()) => PlEvent::Success,
            Err(OptigaStatus::CommsFatal) => PlEvent::Fatal,
            Err(_) => PlEvent::Error,
        };
        self.pending.push_back(event);
    }

    fn pl_receive(&mut self) {
        let event = match self.pl.receive_frame(&mut self.rx_frame) {
            Ok(len) => {
                self.rx_len = len.min(self.rx_frame.len());
                trace!("DL << {}", frame::to_hex(&self.rx_frame[..self.rx_len]));
                PlEvent::Success
            }
            Err(OptigaStatus::CommsFatal) => PlEvent::Fatal,
            Err(_) => PlEvent::Error,
        };
        self.pending.push_back(event);
    }

    fn report(&mut self, flags: u8) {
        let data = if flags & DL_EVENT_RX_SUCCESS != 0 {
            std::mem::replace(&mut self.rx_data, Vec::new())
        } else {
            Vec::new()
        };
        self.upward = Some(DlEvent { flags, data });
    }

    /// Builds and transmits a frame; `frame_len` 0 sends a control frame
    fn send_frame_internal(&mut self, frame_len: usize, seqctr: SeqCtr, resend: bool) {
        let ack_nr = match seqctr {
            SeqCtr::Nack => (self.rx_seq_nr + 1) & SEQ_NR_MAX,
            SeqCtr::Resync => 0,
            _ => self.rx_seq_nr,
        };
        let control = if frame_len > 0 {
            if !resend || self.resynced {
                self.tx_seq_nr = (self.tx_seq_nr + 1) & SEQ_NR_MAX;
            }
            self.resynced = false;
            ControlByte {
                control_frame: false,
                seqctr,
                frame_nr: self.tx_seq_nr,
                ack_nr,
            }
        } else {
            ControlByte {
                control_frame: true,
                seqctr,
                frame_nr: 0,
                ack_nr,
            }
        };
        let payload = if frame_len > 0 {
            self.tx_payload[..frame_len].to_vec()
        } else {
            Vec::new()
        };
        let frame = frame::encode_dl_frame(control.pack(), &payload);
        self.pl_send(&frame);
    }

    fn resync(&mut self) {
        warn!("Data link resynchronisation");
        self.tx_seq_nr = SEQ_NR_MAX;
        self.rx_seq_nr = SEQ_NR_MAX;
        self.resynced = true;
        self.state = DlState::Resend;
        self.send_frame_internal(0, SeqCtr::Resync, false);
    }

    fn resend_frame(&mut self) -> bool {
        let elapsed = self.timer.now_ms().wrapping_sub(self.api_start_ms);
        if elapsed < TL_MAX_EXIT_TIMEOUT_MS {
            if self.retransmit_counter == DL_TRANS_REPEAT {
                self.retransmit_counter = 0;
                self.resync();
            } else {
                self.retransmit_counter += 1;
                warn!("Data link resend {}", self.retransmit_counter);
                self.state = DlState::Tx;
                self.send_frame_internal(self.tx_payload.len(), SeqCtr::Ack, true);
            }
            false
        } else {
            self.state = DlState::Error;
            true
        }
    }

    fn pl_event_handler(&mut self, event: PlEvent) {
        let mut continue_state_machine = true;
        while continue_state_machine {
            continue_state_machine = false;
            if event == PlEvent::Fatal && self.state != DlState::Idle {
                error!("Fatal physical layer event in state {:?}", self.state);
                self.state = DlState::Error;
            }
            debug!("DL state {:?} event {:?}", self.state, event);
            match self.state {
                DlState::Uninit => {}
                DlState::Idle => {
                    if event == PlEvent::Success {
                        self.report(DL_EVENT_TX_SUCCESS);
                    } else {
                        self.report(DL_EVENT_ERROR);
                    }
                }
                DlState::Tx => {
                    if event != PlEvent::Success {
                        self.state = DlState::Resend;
                        continue_state_machine = true;
                    } else {
                        self.state = DlState::Rx;
                        self.pl_receive();
                    }
                }
                DlState::Rx => {
                    if event != PlEvent::Success {
                        self.state = DlState::Resend;
                        continue_state_machine = true;
                    } else if self.rx_len < DL_HEADER_SIZE {
                        warn!("Data link frame too short ({} bytes)", self.rx_len);
                        self.state = DlState::Nack;
                        continue_state_machine = true;
                    } else if self.rx_frame[0] & frame::FRAME_TYPE_CONTROL != 0 {
                        self.state = DlState::RxControlFrame;
                        continue_state_machine = true;
                    } else {
                        self.state = DlState::RxDataFrame;
                        continue_state_machine = true;
                    }
                }
                DlState::RxDataFrame => {
                    continue_state_machine = self.handle_data_frame();
                }
                DlState::RxControlFrame => {
                    continue_state_machine = self.handle_control_frame();
                }
                DlState::Discard => {
                    self.state = DlState::Rx;
                    self.pl_receive();
                }
                DlState::Ack => {
                    if event != PlEvent::Success {
                        self.state = DlState::Resend;
                        continue_state_machine = true;
                    } else {
                        self.state = DlState::Idle;
                        if self.rx_only {
                            self.report(DL_EVENT_RX_SUCCESS);
                        } else {
                            self.report(DL_EVENT_TX_SUCCESS | DL_EVENT_RX_SUCCESS);
                        }
                    }
                }
                DlState::Nack => {
                    warn!("Data link NACK, rx seq {}", self.rx_seq_nr);
                    self.state = DlState::Tx;
                    self.send_frame_internal(0, SeqCtr::Nack, false);
                }
                DlState::Resend => {
                    continue_state_machine = self.resend_frame();
                }
                DlState::Error => {
                    if !self.resynced {
                        self.error = true;
                    }
                    if !self.error {
                        error!("Data link failed after resynchronisation");
                        self.state = DlState::Idle;
                        self.report(DL_EVENT_ERROR);
                    } else {
                        self.resync();
                        self.state = DlState::Error;
                        self.error = false;
                    }
                }
            }
        }
    }

    fn received_fields(&self) -> (ControlByte, usize, bool) {
        let ctrl = ControlByte::unpack(self.rx_frame[0]);
        let payload_len = frame::dl_payload_length(&self.rx_frame[..self.rx_len]) as usize;
        let crc_ok = frame::dl_crc_valid(&self.rx_frame[..self.rx_len]);
        (ctrl, payload_len, crc_ok)
    }

    fn handle_data_frame(&mut self) -> bool {
        let (ctrl, payload_len, crc_ok) = self.received_fields();
        if !crc_ok
            || payload_len == 0
            || self.rx_len != payload_len + DL_HEADER_SIZE
            || ctrl.seqctr == SeqCtr::Rfu
            || ctrl.seqctr == SeqCtr::Resync
        {
            self.state = DlState::Nack;
            return true;
        }
        if ctrl.frame_nr != (self.rx_seq_nr + 1) & SEQ_NR_MAX {
            warn!(
                "Data link discards frame {} (expected {})",
                ctrl.frame_nr,
                (self.rx_seq_nr + 1) & SEQ_NR_MAX
            );
            self.state = DlState::Discard;
            self.send_frame_internal(0, SeqCtr::Ack, false);
            return false;
        }
        if ctrl.ack_nr != self.tx_seq_nr {
            warn!("Data link discards frame acking {}", ctrl.ack_nr);
            self.state = DlState::Discard;
            return true;
        }
        if ctrl.seqctr == SeqCtr::Nack {
            self.state = DlState::Resend;
            return true;
        }
        self.rx_seq_nr = (self.rx_seq_nr + 1) & SEQ_NR_MAX;
        self.rx_data = self.rx_frame[3..3 + payload_len].to_vec();
        self.retransmit_counter = 0;
        self.state = DlState::Ack;
        self.send_frame_internal(0, SeqCtr::Ack, false);
        false
    }

    fn handle_control_frame(&mut self) -> bool {
        let (ctrl, payload_len, crc_ok) = self.received_fields();
        if self.rx_only != (ctrl.seqctr == SeqCtr::Resync) {
            self.state = DlState::Discard;
            return true;
        }
        if !crc_ok {
            self.state = DlState::Resend;
            return true;
        }
        if self.rx_len > DL_HEADER_SIZE || payload_len != 0 {
            self.state = DlState::Discard;
            return true;
        }
        if ctrl.seqctr == SeqCtr::Resync {
            warn!("Data link resynchronised by the peer");
            self.state = DlState::Discard;
            self.resynced = true;
            self.tx_seq_nr = SEQ_NR_MAX;
            self.rx_seq_nr = SEQ_NR_MAX;
            return true;
        }
        if ctrl.frame_nr != 0 || ctrl.seqctr == SeqCtr::Rfu || ctrl.ack_nr != self.tx_seq_nr {
            self.state = DlState::Discard;
            return true;
        }
        if ctrl.seqctr == SeqCtr::Nack {
            self.state = DlState::Resend;
            return true;
        }
        self.state = DlState::Idle;
        self.report(DL_EVENT_TX_SUCCESS);
        false
    }
}
