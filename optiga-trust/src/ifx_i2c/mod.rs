//! IFX I2C protocol stack: transport and data link over a physical layer, with the
//! shielded connection in front.

pub mod data_link;
pub mod transport;

use log::{debug, warn};
use std::sync::Arc;

use self::transport::Transport;
use super::presentation::{ShieldedSession, Unprotected};
use super::{CommsOptions, OptigaComms, OptigaStatus, PalTimer, PhysicalLayer};

/// Presentation header, sequence number and MAC added to a protected packet
pub const PRL_OVERHEAD: usize = 1 + 4 + 8;

pub struct IfxI2cComms<P: PhysicalLayer> {
    transport: Transport<P>,
    session: Box<dyn ShieldedSession>,
    opened: bool,
}

impl<P: PhysicalLayer> IfxI2cComms<P> {
    pub fn new(pl: P, timer: Arc<dyn PalTimer>, frame_size: u16) -> IfxI2cComms<P> {
        IfxI2cComms {
            transport: Transport::new(pl, timer, frame_size),
            session: Box::new(Unprotected),
            opened: false,
        }
    }

    /// Replaces the presentation layer collaborator
    pub fn with_session(mut self, session: Box<dyn ShieldedSession>) -> IfxI2cComms<P> {
        self.session = session;
        self
    }

    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport<P> {
        &mut self.transport
    }
}

impl<P: PhysicalLayer> OptigaComms for IfxI2cComms<P> {
    fn open(&mut self, options: &CommsOptions) -> Result<(), OptigaStatus> {
        if !self.opened {
            self.transport.init()?;
            self.opened = true;
        }
        debug!("Opening I2C channel, context {:?}", options.manage_context);
        self.session.open(options)
    }

    fn close(&mut self, options: &CommsOptions) -> Result<(), OptigaStatus> {
        debug!("Closing I2C channel, context {:?}", options.manage_context);
        self.session.close(options)
    }

    fn transceive(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        options: &CommsOptions,
    ) -> Result<usize, OptigaStatus> {
        if !self.opened {
            warn!("Transceive on an I2C channel that is not open");
            return Err(OptigaStatus::CommsError);
        }
        let presence = self.session.presence(options);
        let packet = self.session.wrap(tx, options)?;
        let capacity = if presence {
            rx.len() + PRL_OVERHEAD
        } else {
            rx.len()
        };
        let response = self.transport.transceive(&packet, presence, capacity)?;
        let apdu = self.session.unwrap(&response, options)?;
        if apdu.len() > rx.len() {
            return Err(OptigaStatus::CommsMemoryInsufficient);
        }
        rx[..apdu.len()].copy_from_slice(&apdu);
        Ok(apdu.len())
    }
}
