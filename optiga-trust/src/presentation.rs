//! Presentation layer boundary of the shielded connection.
//!
//! The AES-CCM record protection and the TLS-PRF key derivation of the
//! shielded connection live behind [`ShieldedSession`]. The I2C stack asks it
//! to wrap each outgoing APDU and to unwrap each response; handshake and
//! session failures are handed to the command layer unchanged.

use super::{CommsOptions, OptigaStatus, OPTIGA_PROTECTION_LEVEL_MASK};

pub trait ShieldedSession {
    /// Runs the handshake or restores a saved session, depending on the options
    fn open(&mut self, options: &CommsOptions) -> Result<(), OptigaStatus>;
    /// Tears the session down, saving its context when requested
    fn close(&mut self, options: &CommsOptions) -> Result<(), OptigaStatus>;
    /// True when packets of this exchange carry a presentation layer header
    fn presence(&self, options: &CommsOptions) -> bool;
    /// Protects a command APDU; the result is what the transport layer sends
    fn wrap(&mut self, apdu: &[u8], options: &CommsOptions) -> Result<Vec<u8>, OptigaStatus>;
    /// Recovers the response APDU from a received packet
    fn unwrap(&mut self, packet: &[u8], options: &CommsOptions) -> Result<Vec<u8>, OptigaStatus>;
}

/// Passes APDUs through untouched; the protection level is ignored
#[derive(Default)]
pub struct Unprotected;

impl ShieldedSession for Unprotected {
    fn open(&mut self, _options: &CommsOptions) -> Result<(), OptigaStatus> {
        Ok(())
    }
    fn close(&mut self, _options: &CommsOptions) -> Result<(), OptigaStatus> {
        Ok(())
    }
    fn presence(&self, _options: &CommsOptions) -> bool {
        false
    }
    fn wrap(&mut self, apdu: &[u8], _options: &CommsOptions) -> Result<Vec<u8>, OptigaStatus> {
        Ok(apdu.to_vec())
    }
    fn unwrap(&mut self, packet: &[u8], _options: &CommsOptions) -> Result<Vec<u8>, OptigaStatus> {
        Ok(packet.to_vec())
    }
}

/// True when the options ask for any protection of the exchange
pub fn protection_requested(options: &CommsOptions) -> bool {
    options.protection_level & OPTIGA_PROTECTION_LEVEL_MASK != 0
}
