//! Execution queue arbitrating the chip between command instances.
//!
//! Every instance owns the slot with its own index. A slot requests the chip
//! with a lock type; the scheduler grants the earliest satisfiable request,
//! giving priority to an instance resuming a strict lock it already holds.

use log::{debug, trace};

use super::super::{
    OPTIGA_CMD_MAX_REGISTRATIONS, OPTIGA_CMD_MAX_SESSIONS, OPTIGA_CMD_SESSION_BASE_OID,
};

/// Arrival time of a slot without a request
pub const ARRIVAL_TIME_NONE: u32 = 0xFFFF_FFFF;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SlotState {
    NotAssigned,
    /// Owned by an instance, nothing requested
    Assigned,
    Request,
    /// Re-request of a strict lock the slot already holds
    Resume,
    Processing,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RequestType {
    None,
    Lock,
    Session,
    StrictLock,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct QueueSlot {
    pub arrival_time: u32,
    pub request_type: RequestType,
    pub state: SlotState,
}

impl Default for QueueSlot {
    fn default() -> QueueSlot {
        QueueSlot {
            arrival_time: ARRIVAL_TIME_NONE,
            request_type: RequestType::None,
            state: SlotState::NotAssigned,
        }
    }
}

/// Outcome of one scheduler run
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Schedule {
    /// Nothing requested, or a strict lock holder blocks the others
    Idle,
    /// Requests exist but none can be granted now
    NoneSelectable,
    /// The slot was granted the chip; `session` is a freshly leased session OID
    Granted { slot: usize, session: Option<u16> },
}

#[derive(Debug)]
pub struct ExecutionQueue {
    slots: [QueueSlot; OPTIGA_CMD_MAX_REGISTRATIONS],
    last_time_stamp: u32,
    sessions: [bool; OPTIGA_CMD_MAX_SESSIONS],
}

impl Default for ExecutionQueue {
    fn default() -> ExecutionQueue {
        ExecutionQueue {
            slots: [QueueSlot::default(); OPTIGA_CMD_MAX_REGISTRATIONS],
            last_time_stamp: 0,
            sessions: [false; OPTIGA_CMD_MAX_SESSIONS],
        }
    }
}

impl ExecutionQueue {
    pub fn slot(&self, index: usize) -> &QueueSlot {
        &self.slots[index]
    }

    pub fn last_time_stamp(&self) -> u32 {
        self.last_time_stamp
    }

    /// Takes the first free slot for a new instance
    pub fn assign_slot(&mut self) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::NotAssigned)?;
        self.slots[index] = QueueSlot {
            state: SlotState::Assigned,
            ..QueueSlot::default()
        };
        debug!("Queue slot {} assigned", index);
        Some(index)
    }

    pub fn deassign_slot(&mut self, index: usize) {
        self.slots[index] = QueueSlot::default();
        debug!("Queue slot {} released", index);
    }

    pub fn count_state(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    pub fn count_request(&self, request_type: RequestType) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.request_type == request_type)
            .count()
    }

    /// Files a request. Re-requesting a held strict lock keeps the arrival time and resumes.
    pub fn update_slot(&mut self, index: usize, request_type: RequestType, now_us: u32) {
        let slot = &mut self.slots[index];
        let strict_again = slot.request_type == RequestType::StrictLock
            && request_type == RequestType::StrictLock;
        if !strict_again {
            slot.arrival_time = now_us;
        }
        slot.state = if strict_again {
            SlotState::Resume
        } else {
            SlotState::Request
        };
        slot.request_type = request_type;
        trace!("Queue slot {} -> {:?}", index, slot);
    }

    /// Gives the chip back; the slot stays with its instance
    pub fn reset_slot(&mut self, index: usize) {
        self.slots[index] = QueueSlot {
            state: SlotState::Assigned,
            ..QueueSlot::default()
        };
    }

    /// Drops a held strict lock without touching the arrival time
    pub fn release_strict_lock(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Assigned;
        slot.request_type = RequestType::None;
    }

    pub fn session_available(&self) -> bool {
        self.sessions.iter().any(|used| !used)
    }

    /// Leases the lowest free session OID
    pub fn assign_session(&mut self) -> Option<u16> {
        let index = self.sessions.iter().position(|used| !used)?;
        self.sessions[index] = true;
        Some(OPTIGA_CMD_SESSION_BASE_OID + index as u16)
    }

    pub fn free_session(&mut self, session_oid: u16) {
        let index = session_oid.wrapping_sub(OPTIGA_CMD_SESSION_BASE_OID) as usize;
        if index < OPTIGA_CMD_MAX_SESSIONS {
            self.sessions[index] = false;
        }
    }

    pub fn sessions_in_use(&self) -> usize {
        self.sessions.iter().filter(|used| **used).count()
    }

    /// Whether the scheduler has nothing it may grant now
    pub fn idle(&self) -> bool {
        let nothing_requested =
            self.count_state(SlotState::Request) == 0 && self.count_state(SlotState::Resume) == 0;
        let strict_lock_held = self.count_state(SlotState::Processing) == 1
            && self.count_request(RequestType::StrictLock) > 0;
        nothing_requested || strict_lock_held
    }

    /// Selects the next slot to run. `held_sessions[i]` tells whether the
    /// instance of slot `i` already owns a session.
    pub fn schedule(&mut self, held_sessions: &[bool; OPTIGA_CMD_MAX_REGISTRATIONS]) -> Schedule {
        if self.idle() {
            return Schedule::Idle;
        }

        let mut preferred = None;
        let mut reference = ARRIVAL_TIME_NONE;
        let mut overflow = false;
        let resuming = self.count_state(SlotState::Resume) == 1;
        loop {
            if overflow {
                self.last_time_stamp = 0;
                overflow = false;
            }
            for (index, slot) in self.slots.iter().enumerate() {
                if resuming {
                    if slot.state == SlotState::Resume
                        && slot.request_type == RequestType::StrictLock
                    {
                        reference = slot.arrival_time;
                        preferred = Some(index);
                    }
                    continue;
                }
                if slot.state != SlotState::Request {
                    continue;
                }
                if slot.arrival_time < self.last_time_stamp {
                    overflow = true;
                }
                let satisfiable = match slot.request_type {
                    RequestType::Session => self.session_available() || held_sessions[index],
                    RequestType::Lock | RequestType::StrictLock => true,
                    RequestType::None => false,
                };
                if satisfiable
                    && slot.arrival_time <= reference
                    && slot.arrival_time >= self.last_time_stamp
                {
                    reference = slot.arrival_time;
                    preferred = Some(index);
                }
            }
            if preferred.is_some() || !overflow {
                break;
            }
            debug!("Arrival time wrapped, rescanning the queue");
        }

        let slot = match preferred {
            Some(slot) => slot,
            None => return Schedule::NoneSelectable,
        };
        let session = if self.slots[slot].request_type == RequestType::Session && !held_sessions[slot]
        {
            self.assign_session()
        } else {
            None
        };
        self.slots[slot].state = SlotState::Processing;
        self.last_time_stamp = reference;
        debug!("Queue slot {} granted, session {:?}", slot, session);
        Schedule::Granted { slot, session }
    }
}
