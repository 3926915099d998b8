//! Register-level TIS model for tests.

use super::{Access, Registers, Status, ACCESS, DATA_FIFO, DID_VID, INTF_CAPABILITY, LOCALITY_STRIDE, RID, STS};
use std::collections::VecDeque;

type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

pub(crate) struct SimTis {
    pub did_vid: u32,
    pub intf_capability: u32,
    pub access: [u8; 5],
    /// Grant polite locality requests.
    pub honour_requests: bool,
    /// Never report any status bit.
    pub stuck: bool,
    /// Keep EXPECT raised no matter how much was written.
    pub expect_forever: bool,
    /// Extra bytes queued behind every response.
    pub trailing_garbage: usize,
    pub transcript: Vec<Vec<u8>>,
    hide_did_vid: bool,
    ready: bool,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    handler: Handler,
}

impl SimTis {
    pub fn new(did_vid: u32, handler: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
        Self {
            did_vid,
            intf_capability: 0,
            access: [Access::VALID.bits(); 5],
            honour_requests: true,
            stuck: false,
            expect_forever: false,
            trailing_garbage: 0,
            transcript: Vec::new(),
            hide_did_vid: false,
            ready: false,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            handler: Box::new(handler),
        }
    }

    /// Mimics parts that read DID/VID as all ones until locality 0 is used.
    pub fn hide_did_vid_until_touched(&mut self) {
        self.hide_did_vid = true;
        self.intf_capability = 5;
    }

    fn any_active_except(&self, locality: usize) -> bool {
        self.access
            .iter()
            .enumerate()
            .any(|(i, a)| i != locality && a & Access::ACTIVE_LOCALITY.bits() != 0)
    }

    fn expecting(&self) -> bool {
        if self.expect_forever {
            return true;
        }
        match super::declared_size(&self.inbox) {
            Some(size) => self.inbox.len() < size,
            None => true,
        }
    }

    fn status(&self) -> u8 {
        if self.stuck {
            return 0;
        }
        let mut status = Status::VALID;
        if self.ready {
            status |= Status::COMMAND_READY;
            if self.expecting() {
                status |= Status::EXPECT;
            }
        }
        if !self.outbox.is_empty() {
            status |= Status::DATA_AVAIL;
        }
        status.bits()
    }

    fn write_access(&mut self, locality: usize, value: u8) {
        let value = Access::from_bits_retain(value);
        let active = Access::ACTIVE_LOCALITY.bits();
        if value.contains(Access::ACTIVE_LOCALITY) {
            self.access[locality] &= !active;
        }
        if value.contains(Access::REQUEST_USE) {
            if self.honour_requests && !self.any_active_except(locality) {
                self.access[locality] |= active;
                self.access[locality] &= !Access::PENDING_REQUEST.bits();
                if locality == 0 {
                    self.hide_did_vid = false;
                }
            } else {
                self.access[locality] |= Access::PENDING_REQUEST.bits();
            }
        }
        if value.contains(Access::SEIZE) {
            for (i, access) in self.access.iter_mut().enumerate() {
                if i != locality && *access & active != 0 {
                    *access &= !active;
                    *access |= Access::BEEN_SEIZED.bits();
                }
            }
            self.access[locality] |= active;
        }
    }

    fn write_status(&mut self, value: u8) {
        let value = Status::from_bits_retain(value);
        if value.contains(Status::COMMAND_READY) {
            self.ready = true;
            self.inbox.clear();
            self.outbox.clear();
        }
        if value.contains(Status::GO) && self.ready {
            let request = std::mem::take(&mut self.inbox);
            let response = (self.handler)(&request);
            self.transcript.push(request);
            self.outbox.extend(response);
            self.outbox
                .extend(std::iter::repeat(0xee).take(self.trailing_garbage));
            self.ready = false;
        }
    }
}

impl Registers for SimTis {
    fn read8(&mut self, offset: usize) -> u8 {
        let (locality, reg) = (offset / LOCALITY_STRIDE, offset % LOCALITY_STRIDE);
        match reg {
            ACCESS => self.access[locality],
            STS => self.status(),
            DATA_FIFO => self.outbox.pop_front().unwrap_or(0xff),
            RID => 0x01,
            _ => 0,
        }
    }

    fn write8(&mut self, offset: usize, value: u8) {
        let (locality, reg) = (offset / LOCALITY_STRIDE, offset % LOCALITY_STRIDE);
        match reg {
            ACCESS => self.write_access(locality, value),
            STS if !self.stuck => self.write_status(value),
            DATA_FIFO if self.ready => self.inbox.push(value),
            _ => {}
        }
    }

    fn read32(&mut self, offset: usize) -> u32 {
        match offset {
            DID_VID if self.hide_did_vid => u32::MAX,
            DID_VID => self.did_vid,
            INTF_CAPABILITY => self.intf_capability,
            _ => 0,
        }
    }
}
