//! TPM Interface Specification (TIS) driver.
//!
//! Talks to a TPM 1.2 through the memory-mapped locality windows starting at
//! [`TIS_BASE`]. Every wait is a bounded poll; running out of budget is an
//! error, never a silent fall-through.

use ambassador::delegatable_trait;
use bitflags::bitflags;
use std::fmt;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

pub const TIS_BASE: u64 = 0xFED4_0000;
pub const LOCALITY_STRIDE: usize = 0x1000;
pub const WINDOW_SIZE: usize = 5 * LOCALITY_STRIDE;

/// Size of the tag/size/ordinal header shared by commands and responses.
pub const HEADER_SIZE: usize = 10;
pub const MAX_RESPONSE_SIZE: usize = 4096;

const ACCESS: usize = 0x00;
const INTF_CAPABILITY: usize = 0x14;
const STS: usize = 0x18;
const DATA_FIFO: usize = 0x24;
const DID_VID: usize = 0xF00;
const RID: usize = 0xF04;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const ESTABLISHMENT = 1 << 0;
        const REQUEST_USE = 1 << 1;
        const PENDING_REQUEST = 1 << 2;
        const SEIZE = 1 << 3;
        const BEEN_SEIZED = 1 << 4;
        const ACTIVE_LOCALITY = 1 << 5;
        const VALID = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const RESPONSE_RETRY = 1 << 1;
        const EXPECT = 1 << 3;
        const DATA_AVAIL = 1 << 4;
        const GO = 1 << 5;
        const COMMAND_READY = 1 << 6;
        const VALID = 1 << 7;
    }
}

#[derive(Error, Debug)]
pub enum TisError {
    #[error("no TPM present (DID/VID {0:#010x})")]
    NoTpm(u32),
    #[error("unrecognised TPM, DID/VID {0:#010x}")]
    UnknownVendor(u32),
    #[error("invalid locality `{0}`, expected 0 to 4")]
    InvalidLocality(u8),
    #[error("locality 0 can not be seized")]
    SeizeLocalityZero,
    #[error("access register of locality {0} is not valid")]
    AccessNotValid(Locality),
    #[error("access register of locality {0} reads all ones")]
    AccessInvalid(Locality),
    #[error("locality {0} is already active")]
    LocalityAlreadyActive(Locality),
    #[error("could not gain access to locality {0}")]
    LocalityUnavailable(Locality),
    #[error("locality {0} is still active after deactivation")]
    DeactivateFailed(Locality),
    #[error("timed out on locality {locality} waiting for status {waiting_for:?}")]
    Timeout {
        locality: Locality,
        waiting_for: Status,
    },
    #[error("request header declares {declared} bytes but {actual} were supplied")]
    MalformedRequest { declared: usize, actual: usize },
    #[error("TPM still expects data after {0} bytes were written")]
    ExpectsMoreData(usize),
    #[error("short response, expected {expected} bytes but received {received}")]
    ShortResponse { expected: usize, received: usize },
    #[error("response size {0} is out of range")]
    MalformedResponse(usize),
    #[error("TPM still has data available after {0} response bytes")]
    ResponseOverrun(usize),
    #[error("failed to map TIS registers")]
    Map(#[from] std::io::Error),
}

pub type Result<T, E = TisError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Locality {
    Zero,
    One,
    Two,
    Three,
    Four,
}

impl Locality {
    pub const ALL: [Locality; 5] = [
        Locality::Zero,
        Locality::One,
        Locality::Two,
        Locality::Three,
        Locality::Four,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Bit for this locality in a TPM_LOCALITY_SELECTION.
    pub fn selection_bit(self) -> u8 {
        1 << self.index()
    }

    fn window(self) -> usize {
        self.index() as usize * LOCALITY_STRIDE
    }
}

impl TryFrom<u8> for Locality {
    type Error = TisError;

    fn try_from(value: u8) -> Result<Self> {
        Locality::ALL
            .get(value as usize)
            .copied()
            .ok_or(TisError::InvalidLocality(value))
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Stm,
    Infineon,
    Atmel,
    Broadcom,
    Qemu,
    Ibm,
}

impl Vendor {
    fn from_did_vid(did_vid: u32) -> Option<Self> {
        match did_vid {
            0x2e4d_5453 | 0x4a10_0000 => Some(Vendor::Stm),
            0x000b_15d1 => Some(Vendor::Infineon),
            0x3202_1114 | 0x3203_1114 => Some(Vendor::Atmel),
            0x1002_14e4 => Some(Vendor::Broadcom),
            0x0001_0001 => Some(Vendor::Qemu),
            0x0001_1014 => Some(Vendor::Ibm),
            _ => None,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Vendor::Stm => "STM",
            Vendor::Infineon => "Infineon",
            Vendor::Atmel => "Atmel",
            Vendor::Broadcom => "Broadcom",
            Vendor::Qemu => "QEMU",
            Vendor::Ibm => "IBM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub vendor: Vendor,
    pub did_vid: u32,
    pub revision: u8,
}

/// Fixed number of polls with a fixed sleep between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub iterations: u32,
    pub delay: Duration,
}

impl PollBudget {
    pub const fn new(iterations: u32, delay: Duration) -> Self {
        Self { iterations, delay }
    }

    /// Polls `done` until it holds or the budget runs out.
    fn poll<F: FnMut() -> bool>(&self, mut done: F) -> bool {
        for _ in 0..self.iterations {
            if done() {
                return true;
            }
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }
        done()
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::new(4000, Duration::from_millis(1))
    }
}

/// Byte-addressed view of the TIS register window.
///
/// Offsets are relative to [`TIS_BASE`], so locality `n` lives at
/// `n * LOCALITY_STRIDE`.
#[delegatable_trait]
pub trait Registers {
    fn read8(&mut self, offset: usize) -> u8;
    fn write8(&mut self, offset: usize, value: u8);
    fn read32(&mut self, offset: usize) -> u32;
}

impl<R: Registers + ?Sized> Registers for &mut R {
    fn read8(&mut self, offset: usize) -> u8 {
        (**self).read8(offset)
    }
    fn write8(&mut self, offset: usize, value: u8) {
        (**self).write8(offset, value)
    }
    fn read32(&mut self, offset: usize) -> u32 {
        (**self).read32(offset)
    }
}

/// A command/response byte-stream exchange with a TPM.
#[delegatable_trait]
pub trait Transport {
    fn transmit(
        &mut self,
        request: &[u8],
    ) -> core::result::Result<::zeroize::Zeroizing<Vec<u8>>, crate::tis::TisError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transmit(&mut self, request: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        (**self).transmit(request)
    }
}

pub struct Tis<R: Registers> {
    regs: R,
    poll: PollBudget,
    access_poll: PollBudget,
    identity: Identity,
}

impl<R: Registers> Tis<R> {
    /// Probes locality 0 and classifies the attached TPM.
    pub fn init(mut regs: R, poll: PollBudget, access_poll: PollBudget) -> Result<Self> {
        let mut did_vid = regs.read32(DID_VID);

        // Some Atmel parts report all ones until locality 0 has been touched
        if did_vid == u32::MAX
            && (regs.read32(INTF_CAPABILITY) & !0x1fa) == 5
            && (regs.read8(ACCESS) & 0xe8) == 0x80
        {
            log::info!("Working around stuck DID/VID register");
            regs.write8(ACCESS, Access::REQUEST_USE.bits());
            access_poll.poll(|| {
                Access::from_bits_retain(regs.read8(ACCESS)).contains(Access::ACTIVE_LOCALITY)
            });
            did_vid = regs.read32(DID_VID);
            regs.write8(ACCESS, Access::ACTIVE_LOCALITY.bits());
        }

        let vendor = match did_vid {
            0 | u32::MAX => return Err(TisError::NoTpm(did_vid)),
            id => Vendor::from_did_vid(id).ok_or(TisError::UnknownVendor(id))?,
        };
        let identity = Identity {
            vendor,
            did_vid,
            revision: regs.read8(RID),
        };
        log::info!("{} TPM, revision {:#04x}", vendor, identity.revision);

        Ok(Self {
            regs,
            poll,
            access_poll,
            identity,
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Claims `locality`, seizing it when `force` is set and a polite request
    /// is not honoured in time. Any half finished command is aborted before
    /// the locality is handed out.
    pub fn access(&mut self, locality: Locality, force: bool) -> Result<ActiveLocality<'_, R>> {
        if force && locality == Locality::Zero {
            return Err(TisError::SeizeLocalityZero);
        }
        let reg = locality.window() + ACCESS;
        let raw = self.regs.read8(reg);
        if raw == 0xff {
            return Err(TisError::AccessInvalid(locality));
        }
        let access = Access::from_bits_retain(raw);
        if !access.contains(Access::VALID) {
            return Err(TisError::AccessNotValid(locality));
        }
        if access.contains(Access::ACTIVE_LOCALITY) {
            return Err(TisError::LocalityAlreadyActive(locality));
        }

        self.regs.write8(reg, Access::REQUEST_USE.bits());
        let mut granted = self.wait_active(reg);
        self.regs
            .write8(locality.window() + STS, Status::COMMAND_READY.bits());

        if !granted && force {
            log::warn!("Locality {} was not released, seizing it", locality);
            self.regs.write8(reg, Access::SEIZE.bits());
            granted = self.wait_active(reg);
            self.regs
                .write8(locality.window() + STS, Status::COMMAND_READY.bits());
        }
        if !granted {
            return Err(TisError::LocalityUnavailable(locality));
        }

        log::debug!("Locality {} active", locality);
        Ok(ActiveLocality {
            tis: self,
            locality,
            released: false,
        })
    }

    /// Relinquishes every locality. Fails if any of them stays active.
    pub fn deactivate_all(&mut self) -> Result<()> {
        let mut still_active = None;
        for locality in Locality::ALL {
            let reg = locality.window() + ACCESS;
            if self.regs.read8(reg) == 0xff {
                continue;
            }
            self.regs.write8(reg, Access::ACTIVE_LOCALITY.bits());
            if Access::from_bits_retain(self.regs.read8(reg)).contains(Access::ACTIVE_LOCALITY) {
                still_active.get_or_insert(locality);
            }
        }
        match still_active {
            Some(locality) => Err(TisError::DeactivateFailed(locality)),
            None => Ok(()),
        }
    }

    fn wait_active(&mut self, reg: usize) -> bool {
        let regs = &mut self.regs;
        self.access_poll.poll(|| {
            Access::from_bits_retain(regs.read8(reg)).contains(Access::ACTIVE_LOCALITY)
        })
    }
}

/// Exclusive use of one locality. Relinquished on drop.
pub struct ActiveLocality<'a, R: Registers> {
    tis: &'a mut Tis<R>,
    locality: Locality,
    released: bool,
}

impl<'a, R: Registers> ActiveLocality<'a, R> {
    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Relinquishes the locality and checks that the TPM let go of it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.relinquish()
    }

    fn relinquish(&mut self) -> Result<()> {
        let reg = self.locality.window() + ACCESS;
        self.tis.regs.write8(reg, Access::ACTIVE_LOCALITY.bits());
        if Access::from_bits_retain(self.tis.regs.read8(reg)).contains(Access::ACTIVE_LOCALITY) {
            return Err(TisError::DeactivateFailed(self.locality));
        }
        log::debug!("Locality {} released", self.locality);
        Ok(())
    }

    fn status(&mut self) -> Status {
        Status::from_bits_retain(self.tis.regs.read8(self.locality.window() + STS))
    }

    fn set_status(&mut self, status: Status) {
        self.tis
            .regs
            .write8(self.locality.window() + STS, status.bits());
    }

    fn wait_status(&mut self, wanted: Status) -> Result<()> {
        let reg = self.locality.window() + STS;
        let regs = &mut self.tis.regs;
        let reached = self
            .tis
            .poll
            .poll(|| Status::from_bits_retain(regs.read8(reg)).contains(wanted));
        match reached {
            true => Ok(()),
            false => Err(TisError::Timeout {
                locality: self.locality,
                waiting_for: wanted,
            }),
        }
    }

    fn data_available(&mut self) -> bool {
        self.status().contains(Status::DATA_AVAIL)
    }

    fn write_command(&mut self, request: &[u8]) -> Result<()> {
        let declared = declared_size(request).ok_or(TisError::MalformedRequest {
            declared: 0,
            actual: request.len(),
        })?;
        if declared != request.len() {
            return Err(TisError::MalformedRequest {
                declared,
                actual: request.len(),
            });
        }

        if !self.status().contains(Status::COMMAND_READY) {
            // wake the TPM from idle
            self.set_status(Status::COMMAND_READY);
            self.wait_status(Status::COMMAND_READY)?;
        }

        let fifo = self.locality.window() + DATA_FIFO;
        for byte in request {
            self.tis.regs.write8(fifo, *byte);
        }

        self.wait_status(Status::VALID)?;
        if self.status().contains(Status::EXPECT) {
            return Err(TisError::ExpectsMoreData(request.len()));
        }

        self.set_status(Status::GO);
        Ok(())
    }

    fn read_response(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.wait_status(Status::VALID | Status::DATA_AVAIL)?;

        let fifo = self.locality.window() + DATA_FIFO;
        // sized up front so a growing response never leaves copies behind
        let mut response = Zeroizing::new(Vec::with_capacity(MAX_RESPONSE_SIZE));
        while response.len() < HEADER_SIZE && self.data_available() {
            response.push(self.tis.regs.read8(fifo));
        }
        let size = declared_size(&response).ok_or(TisError::ShortResponse {
            expected: HEADER_SIZE,
            received: response.len(),
        })?;
        if !(HEADER_SIZE..=MAX_RESPONSE_SIZE).contains(&size) {
            return Err(TisError::MalformedResponse(size));
        }

        while response.len() < size && self.data_available() {
            response.push(self.tis.regs.read8(fifo));
        }
        if response.len() < size {
            return Err(TisError::ShortResponse {
                expected: size,
                received: response.len(),
            });
        }
        if self.data_available() {
            return Err(TisError::ResponseOverrun(size));
        }

        // lets the TPM finish background work
        self.set_status(Status::COMMAND_READY);
        Ok(response)
    }
}

impl<R: Registers> Transport for ActiveLocality<'_, R> {
    fn transmit(&mut self, request: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let result = self
            .write_command(request)
            .and_then(|_| self.read_response());
        if result.is_err() {
            // abort whatever the TPM was doing
            self.set_status(Status::COMMAND_READY);
        }
        result
    }
}

impl<R: Registers> Drop for ActiveLocality<'_, R> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.relinquish() {
                log::warn!("{}", e);
            }
        }
    }
}

/// Size field of a command or response header, if the header is complete.
pub fn declared_size(buffer: &[u8]) -> Option<usize> {
    let size: [u8; 4] = buffer.get(2..6)?.try_into().ok()?;
    match buffer.len() >= HEADER_SIZE {
        true => Some(u32::from_be_bytes(size) as usize),
        false => None,
    }
}

// Declared after the delegatable traits so their macros are in textual scope.
pub mod mmio;
#[cfg(test)]
pub(crate) mod sim;
