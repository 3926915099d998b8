use super::session::{sha1, Digest, DIGEST_SIZE};
use super::wire::{Reader, Writer};
use crate::tis::Locality;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// PCRs on a TPM 1.2.
pub const PCR_COUNT: u32 = 24;
const SELECT_SIZE: usize = (PCR_COUNT / 8) as usize;
pub const TAG_PCR_INFO_LONG: u16 = 0x0006;

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("expected {expected} PCR values, got {actual}")]
    ValueCount { expected: usize, actual: usize },
    #[error("malformed PCR info")]
    MalformedPcrInfo,
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// TPM 1.2 only has a SHA-1 bank.
fn parse_pcr_bank(bank: &str) -> Result<()> {
    match bank {
        "sha1" => Ok(()),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

fn parse_slot(slot: &str) -> Result<u32> {
    match slot.parse::<u32>() {
        Ok(index) if index < PCR_COUNT => Ok(index),
        _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
    }
}

fn parse_slots(slots: &str) -> Result<Vec<u32>> {
    slots.split(',').map(parse_slot).collect()
}

pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    parse_pcr_bank(bank)?;
    PcrSelection::new(&parse_slots(slots)?)
}

/// A `TPM_PCR_SELECTION` bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PcrSelection {
    select: [u8; SELECT_SIZE],
}

impl PcrSelection {
    /// PCR17 and PCR19, the late-launch measurements a passphrase is sealed to.
    pub const LATE_LAUNCH: PcrSelection = PcrSelection {
        select: [0x00, 0x00, 0x0a],
    };

    pub fn new(indices: &[u32]) -> Result<Self> {
        if indices.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        let mut select = [0u8; SELECT_SIZE];
        for &index in indices {
            if index >= PCR_COUNT {
                return Err(PcrError::InvalidPcrSlot(index.to_string()));
            }
            select[(index / 8) as usize] |= 1 << (index % 8);
        }
        Ok(Self { select })
    }

    pub fn is_empty(&self) -> bool {
        self.select.iter().all(|b| *b == 0)
    }

    /// Selected PCR indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..PCR_COUNT).filter(|i| self.select[(*i / 8) as usize] & (1 << (i % 8)) != 0)
    }

    pub fn as_bytes(&self) -> &[u8; SELECT_SIZE] {
        &self.select
    }

    pub fn write(&self, writer: Writer) -> Writer {
        writer.u16(SELECT_SIZE as u16).bytes(&self.select)
    }

    pub fn read(reader: &mut Reader<'_>) -> super::Result<Self> {
        let size = reader.u16()? as usize;
        let bytes = reader.bytes(size)?;
        // Larger selections are legal as long as the extra PCRs are unset.
        if bytes.iter().skip(SELECT_SIZE).any(|b| *b != 0) {
            return Err(PcrError::MalformedPcrInfo.into());
        }
        let mut select = [0u8; SELECT_SIZE];
        for (dst, src) in select.iter_mut().zip(bytes) {
            *dst = *src;
        }
        Ok(Self { select })
    }

    /// `SHA1(TPM_PCR_COMPOSITE)` over `values`, one per selected PCR.
    pub fn composite_hash(&self, values: &[Digest]) -> Result<Digest> {
        let expected = self.indices().count();
        if values.len() != expected {
            return Err(PcrError::ValueCount {
                expected,
                actual: values.len(),
            });
        }
        let mut composite = self
            .write(Writer::new())
            .u32((values.len() * DIGEST_SIZE) as u32);
        for value in values {
            composite = composite.bytes(value);
        }
        Ok(sha1(&[composite.as_bytes()]))
    }
}

impl FromStr for PcrSelection {
    type Err = PcrError;

    fn from_str(s: &str) -> Result<Self> {
        parse_pcr_selection_list(s)
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<String> = self.indices().map(|i| i.to_string()).collect();
        write!(f, "sha1:{}", slots.join(","))
    }
}

/// `TPM_PCR_INFO_LONG`: the PCR and locality policy a blob is sealed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrInfoLong {
    pub locality_at_creation: u8,
    pub locality_at_release: u8,
    pub creation_selection: PcrSelection,
    pub release_selection: PcrSelection,
    pub digest_at_creation: Digest,
    pub digest_at_release: Digest,
}

impl PcrInfoLong {
    /// Releasable only from `locality` and only while the selected PCRs
    /// hash to `digest`.
    pub fn bound_to(selection: PcrSelection, digest: Digest, locality: Locality) -> Self {
        Self {
            locality_at_creation: locality.selection_bit(),
            locality_at_release: locality.selection_bit(),
            creation_selection: selection,
            release_selection: selection,
            digest_at_creation: digest,
            digest_at_release: digest,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let writer = Writer::new()
            .u16(TAG_PCR_INFO_LONG)
            .u8(self.locality_at_creation)
            .u8(self.locality_at_release);
        let writer = self.creation_selection.write(writer);
        let writer = self.release_selection.write(writer);
        writer
            .bytes(&self.digest_at_creation)
            .bytes(&self.digest_at_release)
            .as_bytes()
            .to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> super::Result<Self> {
        let mut reader = Reader::new(bytes);
        if reader.u16()? != TAG_PCR_INFO_LONG {
            return Err(PcrError::MalformedPcrInfo.into());
        }
        let info = Self {
            locality_at_creation: reader.u8()?,
            locality_at_release: reader.u8()?,
            creation_selection: PcrSelection::read(&mut reader)?,
            release_selection: PcrSelection::read(&mut reader)?,
            digest_at_creation: reader.array()?,
            digest_at_release: reader.array()?,
        };
        reader.finish()?;
        Ok(info)
    }
}
