//! The on-disk LUKS1 header.

use super::cipher::{CipherSpec, Hash};
use super::{LuksError, Result, MAX_KEY_BYTES};
use std::io::Read;
use subtle::ConstantTimeEq;

pub const MAGIC: [u8; 6] = *b"LUKS\xba\xbe";
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 592;
pub const KEYSLOT_COUNT: usize = 8;
pub const KEY_ENABLED: u32 = 0x00ac_71f3;
pub const KEY_DISABLED: u32 = 0x0000_dead;
pub const DIGEST_SIZE: usize = 20;
pub const SALT_SIZE: usize = 32;

const UUID_SIZE: usize = 40;
const KEYSLOTS_OFFSET: usize = 208;
const KEYSLOT_SIZE: usize = 48;

fn be32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(word)
}

/// A NUL padded fixed-width string field.
fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn put_text(out: &mut [u8], value: &str) -> Result<()> {
    if value.len() > out.len() {
        return Err(LuksError::FieldTooLong(value.to_owned()));
    }
    out[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyslot {
    pub active: u32,
    pub iterations: u32,
    pub salt: [u8; SALT_SIZE],
    /// In 512-byte sectors from the start of the device.
    pub key_material_offset: u32,
    pub stripes: u32,
}

impl Keyslot {
    pub fn disabled(key_material_offset: u32, stripes: u32) -> Self {
        Self {
            active: KEY_DISABLED,
            iterations: 0,
            salt: [0; SALT_SIZE],
            key_material_offset,
            stripes,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active == KEY_ENABLED
    }

    fn parse(bytes: &[u8]) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[8..8 + SALT_SIZE]);
        Self {
            active: be32(bytes, 0),
            iterations: be32(bytes, 4),
            salt,
            key_material_offset: be32(bytes, 40),
            stripes: be32(bytes, 44),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.active.to_be_bytes());
        out[4..8].copy_from_slice(&self.iterations.to_be_bytes());
        out[8..8 + SALT_SIZE].copy_from_slice(&self.salt);
        out[40..44].copy_from_slice(&self.key_material_offset.to_be_bytes());
        out[44..48].copy_from_slice(&self.stripes.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksHeader {
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_spec: String,
    /// In 512-byte sectors.
    pub payload_offset: u32,
    pub key_bytes: u32,
    pub mk_digest: [u8; DIGEST_SIZE],
    pub mk_digest_salt: [u8; SALT_SIZE],
    pub mk_digest_iterations: u32,
    pub uuid: String,
    pub keyslots: [Keyslot; KEYSLOT_COUNT],
}

impl LuksHeader {
    pub fn read<R: Read>(source: &mut R) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        source.read_exact(&mut bytes)?;
        Self::parse(&bytes)
    }

    /// Validates magic, version, key size and digest iterations before
    /// looking at anything else.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[0..6] != MAGIC {
            return Err(LuksError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[6], bytes[7]]);
        if version != VERSION {
            return Err(LuksError::UnsupportedVersion(version));
        }
        let key_bytes = be32(bytes, 108);
        if key_bytes == 0 || key_bytes as usize > MAX_KEY_BYTES {
            return Err(LuksError::InvalidKeySize(key_bytes as usize));
        }
        let mk_digest_iterations = be32(bytes, 164);
        if mk_digest_iterations == 0 {
            return Err(LuksError::InvalidDigestIterations);
        }

        let mut mk_digest = [0u8; DIGEST_SIZE];
        mk_digest.copy_from_slice(&bytes[112..132]);
        let mut mk_digest_salt = [0u8; SALT_SIZE];
        mk_digest_salt.copy_from_slice(&bytes[132..164]);
        let mut keyslots = [Keyslot::disabled(0, 0); KEYSLOT_COUNT];
        for (i, slot) in keyslots.iter_mut().enumerate() {
            let at = KEYSLOTS_OFFSET + i * KEYSLOT_SIZE;
            *slot = Keyslot::parse(&bytes[at..at + KEYSLOT_SIZE]);
        }

        Ok(Self {
            cipher_name: text(&bytes[8..40]),
            cipher_mode: text(&bytes[40..72]),
            hash_spec: text(&bytes[72..104]),
            payload_offset: be32(bytes, 104),
            key_bytes,
            mk_digest,
            mk_digest_salt,
            mk_digest_iterations,
            uuid: text(&bytes[168..168 + UUID_SIZE]),
            keyslots,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut out = [0u8; HEADER_SIZE];
        out[0..6].copy_from_slice(&MAGIC);
        out[6..8].copy_from_slice(&VERSION.to_be_bytes());
        put_text(&mut out[8..40], &self.cipher_name)?;
        put_text(&mut out[40..72], &self.cipher_mode)?;
        put_text(&mut out[72..104], &self.hash_spec)?;
        out[104..108].copy_from_slice(&self.payload_offset.to_be_bytes());
        out[108..112].copy_from_slice(&self.key_bytes.to_be_bytes());
        out[112..132].copy_from_slice(&self.mk_digest);
        out[132..164].copy_from_slice(&self.mk_digest_salt);
        out[164..168].copy_from_slice(&self.mk_digest_iterations.to_be_bytes());
        put_text(&mut out[168..168 + UUID_SIZE], &self.uuid)?;
        for (i, slot) in self.keyslots.iter().enumerate() {
            let at = KEYSLOTS_OFFSET + i * KEYSLOT_SIZE;
            slot.encode(&mut out[at..at + KEYSLOT_SIZE]);
        }
        Ok(out)
    }

    pub fn cipher_spec(&self) -> Result<CipherSpec> {
        let spec = CipherSpec::parse(&self.cipher_name, &self.cipher_mode)?;
        if !spec.key_size_valid(self.key_bytes as usize) {
            return Err(LuksError::InvalidKeySize(self.key_bytes as usize));
        }
        Ok(spec)
    }

    pub fn hash(&self) -> Result<Hash> {
        self.hash_spec.parse()
    }

    /// Compares against a caller supplied UUID, ignoring dashes and case.
    pub fn uuid_matches(&self, filter: &str) -> bool {
        let strip = |s: &str| -> String {
            s.chars()
                .filter(|c| *c != '-')
                .map(|c| c.to_ascii_lowercase())
                .collect()
        };
        strip(&self.uuid) == strip(filter)
    }

    pub fn active_keyslots(&self) -> impl Iterator<Item = (usize, &Keyslot)> {
        self.keyslots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active())
    }

    /// Whether `candidate` derives to the stored master key digest.
    pub fn verify_master_key(&self, hash: Hash, candidate: &[u8]) -> bool {
        let mut digest = [0u8; DIGEST_SIZE];
        hash.pbkdf2(
            candidate,
            &self.mk_digest_salt,
            self.mk_digest_iterations,
            &mut digest,
        );
        digest.ct_eq(&self.mk_digest).into()
    }
}
