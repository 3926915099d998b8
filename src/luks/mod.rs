//! LUKS1 master key recovery.
//!
//! Every active keyslot is tried in header order: the working secret is
//! stretched with the slot's salt, the slot's key material is decrypted and
//! merged, and the candidate is checked against the header's master key
//! digest. The first slot that verifies wins.

pub mod af;
pub mod cipher;
pub mod header;

use self::cipher::{CipherSpec, Hash, VolumeCipher};
use self::header::{Keyslot, LuksHeader, DIGEST_SIZE, KEYSLOT_COUNT, KEY_ENABLED, SALT_SIZE};
use log::{debug, info, warn};
use rand::RngCore;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SECTOR_SIZE: usize = 512;
pub const MAX_KEY_BYTES: usize = 1024;
/// Anything beyond this is treated as a corrupt keyslot rather than allocated.
pub const MAX_STRIPES: u32 = 65_536;
pub const DEFAULT_STRIPES: u32 = 4000;

/// Keyslot areas and the payload start on 4 KiB boundaries.
const ALIGN_SECTORS: u64 = 8;

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("not a LUKS header")]
    BadMagic,
    #[error("unsupported LUKS version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported hash `{0}`")]
    UnsupportedHash(String),
    #[error("unsupported cipher `{0}`")]
    UnsupportedCipher(String),
    #[error("unsupported cipher mode `{0}`")]
    UnsupportedMode(String),
    #[error("unsupported IV mode `{0}`")]
    UnsupportedIvMode(String),
    #[error("invalid key size {0}")]
    InvalidKeySize(usize),
    #[error("master key digest has no iterations")]
    InvalidDigestIterations,
    #[error("buffer of {0} bytes is not a whole number of cipher blocks")]
    UnalignedLength(usize),
    #[error("cannot split a {key_len} byte key into {stripes} stripes")]
    InvalidStripes { key_len: usize, stripes: u32 },
    #[error("key material too short: expected {expected} bytes, got {actual}")]
    ShortKeyMaterial { expected: usize, actual: usize },
    #[error("header field too long: `{0}`")]
    FieldTooLong(String),
    #[error("no free keyslot")]
    NoFreeKeyslot,
    #[error("key does not match the header's master key digest")]
    WrongMasterKey,
    #[error("no keyslot matches the supplied secret")]
    AccessDenied,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LuksError> = core::result::Result<T, E>;

/// A verified volume master key and the keyslot that released it.
pub struct MasterKey {
    slot: usize,
    key: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("slot", &self.slot)
            .field("len", &self.key.len())
            .finish_non_exhaustive()
    }
}

fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) / to * to
}

/// On-disk size of a slot's key material, padded to whole sectors.
fn material_size(key_len: usize, stripes: u32) -> usize {
    round_up(key_len * stripes as usize, SECTOR_SIZE)
}

fn usable(index: usize, slot: &Keyslot) -> bool {
    if slot.stripes == 0 || slot.stripes > MAX_STRIPES {
        warn!("keyslot {} has {} stripes, skipping", index, slot.stripes);
        return false;
    }
    if slot.iterations == 0 {
        warn!("keyslot {} has no iterations, skipping", index);
        return false;
    }
    true
}

/// Recovers the master key from the first active keyslot `secret` opens.
///
/// `source` is the whole device (or image): key material offsets are
/// absolute. Returns [`LuksError::AccessDenied`] when every active slot
/// has been tried without a digest match.
pub fn recover_master_key<S: Read + Seek>(
    header: &LuksHeader,
    source: &mut S,
    secret: &[u8],
) -> Result<MasterKey> {
    let spec = header.cipher_spec()?;
    let hash = header.hash()?;
    if header.mk_digest_iterations == 0 {
        return Err(LuksError::InvalidDigestIterations);
    }
    let key_len = header.key_bytes as usize;

    let slots: Vec<(usize, &Keyslot)> = header
        .active_keyslots()
        .filter(|(i, slot)| usable(*i, slot))
        .collect();
    let scratch_size = slots
        .iter()
        .map(|(_, slot)| material_size(key_len, slot.stripes))
        .max()
        .unwrap_or(0);
    let mut scratch = Zeroizing::new(vec![0u8; scratch_size]);
    let mut stretched = Zeroizing::new(vec![0u8; key_len]);

    for (index, slot) in slots {
        hash.pbkdf2(secret, &slot.salt, slot.iterations, &mut stretched);
        let cipher = VolumeCipher::new(&spec, &stretched)?;

        let material = &mut scratch[..material_size(key_len, slot.stripes)];
        source.seek(SeekFrom::Start(
            slot.key_material_offset as u64 * SECTOR_SIZE as u64,
        ))?;
        source.read_exact(material)?;
        cipher.decrypt(material, 0)?;

        let candidate = af::merge(hash, material, key_len, slot.stripes)?;
        if header.verify_master_key(hash, &candidate) {
            info!("keyslot {} unlocked", index);
            return Ok(MasterKey {
                slot: index,
                key: candidate,
            });
        }
        debug!("keyslot {} digest mismatch", index);
    }
    Err(LuksError::AccessDenied)
}

/// Builds a header for `master_key` with every keyslot disabled.
pub fn format<R: RngCore>(
    spec: &CipherSpec,
    hash: Hash,
    master_key: &[u8],
    mk_iterations: u32,
    uuid: &str,
    rng: &mut R,
) -> Result<LuksHeader> {
    if !spec.key_size_valid(master_key.len()) {
        return Err(LuksError::InvalidKeySize(master_key.len()));
    }
    if mk_iterations == 0 {
        return Err(LuksError::InvalidDigestIterations);
    }
    let full = spec.to_string();
    let (cipher_name, cipher_mode) = full
        .split_once('-')
        .ok_or_else(|| LuksError::UnsupportedMode(full.clone()))?;

    let mut mk_digest_salt = [0u8; SALT_SIZE];
    rng.fill_bytes(&mut mk_digest_salt);
    let mut mk_digest = [0u8; DIGEST_SIZE];
    hash.pbkdf2(master_key, &mk_digest_salt, mk_iterations, &mut mk_digest);

    let slot_sectors = round_up(
        material_size(master_key.len(), DEFAULT_STRIPES) / SECTOR_SIZE,
        ALIGN_SECTORS as usize,
    ) as u64;
    let first = ALIGN_SECTORS;
    let mut keyslots = [Keyslot::disabled(0, DEFAULT_STRIPES); KEYSLOT_COUNT];
    for (i, slot) in keyslots.iter_mut().enumerate() {
        slot.key_material_offset = (first + i as u64 * slot_sectors) as u32;
    }

    Ok(LuksHeader {
        cipher_name: cipher_name.to_owned(),
        cipher_mode: cipher_mode.to_owned(),
        hash_spec: hash.to_string(),
        payload_offset: (first + KEYSLOT_COUNT as u64 * slot_sectors) as u32,
        key_bytes: master_key.len() as u32,
        mk_digest,
        mk_digest_salt,
        mk_digest_iterations: mk_iterations,
        uuid: uuid.to_owned(),
        keyslots,
    })
}

/// Stores `master_key` under `secret` in the first free keyslot and rewrites
/// the header at the start of `device`.
pub fn add_keyslot<D: Write + Seek, R: RngCore>(
    header: &mut LuksHeader,
    device: &mut D,
    master_key: &[u8],
    secret: &[u8],
    iterations: u32,
    rng: &mut R,
) -> Result<usize> {
    let spec = header.cipher_spec()?;
    let hash = header.hash()?;
    if master_key.len() != header.key_bytes as usize
        || !header.verify_master_key(hash, master_key)
    {
        return Err(LuksError::WrongMasterKey);
    }
    let index = header
        .keyslots
        .iter()
        .position(|slot| !slot.is_active())
        .ok_or(LuksError::NoFreeKeyslot)?;
    let slot = &mut header.keyslots[index];
    if slot.stripes == 0 || slot.stripes > MAX_STRIPES {
        return Err(LuksError::InvalidStripes {
            key_len: master_key.len(),
            stripes: slot.stripes,
        });
    }

    let mut salt = [0u8; SALT_SIZE];
    rng.fill_bytes(&mut salt);
    let mut stretched = Zeroizing::new(vec![0u8; master_key.len()]);
    hash.pbkdf2(secret, &salt, iterations, &mut stretched);

    let split = af::split(hash, master_key, slot.stripes, rng)?;
    let mut material = Zeroizing::new(vec![0u8; material_size(master_key.len(), slot.stripes)]);
    material[..split.len()].copy_from_slice(&split);
    VolumeCipher::new(&spec, &stretched)?.encrypt(&mut material, 0)?;

    device.seek(SeekFrom::Start(
        slot.key_material_offset as u64 * SECTOR_SIZE as u64,
    ))?;
    device.write_all(&material)?;

    slot.active = KEY_ENABLED;
    slot.iterations = iterations;
    slot.salt = salt;
    device.seek(SeekFrom::Start(0))?;
    device.write_all(&header.to_bytes()?)?;
    device.flush()?;
    debug!("master key stored in keyslot {}", index);
    Ok(index)
}
