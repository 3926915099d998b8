//! Volume cipher configuration and sector-wise en/decryption.

use super::{LuksError, Result, SECTOR_SIZE};
use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use xts_mode::Xts128;
use zeroize::Zeroizing;

const BLOCK_SIZE: usize = 16;
/// LRW appends one block of tweak key to the cipher key.
const LRW_TWEAK_KEY_SIZE: usize = BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hash {
    Sha1,
    Sha256,
    Sha512,
}

impl Hash {
    pub fn digest_size(self) -> usize {
        match self {
            Hash::Sha1 => 20,
            Hash::Sha256 => 32,
            Hash::Sha512 => 64,
        }
    }

    pub fn digest(self, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            Zeroizing::new(hasher.finalize().to_vec())
        }
        match self {
            Hash::Sha1 => run::<Sha1>(parts),
            Hash::Sha256 => run::<Sha256>(parts),
            Hash::Sha512 => run::<Sha512>(parts),
        }
    }

    pub fn pbkdf2(self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        match self {
            Hash::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, out),
            Hash::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, out),
            Hash::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, out),
        }
    }
}

impl FromStr for Hash {
    type Err = LuksError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha1" => Ok(Hash::Sha1),
            "sha256" => Ok(Hash::Sha256),
            "sha512" => Ok(Hash::Sha512),
            _ => Err(LuksError::UnsupportedHash(s.to_owned())),
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hash::Sha1 => "sha1",
            Hash::Sha256 => "sha256",
            Hash::Sha512 => "sha512",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherName {
    Aes,
}

impl FromStr for CipherName {
    type Err = LuksError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aes" => Ok(CipherName::Aes),
            _ => Err(LuksError::UnsupportedCipher(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ecb,
    Cbc,
    Pcbc,
    Xts,
    Lrw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvMode {
    /// Low 32 bits of the sector, little-endian.
    Plain,
    /// The full 64-bit sector, little-endian.
    Plain64,
    /// Big-endian narrow-block count, starting at 1.
    Benbi,
    Null,
    /// Sector encrypted under the hash of the volume key.
    Essiv(Hash),
}

impl FromStr for IvMode {
    type Err = LuksError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(IvMode::Plain),
            "plain64" => Ok(IvMode::Plain64),
            "benbi" => Ok(IvMode::Benbi),
            "null" => Ok(IvMode::Null),
            _ => match s.strip_prefix("essiv:") {
                Some(hash) => Ok(IvMode::Essiv(hash.parse()?)),
                None => Err(LuksError::UnsupportedIvMode(s.to_owned())),
            },
        }
    }
}

/// A fully resolved `{cipher, mode, IV}` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    pub cipher: CipherName,
    pub mode: Mode,
    pub iv: IvMode,
}

impl CipherSpec {
    /// Resolves the header's cipher name and `<mode>[-<iv>]` string.
    pub fn parse(cipher: &str, mode: &str) -> Result<Self> {
        let cipher = cipher.parse()?;
        let (mode, iv) = match mode {
            "ecb" => (Mode::Ecb, IvMode::Null),
            "plain" => (Mode::Cbc, IvMode::Plain),
            _ => {
                let (mode_name, iv) = mode
                    .split_once('-')
                    .ok_or_else(|| LuksError::UnsupportedMode(mode.to_owned()))?;
                let mode_kind = match mode_name {
                    "cbc" => Mode::Cbc,
                    "pcbc" => Mode::Pcbc,
                    "xts" => Mode::Xts,
                    "lrw" => Mode::Lrw,
                    _ => return Err(LuksError::UnsupportedMode(mode.to_owned())),
                };
                (mode_kind, iv.parse()?)
            }
        };
        Ok(Self { cipher, mode, iv })
    }

    pub fn key_size_valid(&self, key_bytes: usize) -> bool {
        match self.mode {
            Mode::Xts => matches!(key_bytes, 32 | 48 | 64),
            Mode::Lrw => matches!(key_bytes, 32 | 40 | 48),
            _ => matches!(key_bytes, 16 | 24 | 32),
        }
    }
}

/// Parses the `cryptsetup` style `aes-xts-plain64` form.
impl FromStr for CipherSpec {
    type Err = LuksError;

    fn from_str(s: &str) -> Result<Self> {
        let (cipher, mode) = s
            .split_once('-')
            .ok_or_else(|| LuksError::UnsupportedMode(s.to_owned()))?;
        Self::parse(cipher, mode)
    }
}

impl fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("aes-")?;
        match (self.mode, self.iv) {
            (Mode::Ecb, _) => return f.write_str("ecb"),
            (Mode::Cbc, IvMode::Plain) => f.write_str("cbc-plain")?,
            (Mode::Cbc, _) => f.write_str("cbc-")?,
            (Mode::Pcbc, _) => f.write_str("pcbc-")?,
            (Mode::Xts, _) => f.write_str("xts-")?,
            (Mode::Lrw, _) => f.write_str("lrw-")?,
        }
        match (self.mode, self.iv) {
            (Mode::Cbc, IvMode::Plain) => Ok(()),
            (_, IvMode::Plain) => f.write_str("plain"),
            (_, IvMode::Plain64) => f.write_str("plain64"),
            (_, IvMode::Benbi) => f.write_str("benbi"),
            (_, IvMode::Null) => f.write_str("null"),
            (_, IvMode::Essiv(hash)) => write!(f, "essiv:{}", hash),
        }
    }
}

enum Aes {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl Aes {
    fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| LuksError::InvalidKeySize(key.len());
        Ok(match key.len() {
            16 => Aes::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            24 => Aes::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            32 => Aes::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
            n => return Err(LuksError::InvalidKeySize(n)),
        })
    }

    fn encrypt(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Aes::Aes128(c) => c.encrypt_block(block),
            Aes::Aes192(c) => c.encrypt_block(block),
            Aes::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Aes::Aes128(c) => c.decrypt_block(block),
            Aes::Aes192(c) => c.decrypt_block(block),
            Aes::Aes256(c) => c.decrypt_block(block),
        }
    }
}

enum Xts {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

impl Xts {
    fn new(key: &[u8]) -> Result<Self> {
        let (k1, k2) = key.split_at(key.len() / 2);
        let invalid = |_| LuksError::InvalidKeySize(key.len());
        Ok(match k1.len() {
            16 => Xts::Aes128(Xts128::new(
                Aes128::new_from_slice(k1).map_err(invalid)?,
                Aes128::new_from_slice(k2).map_err(invalid)?,
            )),
            24 => Xts::Aes192(Xts128::new(
                Aes192::new_from_slice(k1).map_err(invalid)?,
                Aes192::new_from_slice(k2).map_err(invalid)?,
            )),
            32 => Xts::Aes256(Xts128::new(
                Aes256::new_from_slice(k1).map_err(invalid)?,
                Aes256::new_from_slice(k2).map_err(invalid)?,
            )),
            _ => return Err(LuksError::InvalidKeySize(key.len())),
        })
    }

    fn encrypt(&self, sector: &mut [u8], tweak: [u8; BLOCK_SIZE]) {
        match self {
            Xts::Aes128(x) => x.encrypt_sector(sector, tweak),
            Xts::Aes192(x) => x.encrypt_sector(sector, tweak),
            Xts::Aes256(x) => x.encrypt_sector(sector, tweak),
        }
    }

    fn decrypt(&self, sector: &mut [u8], tweak: [u8; BLOCK_SIZE]) {
        match self {
            Xts::Aes128(x) => x.decrypt_sector(sector, tweak),
            Xts::Aes192(x) => x.decrypt_sector(sector, tweak),
            Xts::Aes256(x) => x.decrypt_sector(sector, tweak),
        }
    }
}

/// Multiplication in GF(2^128) with big-endian bit and byte order, as LRW uses.
fn gf128_mul(mut a: u128, mut b: u128) -> u128 {
    let mut product = 0u128;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a >> 127;
        a <<= 1;
        if carry != 0 {
            a ^= 0x87;
        }
        b >>= 1;
    }
    product
}

fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

enum Engine {
    Block(Aes),
    Xts(Xts),
    Lrw { aes: Aes, tweak_key: u128 },
}

/// A keyed volume cipher.
pub struct VolumeCipher {
    mode: Mode,
    iv_mode: IvMode,
    engine: Engine,
    essiv: Option<Aes>,
}

impl VolumeCipher {
    pub fn new(spec: &CipherSpec, key: &[u8]) -> Result<Self> {
        if !spec.key_size_valid(key.len()) {
            return Err(LuksError::InvalidKeySize(key.len()));
        }
        let engine = match spec.mode {
            Mode::Xts => Engine::Xts(Xts::new(key)?),
            Mode::Lrw => {
                let (cipher_key, tweak_key) = key.split_at(key.len() - LRW_TWEAK_KEY_SIZE);
                let mut tweak = [0u8; BLOCK_SIZE];
                tweak.copy_from_slice(tweak_key);
                Engine::Lrw {
                    aes: Aes::new(cipher_key)?,
                    tweak_key: u128::from_be_bytes(tweak),
                }
            }
            _ => Engine::Block(Aes::new(key)?),
        };
        let essiv = match spec.iv {
            IvMode::Essiv(hash) => {
                let salt = hash.digest(&[key]);
                let essiv = Aes::new(&salt)
                    .map_err(|_| LuksError::UnsupportedIvMode(format!("essiv:{}", hash)))?;
                Some(essiv)
            }
            _ => None,
        };
        Ok(Self {
            mode: spec.mode,
            iv_mode: spec.iv,
            engine,
            essiv,
        })
    }

    fn iv(&self, sector: u64) -> [u8; BLOCK_SIZE] {
        let mut iv = [0u8; BLOCK_SIZE];
        match self.iv_mode {
            IvMode::Plain => iv[..4].copy_from_slice(&(sector as u32).to_le_bytes()),
            IvMode::Plain64 => iv[..8].copy_from_slice(&sector.to_le_bytes()),
            IvMode::Benbi => {
                let blocks = (sector << 5).wrapping_add(1);
                iv[8..].copy_from_slice(&blocks.to_be_bytes());
            }
            IvMode::Null => {}
            IvMode::Essiv(_) => {
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                if let Some(essiv) = &self.essiv {
                    essiv.encrypt(&mut iv);
                }
            }
        }
        iv
    }

    fn check_length(buf: &[u8]) -> Result<()> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(LuksError::UnalignedLength(buf.len()));
        }
        Ok(())
    }

    /// Decrypts `buf` in place; `first_sector` numbers its first 512 bytes.
    pub fn decrypt(&self, buf: &mut [u8], first_sector: u64) -> Result<()> {
        Self::check_length(buf)?;
        for (n, sector) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            let iv = self.iv(first_sector + n as u64);
            self.decrypt_sector(sector, iv);
        }
        Ok(())
    }

    pub fn encrypt(&self, buf: &mut [u8], first_sector: u64) -> Result<()> {
        Self::check_length(buf)?;
        for (n, sector) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            let iv = self.iv(first_sector + n as u64);
            self.encrypt_sector(sector, iv);
        }
        Ok(())
    }

    fn decrypt_sector(&self, sector: &mut [u8], iv: [u8; BLOCK_SIZE]) {
        match (&self.engine, self.mode) {
            (Engine::Xts(xts), _) => xts.decrypt(sector, iv),
            (Engine::Lrw { aes, tweak_key }, _) => {
                let index = u128::from_be_bytes(iv);
                for (j, block) in sector.chunks_mut(BLOCK_SIZE).enumerate() {
                    let tweak = gf128_mul(*tweak_key, index.wrapping_add(j as u128)).to_be_bytes();
                    xor_in_place(block, &tweak);
                    aes.decrypt(block);
                    xor_in_place(block, &tweak);
                }
            }
            (Engine::Block(aes), Mode::Ecb) => {
                for block in sector.chunks_mut(BLOCK_SIZE) {
                    aes.decrypt(block);
                }
            }
            (Engine::Block(aes), Mode::Pcbc) => {
                let mut chain = iv;
                for block in sector.chunks_mut(BLOCK_SIZE) {
                    let mut ciphertext = [0u8; BLOCK_SIZE];
                    ciphertext.copy_from_slice(block);
                    aes.decrypt(block);
                    xor_in_place(block, &chain);
                    chain = ciphertext;
                    xor_in_place(&mut chain, block);
                }
            }
            (Engine::Block(aes), _) => {
                let mut chain = iv;
                for block in sector.chunks_mut(BLOCK_SIZE) {
                    let mut ciphertext = [0u8; BLOCK_SIZE];
                    ciphertext.copy_from_slice(block);
                    aes.decrypt(block);
                    xor_in_place(block, &chain);
                    chain = ciphertext;
                }
            }
        }
    }

    fn encrypt_sector(&self, sector: &mut [u8], iv: [u8; BLOCK_SIZE]) {
        match (&self.engine, self.mode) {
            (Engine::Xts(xts), _) => xts.encrypt(sector, iv),
            (Engine::Lrw { aes, tweak_key }, _) => {
                let index = u128::from_be_bytes(iv);
                for (j, block) in sector.chunks_mut(BLOCK_SIZE).enumerate() {
                    let tweak = gf128_mul(*tweak_key, index.wrapping_add(j as u128)).to_be_bytes();
                    xor_in_place(block, &tweak);
                    aes.encrypt(block);
                    xor_in_place(block, &tweak);
                }
            }
            (Engine::Block(aes), Mode::Ecb) => {
                for block in sector.chunks_mut(BLOCK_SIZE) {
                    aes.encrypt(block);
                }
            }
            (Engine::Block(aes), Mode::Pcbc) => {
                let mut chain = iv;
                for block in sector.chunks_mut(BLOCK_SIZE) {
                    let mut plaintext = [0u8; BLOCK_SIZE];
                    plaintext.copy_from_slice(block);
                    xor_in_place(block, &chain);
                    aes.encrypt(block);
                    chain = plaintext;
                    xor_in_place(&mut chain, block);
                }
            }
            (Engine::Block(aes), _) => {
                let mut chain = iv;
                for block in sector.chunks_mut(BLOCK_SIZE) {
                    xor_in_place(block, &chain);
                    aes.encrypt(block);
                    chain.copy_from_slice(block);
                }
            }
        }
    }
}
