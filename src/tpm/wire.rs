//! TPM 1.2 command and response marshalling. All integers are big-endian.

use super::{Result, TpmError};
use crate::tis::HEADER_SIZE;
use std::fmt;
use zeroize::Zeroizing;

pub const TAG_RQU_COMMAND: u16 = 0x00c1;
pub const TAG_RQU_AUTH1_COMMAND: u16 = 0x00c2;
pub const TAG_RQU_AUTH2_COMMAND: u16 = 0x00c3;
pub const TAG_RSP_COMMAND: u16 = 0x00c4;
pub const TAG_RSP_AUTH1_COMMAND: u16 = 0x00c5;
pub const TAG_RSP_AUTH2_COMMAND: u16 = 0x00c6;

/// Handle, odd nonce, continue flag and HMAC appended per session to a request.
pub const REQUEST_AUTH_SIZE: usize = 4 + 20 + 1 + 20;
/// Even nonce, continue flag and HMAC appended per session to a response.
pub const RESPONSE_AUTH_SIZE: usize = 20 + 1 + 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ordinal {
    Oiap = 0x0a,
    Osap = 0x0b,
    Extend = 0x14,
    PcrRead = 0x15,
    Seal = 0x17,
    Unseal = 0x18,
    GetRandom = 0x46,
    Startup = 0x99,
    FlushSpecific = 0xba,
    NvWriteValue = 0xcd,
    NvWriteValueAuth = 0xce,
    NvReadValue = 0xcf,
    NvReadValueAuth = 0xd0,
}

impl Ordinal {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let ordinal = match code {
            0x0a => Ordinal::Oiap,
            0x0b => Ordinal::Osap,
            0x14 => Ordinal::Extend,
            0x15 => Ordinal::PcrRead,
            0x17 => Ordinal::Seal,
            0x18 => Ordinal::Unseal,
            0x46 => Ordinal::GetRandom,
            0x99 => Ordinal::Startup,
            0xba => Ordinal::FlushSpecific,
            0xcd => Ordinal::NvWriteValue,
            0xce => Ordinal::NvWriteValueAuth,
            0xcf => Ordinal::NvReadValue,
            0xd0 => Ordinal::NvReadValueAuth,
            _ => return None,
        };
        Some(ordinal)
    }
}

/// Tag pair for a command carrying `sessions` authorisation blocks.
pub fn tags(sessions: usize) -> (u16, u16) {
    match sessions {
        0 => (TAG_RQU_COMMAND, TAG_RSP_COMMAND),
        1 => (TAG_RQU_AUTH1_COMMAND, TAG_RSP_AUTH1_COMMAND),
        _ => (TAG_RQU_AUTH2_COMMAND, TAG_RSP_AUTH2_COMMAND),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode(pub u32);

impl ReturnCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const AUTHFAIL: Self = Self(0x01);
    pub const BADINDEX: Self = Self(0x02);
    pub const BAD_PARAMETER: Self = Self(0x03);
    pub const FAIL: Self = Self(0x09);
    pub const NOSPACE: Self = Self(0x11);
    pub const WRONGPCRVAL: Self = Self(0x18);
    pub const AUTH2FAIL: Self = Self(0x1d);
    pub const BADTAG: Self = Self(0x1e);
    pub const INVALID_AUTHHANDLE: Self = Self(0x22);
    pub const INVALID_POSTINIT: Self = Self(0x26);
    pub const BAD_LOCALITY: Self = Self(0x3d);
    pub const RETRY: Self = Self(0x800);
    pub const DEFEND_LOCK_RUNNING: Self = Self(0x803);

    const NON_FATAL: u32 = 0x800;

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Non-fatal codes mean the same command may succeed later.
    pub fn is_retryable(self) -> bool {
        self.0 & Self::NON_FATAL != 0
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "TPM_SUCCESS",
            Self::AUTHFAIL => "TPM_AUTHFAIL",
            Self::BADINDEX => "TPM_BADINDEX",
            Self::BAD_PARAMETER => "TPM_BAD_PARAMETER",
            Self::FAIL => "TPM_FAIL",
            Self::NOSPACE => "TPM_NOSPACE",
            Self::WRONGPCRVAL => "TPM_WRONGPCRVAL",
            Self::AUTH2FAIL => "TPM_AUTH2FAIL",
            Self::BADTAG => "TPM_BADTAG",
            Self::INVALID_AUTHHANDLE => "TPM_INVALID_AUTHHANDLE",
            Self::INVALID_POSTINIT => "TPM_INVALID_POSTINIT",
            Self::BAD_LOCALITY => "TPM_BAD_LOCALITY",
            Self::RETRY => "TPM_RETRY",
            Self::DEFEND_LOCK_RUNNING => "TPM_DEFEND_LOCK_RUNNING",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#x})", name, self.0),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// Append-only big-endian buffer, wiped on drop.
#[derive(Default)]
pub struct Writer {
    buf: Zeroizing<Vec<u8>>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a command; the size field is filled in by [`Writer::finish`].
    pub fn command(tag: u16, ordinal: Ordinal) -> Self {
        Self::new().u16(tag).u32(0).u32(ordinal.code())
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    pub fn u16(self, value: u16) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn u32(self, value: u32) -> Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// 32-bit length prefix followed by the bytes.
    pub fn sized(self, value: &[u8]) -> Self {
        self.u32(value.len() as u32).bytes(value)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(mut self) -> Zeroizing<Vec<u8>> {
        let size = (self.buf.len() as u32).to_be_bytes();
        if self.buf.len() >= HEADER_SIZE {
            self.buf[2..6].copy_from_slice(&size);
        }
        self.buf
    }
}

/// Cursor over a response.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(TpmError::Truncated {
                wanted: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Bytes behind a 32-bit length prefix.
    pub fn sized(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Everything consumed since `start`.
    pub fn since(&self, start: usize) -> &'a [u8] {
        &self.buf[start..self.pos]
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(TpmError::Trailing(n)),
        }
    }
}
