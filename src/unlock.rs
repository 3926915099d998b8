//! One recovery attempt from header to master key.

use crate::luks::header::LuksHeader;
use crate::luks::{recover_master_key, LuksError, MasterKey};
use crate::secret::{self, Prompt, SecretError, Settings};
use crate::tis::{Registers, Tis, TisError};
use crate::tpm::TpmError;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use thiserror::Error;

/// Failures grouped by what the operator has to do about them.
#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("TPM hardware problem")]
    Hardware(#[source] TisError),
    #[error("TPM refused the request")]
    Tpm(#[source] TpmError),
    #[error("unusable LUKS header")]
    Header(#[source] LuksError),
    #[error("volume UUID {found} does not match {expected}")]
    UuidMismatch { expected: String, found: String },
    #[error("no keyslot accepts the assembled secret")]
    AccessDenied,
    #[error("bad input")]
    Input(#[source] SecretError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UnlockError {
    /// Whether re-entering the secrets could succeed.
    pub fn is_wrong_secret(&self) -> bool {
        match self {
            UnlockError::AccessDenied => true,
            UnlockError::Tpm(e) => {
                use crate::tpm::wire::ReturnCode;
                matches!(
                    e.return_code(),
                    Some(ReturnCode::AUTHFAIL | ReturnCode::AUTH2FAIL)
                )
            }
            _ => false,
        }
    }
}

impl From<SecretError> for UnlockError {
    fn from(e: SecretError) -> Self {
        match e {
            SecretError::Tis(e) => UnlockError::Hardware(e),
            SecretError::Tpm(TpmError::Tis(e)) => UnlockError::Hardware(e),
            SecretError::Tpm(e) => UnlockError::Tpm(e),
            e => UnlockError::Input(e),
        }
    }
}

impl From<LuksError> for UnlockError {
    fn from(e: LuksError) -> Self {
        match e {
            LuksError::AccessDenied => UnlockError::AccessDenied,
            LuksError::Io(e) => UnlockError::Io(e),
            e => UnlockError::Header(e),
        }
    }
}

impl From<TisError> for UnlockError {
    fn from(e: TisError) -> Self {
        UnlockError::Hardware(e)
    }
}

pub type Result<T, E = UnlockError> = core::result::Result<T, E>;

/// Reads and fully validates the header at the start of `device`.
pub fn read_header<S: Read + Seek>(device: &mut S, uuid: Option<&str>) -> Result<LuksHeader> {
    device.seek(SeekFrom::Start(0))?;
    let header = LuksHeader::read(device)?;
    header.cipher_spec()?;
    header.hash()?;
    if let Some(expected) = uuid {
        if !header.uuid_matches(expected) {
            return Err(UnlockError::UuidMismatch {
                expected: expected.to_owned(),
                found: header.uuid.clone(),
            });
        }
    }
    log::debug!(
        "LUKS volume {} uses {}-{} with {}",
        header.uuid,
        header.cipher_name,
        header.cipher_mode,
        header.hash_spec
    );
    Ok(header)
}

/// Validates the header, assembles the working secret through the TPM and
/// recovers the master key. The header is checked before any secret is
/// requested.
pub fn unlock<R: Registers, S: Read + Seek>(
    tis: &mut Tis<R>,
    device: &mut S,
    settings: &Settings,
    uuid: Option<&str>,
    prompt: &mut dyn Prompt,
) -> Result<MasterKey> {
    let header = read_header(device, uuid)?;
    let secret = secret::assemble(tis, settings, prompt)?;
    log::info!("trying keyslots");
    Ok(recover_master_key(&header, device, secret.as_bytes())?)
}

/// Writes the raw key readable by the owner only.
pub fn write_key_file(path: &Path, key: &MasterKey) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
