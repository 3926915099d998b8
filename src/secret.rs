//! Working secret assembly.
//!
//! The passphrase sealed in the TPM is released from a fixed NV index and
//! joined with a countersign typed by the operator. The joined value is what
//! the LUKS keyslots are enrolled with; it never touches the disk.

use crate::tis::{Locality, Registers, Tis, TisError, Transport};
use crate::tpm::pcr::{PcrError, PcrInfoLong, PcrSelection};
use crate::tpm::session::AuthData;
use crate::tpm::stored::StoredData;
use crate::tpm::{EntityType, NvAuth, Tpm, TpmError, KH_SRK};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;
use zeroize::Zeroizing;

pub const MAX_PASSPHRASE: usize = 128;
pub const MAX_AUTH_INPUT: usize = 64;
pub const MAX_COUNTERSIGN: usize = 192;
pub const MAX_SECRET: usize = 256;

const CONFIRMATION: &str = "Please confirm that the passphrase presented above matches the one \
which was entered during system configuration. If the passphrase does not match, contact your \
systems administrator immediately. Otherwise proceed to provide the countersign.";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error(transparent)]
    Tis(#[from] TisError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error("failed to read {what}")]
    Prompt {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{what} is longer than {max} bytes")]
    InputTooLong { what: &'static str, max: usize },
    #[error("the TPM released an empty passphrase")]
    EmptyUnsealed,
    #[error("combined secret of {len} bytes exceeds {max}")]
    SecretTooLong { len: usize, max: usize },
}

pub type Result<T, E = SecretError> = core::result::Result<T, E>;

/// Which authorisation guards the NV area holding the sealed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NvPolicy {
    #[default]
    Public,
    /// TPM owner secret.
    Owner,
    /// The area's own secret.
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub locality: Locality,
    pub nv_index: u32,
    pub nv_size: u32,
    pub nv_policy: NvPolicy,
    pub pcrs: PcrSelection,
    pub show_passphrase: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            locality: Locality::Two,
            nv_index: 4,
            nv_size: 400,
            nv_policy: NvPolicy::Public,
            pcrs: PcrSelection::LATE_LAUNCH,
            show_passphrase: true,
        }
    }
}

/// Interactive, non-echoing input.
pub trait Prompt {
    fn read_secret(&mut self, message: &str) -> io::Result<Zeroizing<String>>;
    fn show(&mut self, message: &str) -> io::Result<()>;
}

/// Prompts on the controlling terminal.
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn read_secret(&mut self, message: &str) -> io::Result<Zeroizing<String>> {
        rpassword::prompt_password(message).map(Zeroizing::new)
    }

    fn show(&mut self, message: &str) -> io::Result<()> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", message)?;
        stderr.flush()
    }
}

fn ask(prompt: &mut dyn Prompt, what: &'static str, max: usize) -> Result<Zeroizing<String>> {
    let message = format!("Please enter the {} ({} bytes max): ", what, max);
    let answer = prompt
        .read_secret(&message)
        .map_err(|source| SecretError::Prompt { what, source })?;
    if answer.len() > max {
        return Err(SecretError::InputTooLong { what, max });
    }
    Ok(answer)
}

/// Authorisation values are the SHA-1 of what was typed.
fn ask_auth(prompt: &mut dyn Prompt, what: &'static str) -> Result<AuthData> {
    let answer = ask(prompt, what, MAX_AUTH_INPUT)?;
    Ok(AuthData::from_passphrase(answer.as_bytes()))
}

/// Resolves `policy` into an [`NvAuth`] for a single NV command.
fn with_nv_auth<T, O, F>(
    tpm: &mut Tpm<T>,
    policy: NvPolicy,
    prompt: &mut dyn Prompt,
    command: F,
) -> Result<O>
where
    T: Transport,
    F: FnOnce(&mut Tpm<T>, NvAuth<'_>) -> crate::tpm::Result<O>,
{
    let (what, auth) = match policy {
        NvPolicy::Public => return Ok(command(tpm, NvAuth::Public)?),
        NvPolicy::Owner => ("ownerAuthData", ask_auth(prompt, "ownerAuthData")?),
        NvPolicy::Index => ("nvAuthData", ask_auth(prompt, "nvAuthData")?),
    };
    debug!("authorising NV access with {}", what);
    let mut session = tpm.oiap()?;
    session.set_continue(false);
    let nv_auth = match policy {
        NvPolicy::Owner => NvAuth::Owner(&mut session, &auth),
        _ => NvAuth::Index(&mut session, &auth),
    };
    Ok(command(tpm, nv_auth)?)
}

/// The unsealed passphrase, minus its terminator, followed by the countersign.
pub struct WorkingSecret(Zeroizing<Vec<u8>>);

impl WorkingSecret {
    pub fn combine(unsealed: &[u8], countersign: &[u8]) -> Result<Self> {
        let (_terminator, passphrase) = unsealed
            .split_last()
            .ok_or(SecretError::EmptyUnsealed)?;
        let len = passphrase.len() + countersign.len();
        if len > MAX_SECRET {
            return Err(SecretError::SecretTooLong {
                len,
                max: MAX_SECRET,
            });
        }
        let mut secret = Zeroizing::new(Vec::with_capacity(len));
        secret.extend_from_slice(passphrase);
        secret.extend_from_slice(countersign);
        Ok(Self(secret))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for WorkingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkingSecret({} bytes)", self.0.len())
    }
}

fn unseal_passphrase<T: Transport>(
    tpm: &mut Tpm<T>,
    settings: &Settings,
    prompt: &mut dyn Prompt,
) -> Result<Zeroizing<Vec<u8>>> {
    let (index, size) = (settings.nv_index, settings.nv_size);
    let raw = with_nv_auth(tpm, settings.nv_policy, prompt, |tpm, auth| {
        tpm.nv_read_value(index, 0, size, auth)
    })?;
    let blob = StoredData::from_bytes(&raw)?;
    debug!("sealed blob read from NV index {:#x}", index);

    let data_auth = ask_auth(prompt, "passPhraseAuthData")?;
    let srk_auth = ask_auth(prompt, "srkAuthData")?;

    let mut parent = tpm.oiap()?;
    let mut entity = tpm.oiap()?;
    parent.set_continue(false);
    entity.set_continue(false);
    let unsealed = tpm.unseal(
        KH_SRK,
        &blob,
        (&mut parent, &srk_auth),
        (&mut entity, &data_auth),
    )?;
    info!("passphrase unsealed");
    Ok(unsealed)
}

/// Unseals the passphrase at `settings.locality`, releases the locality and
/// joins the passphrase with the operator's countersign.
pub fn assemble<R: Registers>(
    tis: &mut Tis<R>,
    settings: &Settings,
    prompt: &mut dyn Prompt,
) -> Result<WorkingSecret> {
    let unsealed = {
        let mut tpm = Tpm::new(tis.access(settings.locality, false)?);
        tpm.startup_clear()?;
        let unsealed = unseal_passphrase(&mut tpm, settings, prompt)?;
        tpm.into_inner().release()?;
        unsealed
    };
    let passphrase = match unsealed.split_last() {
        Some((_, passphrase)) => passphrase,
        None => return Err(SecretError::EmptyUnsealed),
    };

    if settings.show_passphrase {
        let message = Zeroizing::new(format!(
            "Passphrase: {}\n\n{}\n",
            String::from_utf8_lossy(passphrase),
            CONFIRMATION
        ));
        prompt
            .show(&message)
            .map_err(|source| SecretError::Prompt {
                what: "confirmation",
                source,
            })?;
    }

    let countersign = ask(prompt, "countersign", MAX_COUNTERSIGN)?;
    WorkingSecret::combine(&unsealed, countersign.as_bytes())
}

/// Seals a new passphrase to the current PCRs and stores it in NV.
///
/// Taking ownership and creating the SRK must already have happened.
pub fn seal_passphrase<R: Registers>(
    tis: &mut Tis<R>,
    settings: &Settings,
    prompt: &mut dyn Prompt,
) -> Result<StoredData> {
    let passphrase = ask(prompt, "passphrase", MAX_PASSPHRASE)?;
    let data_auth = ask_auth(prompt, "passPhraseAuthData")?;
    let srk_auth = ask_auth(prompt, "srkAuthData")?;

    let mut tpm = Tpm::new(tis.access(settings.locality, false)?);
    tpm.startup_clear()?;
    let values = tpm.pcr_values(&settings.pcrs)?;
    let digest = settings.pcrs.composite_hash(&values)?;
    let pcr_info = PcrInfoLong::bound_to(settings.pcrs, digest, settings.locality);

    // Sealed with its terminator, which the unseal side strips again.
    let mut data = Zeroizing::new(passphrase.as_bytes().to_vec());
    data.push(0);

    let mut osap = tpm.osap(EntityType::KeyHandle, KH_SRK, &srk_auth)?;
    osap.session.set_continue(false);
    let blob = tpm.seal(KH_SRK, &mut osap, &data_auth, &pcr_info.to_bytes(), &data)?;
    let padded = blob.to_padded(settings.nv_size as usize)?;

    let index = settings.nv_index;
    with_nv_auth(&mut tpm, settings.nv_policy, prompt, |tpm, auth| {
        tpm.nv_write_value(index, 0, &padded, auth)
    })?;
    tpm.into_inner().release()?;
    info!(
        "passphrase sealed to {} and stored at NV index {:#x}",
        settings.pcrs, index
    );
    Ok(blob)
}
