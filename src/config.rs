//! YAML configuration file.
//!
//! Every field has a default, so a missing file at the default location is
//! the same as an empty one. Command line flags override what is loaded here.

use crate::secret::{NvPolicy, Settings};
use crate::tis::{Locality, PollBudget, TisError, TIS_BASE};
use crate::tpm::pcr::{PcrError, PcrSelection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tpm-countersign.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Locality(#[from] TisError),
    #[error(transparent)]
    Pcr(#[from] PcrError),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    pub iterations: u32,
    pub delay_ms: u64,
}

impl From<PollConfig> for PollBudget {
    fn from(poll: PollConfig) -> Self {
        PollBudget::new(poll.iterations, Duration::from_millis(poll.delay_ms))
    }
}

fn default_tis_base() -> u64 {
    TIS_BASE
}

fn default_locality() -> u8 {
    2
}

fn default_poll() -> PollConfig {
    PollConfig {
        iterations: 4000,
        delay_ms: 1,
    }
}

fn default_access_poll() -> PollConfig {
    PollConfig {
        iterations: 10,
        delay_ms: 1,
    }
}

fn default_nv_index() -> u32 {
    4
}

fn default_nv_size() -> u32 {
    400
}

fn default_pcrs() -> String {
    "sha1:17,19".to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Physical address of the TIS register window.
    #[serde(default = "default_tis_base")]
    pub tis_base: u64,
    #[serde(default = "default_locality")]
    pub locality: u8,
    /// Budget for every status poll during a command.
    #[serde(default = "default_poll")]
    pub poll: PollConfig,
    /// Budget for a locality request to be granted.
    #[serde(default = "default_access_poll")]
    pub access_poll: PollConfig,
    #[serde(default = "default_nv_index")]
    pub nv_index: u32,
    #[serde(default = "default_nv_size")]
    pub nv_size: u32,
    #[serde(default)]
    pub nv_policy: NvPolicy,
    /// PCRs the passphrase is sealed to, e.g. `sha1:17,19`.
    #[serde(default = "default_pcrs")]
    pub pcrs: String,
    /// Show the unsealed passphrase before asking for the countersign.
    #[serde(default = "default_true")]
    pub show_passphrase: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tis_base: default_tis_base(),
            locality: default_locality(),
            poll: default_poll(),
            access_poll: default_access_poll(),
            nv_index: default_nv_index(),
            nv_size: default_nv_size(),
            nv_policy: NvPolicy::default(),
            pcrs: default_pcrs(),
            show_passphrase: default_true(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when none is given. Only an
    /// explicitly named file has to exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                match path.exists() {
                    true => Self::from_file(path),
                    false => Ok(Self::default()),
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        log::debug!("loaded configuration from {}", path.display());
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn locality(&self) -> Result<Locality> {
        Ok(Locality::try_from(self.locality)?)
    }

    pub fn pcr_selection(&self) -> Result<PcrSelection> {
        Ok(self.pcrs.parse()?)
    }

    pub fn secret_settings(&self) -> Result<Settings> {
        Ok(Settings {
            locality: self.locality()?,
            nv_index: self.nv_index,
            nv_size: self.nv_size,
            nv_policy: self.nv_policy,
            pcrs: self.pcr_selection()?,
            show_passphrase: self.show_passphrase,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::io::Write;

    #[test]
    fn empty_document_is_all_defaults() -> Result<()> {
        assert_eq!(Config::from_yaml("")?, Config::default());
        assert_eq!(Config::from_yaml("{}")?, Config::default());
        let settings = Config::default().secret_settings()?;
        assert_eq!(settings, Settings::default());
        assert_eq!(
            PollBudget::from(Config::default().poll),
            PollBudget::default()
        );
        Ok(())
    }

    #[test]
    fn fields_override_defaults() -> Result<()> {
        let config = Config::from_yaml(
            "tis_base: 0xfed40000\n\
             locality: 3\n\
             nv_policy: owner\n\
             pcrs: sha1:17\n\
             show_passphrase: false\n\
             poll:\n  iterations: 10\n  delay_ms: 0\n",
        )?;
        assert_eq!(config.tis_base, 0xfed4_0000);
        assert_eq!(config.locality()?, Locality::Three);
        assert_eq!(config.nv_policy, NvPolicy::Owner);
        assert!(!config.show_passphrase);
        assert_eq!(config.nv_size, 400);
        assert_eq!(
            PollBudget::from(config.poll),
            PollBudget::new(10, Duration::ZERO)
        );
        assert_eq!(config.pcr_selection()?.to_string(), "sha1:17");
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_yaml("nv_idx: 5\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_yaml("nv_policy: everyone\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_values_surface_on_use() -> Result<()> {
        let config = Config::from_yaml("locality: 7\npcrs: sha256:1\n")?;
        assert!(matches!(
            config.locality(),
            Err(ConfigError::Locality(TisError::InvalidLocality(7)))
        ));
        assert!(matches!(
            config.pcr_selection(),
            Err(ConfigError::Pcr(PcrError::InvalidPcrBank(_)))
        ));
        Ok(())
    }

    #[test]
    fn loads_named_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "nv_index: 0x10")?;
        let config = Config::load(Some(file.path()))?;
        assert_eq!(config.nv_index, 16);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
        Ok(())
    }
}
