use crate::config::Config;
use crate::luks::header::LuksHeader;
use crate::secret::{self, Settings, TerminalPrompt};
use crate::tis::mmio::DevMem;
use crate::tis::Tis;
use crate::tpm::pcr::{parse_pcr_selection_list, PcrSelection};
use crate::tpm::Tpm;
use crate::unlock;
use clap::{Parser, Subcommand};
use eyre::Result;
use log::warn;
use std::fs::File;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const CONFIG_ENV_VAR: &str = "TPM_COUNTERSIGN_CONFIG";
const TIS_BASE_ENV_VAR: &str = "TPM_COUNTERSIGN_TIS_BASE";
const LOCALITY_ENV_VAR: &str = "TPM_COUNTERSIGN_LOCALITY";
const PCRS_ENV_VAR: &str = "TPM_COUNTERSIGN_PCRS";

fn parse_address(address: &str) -> Result<u64, std::num::ParseIntError> {
    match address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => address.parse(),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Physical address of the TIS register window
    #[arg(long, value_name = "ADDRESS", env = TIS_BASE_ENV_VAR, value_parser = parse_address)]
    tis_base: Option<u64>,

    /// Locality the TPM is driven from
    #[arg(short, long, env = LOCALITY_ENV_VAR, value_parser = clap::value_parser!(u8).range(0..=4))]
    locality: Option<u8>,

    /// PCRs to use for sealing/unsealing
    #[arg(short, long, value_name = "PCR List", env = PCRS_ENV_VAR, value_parser = parse_pcr_selection_list)]
    pcrs: Option<PcrSelection>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Unseal the passphrase, ask for the countersign and recover the master key
    Unlock {
        /// LUKS device or image, e.g. `/dev/sda2`
        #[arg(value_name = "device")]
        device: PathBuf,
        /// Only accept a volume with this UUID
        #[arg(short, long)]
        uuid: Option<String>,
        /// Write the raw master key here instead of printing it as hex
        #[arg(short, long, value_name = "FILE")]
        key_file: Option<PathBuf>,
    },
    /// Seal a passphrase to the current PCRs and store it in NV
    Seal,
    /// Show PCR values and their composite digest for the current running system
    Digest,
    /// Show which TPM is behind the TIS window
    Probe,
    /// Show the cipher and active keyslots of a LUKS header
    Inspect {
        /// LUKS device or image, e.g. `/dev/sda2`
        #[arg(value_name = "device")]
        device: PathBuf,
    },
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        match &self.command {
            Commands::Unlock {
                device,
                uuid,
                key_file,
            } => self.unlock(device, uuid.as_deref(), key_file.as_deref())?,
            Commands::Seal => self.seal()?,
            Commands::Digest => self.show_pcr_digest()?,
            Commands::Probe => self.probe()?,
            Commands::Inspect { device } => inspect(device)?,
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(base) = self.tis_base {
            config.tis_base = base;
        }
        if let Some(locality) = self.locality {
            config.locality = locality;
        }
        if let Some(pcrs) = self.pcrs {
            config.pcrs = pcrs.to_string();
        }
        Ok(config)
    }

    fn settings(&self) -> Result<(Config, Settings)> {
        let config = self.config()?;
        let settings = config.secret_settings()?;
        Ok((config, settings))
    }

    fn unlock(
        &self,
        device: &Path,
        uuid: Option<&str>,
        key_file: Option<&Path>,
    ) -> Result<()> {
        let (config, settings) = self.settings()?;
        let mut volume = File::open(device)?;
        let mut tis = open_tis(&config)?;
        let result = unlock::unlock(&mut tis, &mut volume, &settings, uuid, &mut TerminalPrompt);
        if let Err(e) = tis.deactivate_all() {
            warn!("failed to relinquish TPM localities: {e}");
        }
        let key = match result {
            Err(e) if e.is_wrong_secret() => {
                eprintln!("Access denied: check the passphrase, countersign and SRK secret.");
                return Err(e.into());
            }
            result => result?,
        };
        match key_file {
            Some(path) => unlock::write_key_file(path, &key)?,
            None => {
                let encoded = Zeroizing::new(hex::encode(key.as_bytes()));
                println!("{}", encoded.as_str());
            }
        }
        Ok(())
    }

    fn seal(&self) -> Result<()> {
        let (config, settings) = self.settings()?;
        let mut tis = open_tis(&config)?;
        let blob = secret::seal_passphrase(&mut tis, &settings, &mut TerminalPrompt)?;
        println!(
            "Sealed {} bytes to {} at NV index {:#x}",
            blob.to_bytes().len(),
            settings.pcrs,
            settings.nv_index
        );
        Ok(())
    }

    fn show_pcr_digest(&self) -> Result<()> {
        let (config, settings) = self.settings()?;
        let mut tis = open_tis(&config)?;
        let mut tpm = Tpm::new(tis.access(settings.locality, false)?);
        let values = tpm.pcr_values(&settings.pcrs)?;
        tpm.into_inner().release()?;
        for (index, value) in settings.pcrs.indices().zip(&values) {
            println!("PCR{index:02}: {}", hex::encode(value));
        }
        println!(
            "Current PCR Digest: {}",
            hex::encode(settings.pcrs.composite_hash(&values)?)
        );
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        let config = self.config()?;
        let tis = open_tis(&config)?;
        let identity = tis.identity();
        println!(
            "{} TPM (DID_VID {:#010x}, revision {})",
            identity.vendor, identity.did_vid, identity.revision
        );
        Ok(())
    }
}

fn open_tis(config: &Config) -> Result<Tis<DevMem>> {
    let regs = DevMem::open(config.tis_base)?;
    let tis = Tis::init(regs, config.poll.into(), config.access_poll.into())?;
    log::debug!("TIS ready at {:#x}", config.tis_base);
    Ok(tis)
}

fn inspect(device: &Path) -> Result<()> {
    let mut volume = File::open(device)?;
    let header = LuksHeader::read(&mut volume)?;
    println!("UUID:           {}", header.uuid);
    println!("Cipher:         {}", header.cipher_spec()?);
    println!("Hash:           {}", header.hash()?);
    println!("Key size:       {} bits", header.key_bytes * 8);
    println!("Payload offset: {}", header.payload_offset);
    for (slot, keyslot) in header.active_keyslots() {
        println!(
            "Keyslot {slot}: {} iterations, {} stripes, material at sector {}",
            keyslot.iterations, keyslot.stripes, keyslot.key_material_offset
        );
    }
    Ok(())
}
