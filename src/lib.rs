//! # Get Started
//!
//! Recovers a LUKS1 master key from two factors: a passphrase sealed inside
//! a TPM 1.2 to the late-launch PCRs, and a countersign typed at boot.
//!
//! The TPM is driven directly through its TIS register window, so nothing
//! but `/dev/mem` is needed at runtime:
//! ```bash
//! tpm-countersign seal
//! tpm-countersign unlock /dev/sda2 --key-file /run/cryptroot.key
//! ```
//!
//! Layers, bottom up:
//! - [`tis`]: locality and FIFO handling for the memory mapped interface
//! - [`tpm`]: command marshalling with OIAP and OSAP sessions
//! - [`secret`]: unsealing the passphrase and appending the countersign
//! - [`luks`]: keyslot recovery against an on-disk header
//! - [`unlock`]: one attempt from header to master key

pub mod cli;
pub mod config;
pub mod luks;
pub mod secret;
#[macro_use]
pub mod tis;
pub mod tpm;
pub mod unlock;
