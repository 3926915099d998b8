//! OIAP and OSAP authorisation sessions.
//!
//! Every authorised command carries, per session, a fresh odd nonce and
//! `HMAC-SHA1(key, paramDigest || nonceEven || nonceOdd || continue)`.
//! The TPM answers with a new even nonce and an HMAC over the output
//! parameters which is checked before any output is trusted.

use super::wire::{Reader, Writer};
use super::{Result, TpmError};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest as _, Sha1};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DIGEST_SIZE: usize = 20;
pub type Digest = [u8; DIGEST_SIZE];
pub type Nonce = [u8; DIGEST_SIZE];

pub(crate) fn sha1(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub(crate) fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Digest {
    let mut mac = match Hmac::<Sha1>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// A 20-byte TPM authorisation secret.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuthData([u8; DIGEST_SIZE]);

impl AuthData {
    /// The SHA-1 of a typed passphrase, as TPM tooling derives it.
    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        Self(sha1(&[passphrase]))
    }

    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// All zeros, used by objects created without a secret.
    pub fn well_known() -> Self {
        Self([0; DIGEST_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthData(..)")
    }
}

/// Where odd nonces come from.
pub trait NonceSource {
    fn nonce(&mut self) -> Result<Nonce>;
}

/// Odd nonces from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsNonces;

impl NonceSource for OsNonces {
    fn nonce(&mut self) -> Result<Nonce> {
        let mut nonce = [0u8; DIGEST_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| TpmError::Entropy(e.to_string()))?;
        Ok(nonce)
    }
}

/// `HMAC(entityAuth, nonceEvenOSAP || nonceOddOSAP)`
pub(crate) fn shared_secret(entity_auth: &AuthData, even: &Nonce, odd: &Nonce) -> AuthData {
    AuthData(hmac_sha1(entity_auth.as_bytes(), &[even, odd]))
}

/// Encrypts a new object secret for transport inside an OSAP session.
pub(crate) fn enc_auth(new_auth: &AuthData, shared: &AuthData, nonce_even: &Nonce) -> Digest {
    let pad = sha1(&[shared.as_bytes(), nonce_even]);
    let mut out = [0u8; DIGEST_SIZE];
    for (o, (a, p)) in out.iter_mut().zip(new_auth.as_bytes().iter().zip(pad.iter())) {
        *o = a ^ p;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Oiap,
    Osap,
}

/// Authorisation trailer for one session of an outgoing command.
#[derive(Debug, Clone)]
pub struct AuthBlock {
    pub handle: u32,
    pub nonce_odd: Nonce,
    pub continue_session: bool,
    pub auth: Digest,
}

impl AuthBlock {
    pub fn write(&self, writer: Writer) -> Writer {
        writer
            .u32(self.handle)
            .bytes(&self.nonce_odd)
            .u8(self.continue_session as u8)
            .bytes(&self.auth)
    }
}

/// Authorisation trailer for one session of a response.
#[derive(Debug, Clone)]
pub struct ReplyAuth {
    pub nonce_even: Nonce,
    pub continue_session: bool,
    pub auth: Digest,
}

impl ReplyAuth {
    pub fn read(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            nonce_even: reader.array()?,
            continue_session: reader.u8()? != 0,
            auth: reader.array()?,
        })
    }
}

#[derive(Debug)]
pub struct Session {
    kind: SessionKind,
    handle: u32,
    nonce_even: Nonce,
    continue_session: bool,
    sent: Vec<Nonce>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(kind: SessionKind, handle: u32, nonce_even: Nonce) -> Self {
        Self {
            kind,
            handle,
            nonce_even,
            continue_session: true,
            sent: Vec::new(),
            closed: false,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn nonce_even(&self) -> &Nonce {
        &self.nonce_even
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Whether the TPM should keep the session after the next command.
    pub fn set_continue(&mut self, continue_session: bool) {
        self.continue_session = continue_session;
    }

    pub(crate) fn authorize(
        &mut self,
        key: &AuthData,
        param_digest: &Digest,
        nonces: &mut dyn NonceSource,
    ) -> Result<AuthBlock> {
        if self.closed {
            return Err(TpmError::SessionClosed(self.handle));
        }
        let nonce_odd = nonces.nonce()?;
        if self.sent.contains(&nonce_odd) {
            return Err(TpmError::NonceReused(self.handle));
        }
        self.sent.push(nonce_odd);
        let continue_session = self.continue_session;
        let auth = hmac_sha1(
            key.as_bytes(),
            &[param_digest, &self.nonce_even, &nonce_odd, &[continue_session as u8]],
        );
        Ok(AuthBlock {
            handle: self.handle,
            nonce_odd,
            continue_session,
            auth,
        })
    }

    /// Checks the TPM's reply and rolls the even nonce forward.
    pub(crate) fn accept(
        &mut self,
        key: &AuthData,
        out_digest: &Digest,
        sent: &AuthBlock,
        reply: &ReplyAuth,
    ) -> Result<()> {
        let expected = hmac_sha1(
            key.as_bytes(),
            &[
                out_digest,
                &reply.nonce_even,
                &sent.nonce_odd,
                &[reply.continue_session as u8],
            ],
        );
        if !bool::from(expected.ct_eq(&reply.auth)) {
            self.closed = true;
            return Err(TpmError::ResponseAuth(self.handle));
        }
        self.nonce_even = reply.nonce_even;
        self.closed = !reply.continue_session;
        Ok(())
    }

    /// The TPM drops a session whenever a command using it fails.
    pub(crate) fn abandon(&mut self) {
        self.closed = true;
    }
}

/// An OSAP session bound to one entity, with the secret derived for it.
#[derive(Debug)]
pub struct OsapSession {
    pub session: Session,
    pub nonce_even_osap: Nonce,
    pub nonce_odd_osap: Nonce,
    shared_secret: AuthData,
}

impl OsapSession {
    pub(crate) fn new(
        session: Session,
        nonce_even_osap: Nonce,
        nonce_odd_osap: Nonce,
        entity_auth: &AuthData,
    ) -> Self {
        let shared_secret = shared_secret(entity_auth, &nonce_even_osap, &nonce_odd_osap);
        Self {
            session,
            nonce_even_osap,
            nonce_odd_osap,
            shared_secret,
        }
    }

    pub fn shared_secret(&self) -> &AuthData {
        &self.shared_secret
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eyre::Result;

    /// Counts upwards; optionally stuck on one value.
    pub(crate) struct CountingNonces {
        pub next: u8,
        pub stuck: bool,
    }

    impl NonceSource for CountingNonces {
        fn nonce(&mut self) -> super::Result<Nonce> {
            let nonce = [self.next; DIGEST_SIZE];
            if !self.stuck {
                self.next = self.next.wrapping_add(1);
            }
            Ok(nonce)
        }
    }

    #[test]
    fn passphrase_auth_is_sha1() {
        // SHA1("abc")
        let expected = hex::decode("a9993e364706816aba3e25717850c26c9cd0d89d").unwrap();
        assert_eq!(AuthData::from_passphrase(b"abc").as_bytes().as_slice(), expected);
        assert_eq!(format!("{:?}", AuthData::from_passphrase(b"abc")), "AuthData(..)");
    }

    #[test]
    fn hmac_matches_rfc2202() {
        // RFC 2202 test case 2
        let mac = hmac_sha1(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        assert_eq!(hex::encode(mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn authorize_then_accept() -> Result<()> {
        let key = AuthData::from_passphrase(b"srk");
        let mut nonces = CountingNonces { next: 1, stuck: false };
        let mut session = Session::new(SessionKind::Oiap, 0x0200_0000, [0xaa; DIGEST_SIZE]);
        let digest = sha1(&[b"params"]);

        let block = session.authorize(&key, &digest, &mut nonces)?;
        let expected = hmac_sha1(
            key.as_bytes(),
            &[&digest, &[0xaa; DIGEST_SIZE], &[1; DIGEST_SIZE], &[1]],
        );
        assert_eq!(block.auth, expected);

        let out_digest = sha1(&[b"out"]);
        let mut reply = ReplyAuth {
            nonce_even: [0xbb; DIGEST_SIZE],
            continue_session: false,
            auth: [0; DIGEST_SIZE],
        };
        reply.auth = hmac_sha1(
            key.as_bytes(),
            &[&out_digest, &reply.nonce_even, &block.nonce_odd, &[0]],
        );
        session.accept(&key, &out_digest, &block, &reply)?;
        assert_eq!(session.nonce_even(), &[0xbb; DIGEST_SIZE]);
        assert!(!session.is_open());
        assert!(matches!(
            session.authorize(&key, &digest, &mut nonces),
            Err(TpmError::SessionClosed(0x0200_0000))
        ));
        Ok(())
    }

    #[test]
    fn forged_reply_closes_session() -> Result<()> {
        let key = AuthData::from_passphrase(b"srk");
        let mut nonces = CountingNonces { next: 1, stuck: false };
        let mut session = Session::new(SessionKind::Oiap, 7, [0; DIGEST_SIZE]);
        let block = session.authorize(&key, &[0; DIGEST_SIZE], &mut nonces)?;
        let reply = ReplyAuth {
            nonce_even: [1; DIGEST_SIZE],
            continue_session: true,
            auth: [0x55; DIGEST_SIZE],
        };
        assert!(matches!(
            session.accept(&key, &[0; DIGEST_SIZE], &block, &reply),
            Err(TpmError::ResponseAuth(7))
        ));
        assert!(!session.is_open());
        Ok(())
    }

    #[test]
    fn repeated_odd_nonce_is_refused() -> Result<()> {
        let key = AuthData::well_known();
        let mut nonces = CountingNonces { next: 9, stuck: true };
        let mut session = Session::new(SessionKind::Oiap, 1, [0; DIGEST_SIZE]);
        session.authorize(&key, &[0; DIGEST_SIZE], &mut nonces)?;
        assert!(matches!(
            session.authorize(&key, &[0; DIGEST_SIZE], &mut nonces),
            Err(TpmError::NonceReused(1))
        ));
        Ok(())
    }

    #[test]
    fn enc_auth_is_reversible_with_shared_secret() {
        let shared = shared_secret(&AuthData::well_known(), &[1; DIGEST_SIZE], &[2; DIGEST_SIZE]);
        let blob_auth = AuthData::from_passphrase(b"passphrase");
        let enc = enc_auth(&blob_auth, &shared, &[3; DIGEST_SIZE]);
        assert_ne!(&enc, blob_auth.as_bytes());
        let decrypted = enc_auth(&AuthData::from_bytes(enc), &shared, &[3; DIGEST_SIZE]);
        assert_eq!(&decrypted, blob_auth.as_bytes());
    }

    #[test]
    fn os_nonces_differ() -> Result<()> {
        let mut nonces = OsNonces;
        assert_ne!(nonces.nonce()?, nonces.nonce()?);
        Ok(())
    }
}
