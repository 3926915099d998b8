//! TPM 1.2 commands over any [`Transport`].

use self::pcr::{PcrError, PcrSelection};
use self::session::{
    enc_auth, sha1, AuthBlock, AuthData, Digest, NonceSource, OsNonces, OsapSession, ReplyAuth,
    Session, SessionKind,
};
use self::stored::StoredData;
use self::wire::{
    tags, Ordinal, Reader, ReturnCode, Writer, RESPONSE_AUTH_SIZE, TAG_RQU_COMMAND,
};
use crate::tis::{TisError, Transport, HEADER_SIZE};
use ambassador::Delegate;
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(test)]
pub(crate) mod fake;
pub mod pcr;
pub mod session;
pub mod stored;
pub mod wire;

pub const KH_SRK: u32 = 0x4000_0000;
pub const KH_OWNER: u32 = 0x4000_0001;
const ST_CLEAR: u16 = 0x0001;
const RT_AUTH: u32 = 0x0000_0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EntityType {
    KeyHandle = 0x0001,
    Owner = 0x0002,
    Srk = 0x0004,
}

#[derive(Error, Debug)]
pub enum TpmError {
    #[error(transparent)]
    Tis(#[from] TisError),
    #[error("{ordinal:?} failed: {code}")]
    Command { ordinal: Ordinal, code: ReturnCode },
    #[error("{ordinal:?} response carries unexpected tag {tag:#06x}")]
    UnexpectedTag { ordinal: Ordinal, tag: u16 },
    #[error("response truncated, wanted {wanted} bytes with {available} left")]
    Truncated { wanted: usize, available: usize },
    #[error("{0} unexpected trailing bytes")]
    Trailing(usize),
    #[error("response authorisation failed for session {0:#010x}")]
    ResponseAuth(u32),
    #[error("odd nonce reused in session {0:#010x}")]
    NonceReused(u32),
    #[error("session {0:#010x} is closed")]
    SessionClosed(u32),
    #[error("TPM returned {actual} bytes, asked for at most {requested}")]
    Oversized { requested: usize, actual: usize },
    #[error("sealed blob has unexpected tag {0:#06x}")]
    BadStoredData(u16),
    #[error("sealed blob of {size} bytes does not fit in {capacity}")]
    BlobTooLarge { size: usize, capacity: usize },
    #[error("entropy source failed: {0}")]
    Entropy(String),
    #[error(transparent)]
    Pcr(#[from] PcrError),
}

impl TpmError {
    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            TpmError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The TPM asked for the same command to be retried later.
    pub fn is_retryable(&self) -> bool {
        self.return_code().map_or(false, ReturnCode::is_retryable)
    }
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// How an NV area is authorised.
pub enum NvAuth<'a> {
    /// No authorisation.
    Public,
    /// Owner authorisation through the plain NV ordinals.
    Owner(&'a mut Session, &'a AuthData),
    /// The area's own secret through the `*Auth` NV ordinals.
    Index(&'a mut Session, &'a AuthData),
}

impl NvAuth<'_> {
    fn read_ordinal(&self) -> Ordinal {
        match self {
            NvAuth::Index(..) => Ordinal::NvReadValueAuth,
            _ => Ordinal::NvReadValue,
        }
    }

    fn write_ordinal(&self) -> Ordinal {
        match self {
            NvAuth::Index(..) => Ordinal::NvWriteValueAuth,
            _ => Ordinal::NvWriteValue,
        }
    }
}

/// A verified authorised response.
struct Authorized {
    raw: Zeroizing<Vec<u8>>,
    params_end: usize,
}

impl Authorized {
    fn params(&self) -> Reader<'_> {
        Reader::new(&self.raw[HEADER_SIZE..self.params_end])
    }
}

/// A TPM 1.2 reachable through `T`.
#[derive(Delegate)]
#[delegate(Transport, target = "transport")]
pub struct Tpm<T: Transport> {
    transport: T,
    nonces: Box<dyn NonceSource>,
}

impl<T: Transport> Tpm<T> {
    pub fn new(transport: T) -> Self {
        Self::with_nonces(transport, Box::new(OsNonces))
    }

    pub fn with_nonces(transport: T, nonces: Box<dyn NonceSource>) -> Self {
        Self { transport, nonces }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends `request` and checks the response header.
    fn execute(
        &mut self,
        ordinal: Ordinal,
        sessions: usize,
        request: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let response = self.transmit(request)?;
        let mut reader = Reader::new(&response);
        let tag = reader.u16()?;
        let _size = reader.u32()?;
        let code = ReturnCode(reader.u32()?);
        if !code.is_success() {
            log::debug!("{:?} returned {}", ordinal, code);
            return Err(TpmError::Command { ordinal, code });
        }
        let (_, expected_tag) = tags(sessions);
        if tag != expected_tag {
            return Err(TpmError::UnexpectedTag { ordinal, tag });
        }
        Ok(response)
    }

    /// Runs a command without authorisation and returns its output parameters.
    fn execute_plain(&mut self, ordinal: Ordinal, params: &Writer) -> Result<Zeroizing<Vec<u8>>> {
        let request = Writer::command(TAG_RQU_COMMAND, ordinal)
            .bytes(params.as_bytes())
            .finish();
        let mut response = self.execute(ordinal, 0, &request)?;
        response.drain(..HEADER_SIZE);
        Ok(response)
    }

    /// Runs a command under one or two sessions.
    ///
    /// `handles` are not covered by the parameter digest; `params` are.
    /// Every session is closed if the TPM rejects the command or any reply
    /// fails to verify.
    fn execute_authorized(
        &mut self,
        ordinal: Ordinal,
        handles: &[u32],
        params: &Writer,
        sessions: &mut [(&mut Session, &AuthData)],
    ) -> Result<Authorized> {
        let param_digest = sha1(&[&ordinal.code().to_be_bytes(), params.as_bytes()]);
        let mut blocks: Vec<AuthBlock> = Vec::with_capacity(sessions.len());
        for (session, key) in sessions.iter_mut() {
            blocks.push(session.authorize(key, &param_digest, self.nonces.as_mut())?);
        }

        let (tag, _) = tags(sessions.len());
        let mut request = Writer::command(tag, ordinal);
        for handle in handles {
            request = request.u32(*handle);
        }
        request = request.bytes(params.as_bytes());
        for block in &blocks {
            request = block.write(request);
        }
        let request = request.finish();

        let raw = match self.execute(ordinal, sessions.len(), &request) {
            Ok(raw) => raw,
            Err(e) => {
                for (session, _) in sessions.iter_mut() {
                    session.abandon();
                }
                return Err(e);
            }
        };

        let params_end = match verify_replies(ordinal, &raw, sessions, &blocks) {
            Ok(params_end) => params_end,
            Err(e) => {
                for (session, _) in sessions.iter_mut() {
                    session.abandon();
                }
                return Err(e);
            }
        };
        Ok(Authorized { raw, params_end })
    }

    /// `TPM_Startup(ST_CLEAR)`; an already started TPM is fine.
    pub fn startup_clear(&mut self) -> Result<()> {
        match self.execute_plain(Ordinal::Startup, &Writer::new().u16(ST_CLEAR)) {
            Err(TpmError::Command {
                code: ReturnCode::INVALID_POSTINIT,
                ..
            }) => {
                log::debug!("TPM already started");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    pub fn get_random(&mut self, count: u32) -> Result<Zeroizing<Vec<u8>>> {
        let response = self.execute_plain(Ordinal::GetRandom, &Writer::new().u32(count))?;
        let mut reader = Reader::new(&response);
        let bytes = reader.sized()?;
        if bytes.len() > count as usize {
            return Err(TpmError::Oversized {
                requested: count as usize,
                actual: bytes.len(),
            });
        }
        Ok(Zeroizing::new(bytes.to_vec()))
    }

    pub fn pcr_read(&mut self, index: u32) -> Result<Digest> {
        let response = self.execute_plain(Ordinal::PcrRead, &Writer::new().u32(index))?;
        Reader::new(&response).array()
    }

    /// Extends PCR `index` and returns its new value.
    pub fn extend(&mut self, index: u32, digest: &Digest) -> Result<Digest> {
        let params = Writer::new().u32(index).bytes(digest);
        let response = self.execute_plain(Ordinal::Extend, &params)?;
        Reader::new(&response).array()
    }

    /// Current values of every PCR in `selection`, in index order.
    pub fn pcr_values(&mut self, selection: &PcrSelection) -> Result<Vec<Digest>> {
        selection.indices().map(|i| self.pcr_read(i)).collect()
    }

    pub fn oiap(&mut self) -> Result<Session> {
        let response = self.execute_plain(Ordinal::Oiap, &Writer::new())?;
        let mut reader = Reader::new(&response);
        let handle = reader.u32()?;
        let nonce_even = reader.array()?;
        log::debug!("OIAP session {:#010x}", handle);
        Ok(Session::new(SessionKind::Oiap, handle, nonce_even))
    }

    /// Opens an OSAP session for `entity` and derives its shared secret.
    pub fn osap(
        &mut self,
        entity_type: EntityType,
        entity: u32,
        entity_auth: &AuthData,
    ) -> Result<OsapSession> {
        let nonce_odd_osap = self.nonces.nonce()?;
        let params = Writer::new()
            .u16(entity_type as u16)
            .u32(entity)
            .bytes(&nonce_odd_osap);
        let response = self.execute_plain(Ordinal::Osap, &params)?;
        let mut reader = Reader::new(&response);
        let handle = reader.u32()?;
        let nonce_even = reader.array()?;
        let nonce_even_osap = reader.array()?;
        log::debug!("OSAP session {:#010x} for entity {:#010x}", handle, entity);
        Ok(OsapSession::new(
            Session::new(SessionKind::Osap, handle, nonce_even),
            nonce_even_osap,
            nonce_odd_osap,
            entity_auth,
        ))
    }

    /// Drops a session the TPM still holds.
    pub fn flush(&mut self, session: Session) -> Result<()> {
        if !session.is_open() {
            return Ok(());
        }
        let params = Writer::new().u32(session.handle()).u32(RT_AUTH);
        self.execute_plain(Ordinal::FlushSpecific, &params)?;
        Ok(())
    }

    /// Seals `data` under `key_handle` to `pcr_info`, protected by `blob_auth`.
    pub fn seal(
        &mut self,
        key_handle: u32,
        osap: &mut OsapSession,
        blob_auth: &AuthData,
        pcr_info: &[u8],
        data: &[u8],
    ) -> Result<StoredData> {
        let enc = enc_auth(blob_auth, osap.shared_secret(), osap.session.nonce_even());
        let params = Writer::new().bytes(&enc).sized(pcr_info).sized(data);
        let shared = osap.shared_secret().clone();
        let response = self.execute_authorized(
            Ordinal::Seal,
            &[key_handle],
            &params,
            &mut [(&mut osap.session, &shared)],
        )?;
        let mut reader = response.params();
        let stored = StoredData::read(&mut reader)?;
        reader.finish()?;
        Ok(stored)
    }

    /// Unseals `blob` with the parent key's secret and the blob's own secret.
    pub fn unseal(
        &mut self,
        parent_handle: u32,
        blob: &StoredData,
        parent: (&mut Session, &AuthData),
        data: (&mut Session, &AuthData),
    ) -> Result<Zeroizing<Vec<u8>>> {
        let params = blob.write(Writer::new());
        let response = self.execute_authorized(
            Ordinal::Unseal,
            &[parent_handle],
            &params,
            &mut [parent, data],
        )?;
        let mut reader = response.params();
        let secret = Zeroizing::new(reader.sized()?.to_vec());
        reader.finish()?;
        Ok(secret)
    }

    pub fn nv_read_value(
        &mut self,
        index: u32,
        offset: u32,
        size: u32,
        auth: NvAuth<'_>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let params = Writer::new().u32(index).u32(offset).u32(size);
        let ordinal = auth.read_ordinal();
        let data = match auth {
            NvAuth::Public => {
                let response = self.execute_plain(ordinal, &params)?;
                let mut reader = Reader::new(&response);
                Zeroizing::new(reader.sized()?.to_vec())
            }
            NvAuth::Owner(session, key) | NvAuth::Index(session, key) => {
                let response =
                    self.execute_authorized(ordinal, &[], &params, &mut [(session, key)])?;
                let mut reader = response.params();
                Zeroizing::new(reader.sized()?.to_vec())
            }
        };
        if data.len() > size as usize {
            return Err(TpmError::Oversized {
                requested: size as usize,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    pub fn nv_write_value(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        auth: NvAuth<'_>,
    ) -> Result<()> {
        let params = Writer::new().u32(index).u32(offset).sized(data);
        let ordinal = auth.write_ordinal();
        match auth {
            NvAuth::Public => {
                self.execute_plain(ordinal, &params)?;
            }
            NvAuth::Owner(session, key) | NvAuth::Index(session, key) => {
                self.execute_authorized(ordinal, &[], &params, &mut [(session, key)])?;
            }
        }
        Ok(())
    }
}

/// Checks every response trailer against its session and returns where the
/// output parameters end.
fn verify_replies(
    ordinal: Ordinal,
    raw: &[u8],
    sessions: &mut [(&mut Session, &AuthData)],
    blocks: &[AuthBlock],
) -> Result<usize> {
    let trailer = RESPONSE_AUTH_SIZE * sessions.len();
    let params_end = raw
        .len()
        .checked_sub(trailer)
        .filter(|end| *end >= HEADER_SIZE)
        .ok_or(TpmError::Truncated {
            wanted: HEADER_SIZE + trailer,
            available: raw.len(),
        })?;
    let out_digest = sha1(&[
        &raw[6..HEADER_SIZE],
        &ordinal.code().to_be_bytes(),
        &raw[HEADER_SIZE..params_end],
    ]);
    let mut replies = Reader::new(&raw[params_end..]);
    for ((session, key), block) in sessions.iter_mut().zip(blocks) {
        let reply = ReplyAuth::read(&mut replies)?;
        session.accept(key, &out_digest, block, &reply)?;
    }
    Ok(params_end)
}
