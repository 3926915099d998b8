//! In-memory TPM 1.2 that checks authorisation the way a real part does.

use super::pcr::{PcrInfoLong, PCR_COUNT};
use super::session::{hmac_sha1, sha1, AuthData, Digest, Nonce, DIGEST_SIZE};
use super::stored::StoredData;
use super::wire::{
    tags, Ordinal, Reader, ReturnCode, Writer, REQUEST_AUTH_SIZE, TAG_RQU_AUTH1_COMMAND,
    TAG_RQU_AUTH2_COMMAND, TAG_RQU_COMMAND, TAG_RSP_COMMAND,
};
use super::{TpmError, KH_OWNER, KH_SRK};
use crate::tis::{Locality, TisError, Transport, HEADER_SIZE};
use std::collections::HashMap;
use zeroize::Zeroizing;

const BAD_ORDINAL: ReturnCode = ReturnCode(0x0a);
const INVALID_KEYHANDLE: ReturnCode = ReturnCode(0x0c);
const DECRYPT_ERROR: ReturnCode = ReturnCode(0x21);

impl From<TpmError> for ReturnCode {
    fn from(_: TpmError) -> Self {
        ReturnCode::BAD_PARAMETER
    }
}

type Outcome<T> = core::result::Result<T, ReturnCode>;

struct FakeSession {
    nonce_even: Nonce,
    shared: Option<AuthData>,
}

struct Sealed {
    blob_auth: AuthData,
    pcr_info: Vec<u8>,
    data: Vec<u8>,
}

struct RequestAuth {
    handle: u32,
    nonce_odd: Nonce,
    continue_session: bool,
    auth: Digest,
}

pub(crate) struct FakeTpm {
    pub srk_auth: AuthData,
    pub owner_auth: AuthData,
    pub nv_auth: AuthData,
    pub pcrs: Vec<Digest>,
    pub nv: HashMap<u32, Vec<u8>>,
    /// Locality commands are assumed to arrive from.
    pub locality: Locality,
    pub corrupt_response_auth: bool,
    /// Answer this many commands with TPM_RETRY first.
    pub busy: u32,
    pub ordinals: Vec<Ordinal>,
    pub odd_nonces: Vec<Nonce>,
    started: bool,
    sessions: HashMap<u32, FakeSession>,
    sealed: Vec<Sealed>,
    next_handle: u32,
    counter: u32,
}

impl Default for FakeTpm {
    fn default() -> Self {
        let mut nv = HashMap::new();
        nv.insert(4, vec![0; 400]);
        Self {
            srk_auth: AuthData::from_passphrase(b"srk"),
            owner_auth: AuthData::from_passphrase(b"owner"),
            nv_auth: AuthData::from_passphrase(b"nv"),
            pcrs: (0..PCR_COUNT).map(|i| [i as u8; DIGEST_SIZE]).collect(),
            nv,
            locality: Locality::Two,
            corrupt_response_auth: false,
            busy: 0,
            ordinals: Vec::new(),
            odd_nonces: Vec::new(),
            started: false,
            sessions: HashMap::new(),
            sealed: Vec::new(),
            next_handle: 0x0200_0000,
            counter: 0,
        }
    }
}

impl FakeTpm {
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(code) => {
                let response = Writer::new().u16(TAG_RSP_COMMAND).u32(0).u32(code.0);
                response.finish().to_vec()
            }
        }
    }

    fn fresh(&mut self) -> Nonce {
        self.counter += 1;
        sha1(&[b"fake nonce", &self.counter.to_be_bytes()])
    }

    fn dispatch(&mut self, request: &[u8]) -> Outcome<Vec<u8>> {
        let mut reader = Reader::new(request);
        let tag = reader.u16()?;
        let _size = reader.u32()?;
        let ordinal = Ordinal::from_code(reader.u32()?).ok_or(BAD_ORDINAL)?;
        self.ordinals.push(ordinal);
        if self.busy > 0 {
            self.busy -= 1;
            return Err(ReturnCode::RETRY);
        }

        let sessions = match tag {
            TAG_RQU_COMMAND => 0,
            TAG_RQU_AUTH1_COMMAND => 1,
            TAG_RQU_AUTH2_COMMAND => 2,
            _ => return Err(ReturnCode::BADTAG),
        };
        let handles = match ordinal {
            Ordinal::Seal | Ordinal::Unseal => 1,
            _ => 0,
        };
        let body_end = request
            .len()
            .checked_sub(sessions * REQUEST_AUTH_SIZE)
            .filter(|end| *end >= HEADER_SIZE + 4 * handles)
            .ok_or(ReturnCode::BAD_PARAMETER)?;
        let mut handle_reader = Reader::new(&request[HEADER_SIZE..HEADER_SIZE + 4 * handles]);
        let handle = if handles == 1 { Some(handle_reader.u32()?) } else { None };
        let params = &request[HEADER_SIZE + 4 * handles..body_end];

        let mut trailer = Reader::new(&request[body_end..]);
        let mut auths = Vec::with_capacity(sessions);
        for _ in 0..sessions {
            auths.push(RequestAuth {
                handle: trailer.u32()?,
                nonce_odd: trailer.array()?,
                continue_session: trailer.u8()? != 0,
                auth: trailer.array()?,
            });
        }
        let param_digest = sha1(&[&ordinal.code().to_be_bytes(), params]);

        let mut params = Reader::new(params);
        match ordinal {
            Ordinal::Startup => {
                if self.started {
                    return Err(ReturnCode::INVALID_POSTINIT);
                }
                self.started = true;
                self.reply(ordinal, Vec::new(), &[])
            }
            Ordinal::GetRandom => {
                let count = params.u32()?;
                let bytes: Vec<u8> = (0..count).map(|i| (i as u8) ^ 0x5a).collect();
                self.reply(ordinal, Writer::new().sized(&bytes).as_bytes().to_vec(), &[])
            }
            Ordinal::PcrRead => {
                let index = params.u32()? as usize;
                let value = *self.pcrs.get(index).ok_or(ReturnCode::BADINDEX)?;
                self.reply(ordinal, value.to_vec(), &[])
            }
            Ordinal::Extend => {
                let index = params.u32()? as usize;
                let digest: Digest = params.array()?;
                let pcr = self.pcrs.get_mut(index).ok_or(ReturnCode::BADINDEX)?;
                *pcr = sha1(&[pcr.as_slice(), &digest]);
                let value = *pcr;
                self.reply(ordinal, value.to_vec(), &[])
            }
            Ordinal::Oiap => {
                let handle = self.open(None);
                let nonce_even = self.sessions[&handle].nonce_even;
                let out = Writer::new().u32(handle).bytes(&nonce_even);
                self.reply(ordinal, out.as_bytes().to_vec(), &[])
            }
            Ordinal::Osap => {
                let _entity_type = params.u16()?;
                let entity = params.u32()?;
                let nonce_odd_osap: Nonce = params.array()?;
                let entity_auth = match entity {
                    KH_SRK => self.srk_auth.clone(),
                    KH_OWNER => self.owner_auth.clone(),
                    _ => return Err(INVALID_KEYHANDLE),
                };
                let nonce_even_osap = self.fresh();
                let shared = AuthData::from_bytes(hmac_sha1(
                    entity_auth.as_bytes(),
                    &[&nonce_even_osap, &nonce_odd_osap],
                ));
                let handle = self.open(Some(shared));
                let nonce_even = self.sessions[&handle].nonce_even;
                let out = Writer::new()
                    .u32(handle)
                    .bytes(&nonce_even)
                    .bytes(&nonce_even_osap);
                self.reply(ordinal, out.as_bytes().to_vec(), &[])
            }
            Ordinal::FlushSpecific => {
                let handle = params.u32()?;
                self.sessions
                    .remove(&handle)
                    .ok_or(ReturnCode::INVALID_AUTHHANDLE)?;
                self.reply(ordinal, Vec::new(), &[])
            }
            Ordinal::Seal => {
                if sessions != 1 {
                    return Err(ReturnCode::BADTAG);
                }
                if handle != Some(KH_SRK) {
                    return Err(INVALID_KEYHANDLE);
                }
                let enc: Digest = params.array()?;
                let pcr_info = params.sized()?.to_vec();
                let data = params.sized()?.to_vec();
                let session = self
                    .sessions
                    .get(&auths[0].handle)
                    .ok_or(ReturnCode::INVALID_AUTHHANDLE)?;
                let shared = session.shared.clone().ok_or(ReturnCode::AUTHFAIL)?;
                let pad = sha1(&[shared.as_bytes(), &session.nonce_even]);
                self.verify(&auths[0], &shared, &param_digest, ReturnCode::AUTHFAIL)?;

                let mut blob_auth = [0u8; DIGEST_SIZE];
                for (b, (e, p)) in blob_auth.iter_mut().zip(enc.iter().zip(pad.iter())) {
                    *b = e ^ p;
                }
                let mut enc_data = (self.sealed.len() as u32).to_be_bytes().to_vec();
                enc_data.resize(64, 0xee);
                self.sealed.push(Sealed {
                    blob_auth: AuthData::from_bytes(blob_auth),
                    pcr_info: pcr_info.clone(),
                    data,
                });
                let stored = StoredData {
                    entity_type: 0,
                    seal_info: pcr_info,
                    enc_data,
                };
                self.reply(ordinal, stored.to_bytes(), &[(&auths[0], shared)])
            }
            Ordinal::Unseal => {
                if sessions != 2 {
                    return Err(ReturnCode::BADTAG);
                }
                if handle != Some(KH_SRK) {
                    return Err(INVALID_KEYHANDLE);
                }
                let stored = StoredData::read(&mut params)?;
                let slot = Reader::new(&stored.enc_data).u32()? as usize;
                let (blob_auth, pcr_info, data) = {
                    let sealed = self.sealed.get(slot).ok_or(DECRYPT_ERROR)?;
                    (sealed.blob_auth.clone(), sealed.pcr_info.clone(), sealed.data.clone())
                };
                let srk_auth = self.srk_auth.clone();
                self.verify(&auths[0], &srk_auth, &param_digest, ReturnCode::AUTHFAIL)?;
                self.verify(&auths[1], &blob_auth, &param_digest, ReturnCode::AUTH2FAIL)?;
                if !pcr_info.is_empty() {
                    self.check_pcrs(&pcr_info)?;
                }
                let out = Writer::new().sized(&data).as_bytes().to_vec();
                self.reply(ordinal, out, &[(&auths[0], srk_auth), (&auths[1], blob_auth)])
            }
            Ordinal::NvReadValue | Ordinal::NvReadValueAuth => {
                let index = params.u32()?;
                let offset = params.u32()? as usize;
                let size = params.u32()? as usize;
                let key = self.nv_key(ordinal, sessions)?;
                if let Some(key) = &key {
                    self.verify(&auths[0], key, &param_digest, ReturnCode::AUTHFAIL)?;
                }
                let area = self.nv.get(&index).ok_or(ReturnCode::BADINDEX)?;
                let data = area.get(offset..offset + size).ok_or(ReturnCode::NOSPACE)?;
                let out = Writer::new().sized(data).as_bytes().to_vec();
                match key {
                    Some(key) => self.reply(ordinal, out, &[(&auths[0], key)]),
                    None => self.reply(ordinal, out, &[]),
                }
            }
            Ordinal::NvWriteValue | Ordinal::NvWriteValueAuth => {
                let index = params.u32()?;
                let offset = params.u32()? as usize;
                let data = params.sized()?.to_vec();
                let key = self.nv_key(ordinal, sessions)?;
                if let Some(key) = &key {
                    self.verify(&auths[0], key, &param_digest, ReturnCode::AUTHFAIL)?;
                }
                let area = self.nv.get_mut(&index).ok_or(ReturnCode::BADINDEX)?;
                area.get_mut(offset..offset + data.len())
                    .ok_or(ReturnCode::NOSPACE)?
                    .copy_from_slice(&data);
                match key {
                    Some(key) => self.reply(ordinal, Vec::new(), &[(&auths[0], key)]),
                    None => self.reply(ordinal, Vec::new(), &[]),
                }
            }
        }
    }

    fn nv_key(&self, ordinal: Ordinal, sessions: usize) -> Outcome<Option<AuthData>> {
        match (ordinal, sessions) {
            (Ordinal::NvReadValue | Ordinal::NvWriteValue, 0) => Ok(None),
            (Ordinal::NvReadValue | Ordinal::NvWriteValue, 1) => Ok(Some(self.owner_auth.clone())),
            (Ordinal::NvReadValueAuth | Ordinal::NvWriteValueAuth, 1) => {
                Ok(Some(self.nv_auth.clone()))
            }
            _ => Err(ReturnCode::BADTAG),
        }
    }

    fn open(&mut self, shared: Option<AuthData>) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        let nonce_even = self.fresh();
        self.sessions.insert(handle, FakeSession { nonce_even, shared });
        handle
    }

    fn verify(
        &mut self,
        block: &RequestAuth,
        key: &AuthData,
        param_digest: &Digest,
        failure: ReturnCode,
    ) -> Outcome<()> {
        self.odd_nonces.push(block.nonce_odd);
        let session = self
            .sessions
            .get(&block.handle)
            .ok_or(ReturnCode::INVALID_AUTHHANDLE)?;
        let expected = hmac_sha1(
            key.as_bytes(),
            &[
                param_digest,
                &session.nonce_even,
                &block.nonce_odd,
                &[block.continue_session as u8],
            ],
        );
        if expected != block.auth {
            self.sessions.remove(&block.handle);
            return Err(failure);
        }
        Ok(())
    }

    fn check_pcrs(&self, pcr_info: &[u8]) -> Outcome<()> {
        let info = PcrInfoLong::from_bytes(pcr_info)?;
        if info.locality_at_release & self.locality.selection_bit() == 0 {
            return Err(ReturnCode::BAD_LOCALITY);
        }
        let values: Vec<Digest> = info
            .release_selection
            .indices()
            .map(|i| self.pcrs[i as usize])
            .collect();
        let composite = info
            .release_selection
            .composite_hash(&values)
            .map_err(|_| ReturnCode::BAD_PARAMETER)?;
        if composite != info.digest_at_release {
            return Err(ReturnCode::WRONGPCRVAL);
        }
        Ok(())
    }

    fn reply(
        &mut self,
        ordinal: Ordinal,
        out: Vec<u8>,
        auths: &[(&RequestAuth, AuthData)],
    ) -> Outcome<Vec<u8>> {
        let out_digest = sha1(&[&0u32.to_be_bytes(), &ordinal.code().to_be_bytes(), &out]);
        let (_, tag) = tags(auths.len());
        let mut response = Writer::new().u16(tag).u32(0).u32(0).bytes(&out);
        for (block, key) in auths {
            let nonce_even = self.fresh();
            let mut auth = hmac_sha1(
                key.as_bytes(),
                &[
                    &out_digest,
                    &nonce_even,
                    &block.nonce_odd,
                    &[block.continue_session as u8],
                ],
            );
            if self.corrupt_response_auth {
                auth[0] ^= 0xff;
            }
            if block.continue_session {
                if let Some(session) = self.sessions.get_mut(&block.handle) {
                    session.nonce_even = nonce_even;
                }
            } else {
                self.sessions.remove(&block.handle);
            }
            response = response
                .bytes(&nonce_even)
                .u8(block.continue_session as u8)
                .bytes(&auth);
        }
        Ok(response.finish().to_vec())
    }
}

impl Transport for FakeTpm {
    fn transmit(&mut self, request: &[u8]) -> Result<Zeroizing<Vec<u8>>, TisError> {
        Ok(Zeroizing::new(self.respond(request)))
    }
}
