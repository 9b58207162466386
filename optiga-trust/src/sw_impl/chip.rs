//! APDU engine of the simulated chip.
//!
//! Data objects, key slots, session contexts and the last error code behave
//! like the chip's. Hashing and HMAC use real SHA-256; signatures, key
//! agreement and RSA encryption are stand-ins that only this engine can check,
//! built so that sign/verify, ECDH and encrypt/decrypt round trips agree.

use std::collections::HashMap;

use log::{debug, warn};
use rand::{distributions::Standard, Rng};
use sha2::{Digest, Sha256};

use super::ApduResponder;
use crate::cmd::apdu::{
    CMD_CALC_HASH, CMD_CALC_SIGN, CMD_CALC_SSEC, CMD_CLOSE_APPLICATION, CMD_DECRYPT_ASYM,
    CMD_DECRYPT_SYM, CMD_DERIVE_KEY, CMD_ENCRYPT_ASYM, CMD_ENCRYPT_SYM, CMD_GEN_KEYPAIR,
    CMD_GEN_SYMKEY, CMD_GET_DATA_OBJECT, CMD_GET_DATA_OBJECT_NO_CLEAR, CMD_GET_RANDOM,
    CMD_OPEN_APPLICATION, CMD_SET_DATA_OBJECT, CMD_SET_OBJECT_PROTECTED, CMD_VERIFY_SIGN,
    TLV_HEADER_SIZE,
};
use crate::cmd::handlers::{asym, hash, key, protected, random, sign_verify, sym};
use crate::{
    KeyAlgorithm, KeyDerivation, SymmetricMode, WriteMode, OPTIGA_APPLICATION_ID,
    OPTIGA_APP_CONTEXT_SIZE, OPTIGA_CMD_MAX_SESSIONS, OPTIGA_CMD_PARAM_HIBERNATE,
    OPTIGA_CMD_SESSION_BASE_OID, OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY, OPTIGA_LAST_ERROR_CODE_OID,
};

/// Device error codes
pub const ERR_INVALID_OID: u8 = 0x01;
pub const ERR_INVALID_PARAM: u8 = 0x03;
pub const ERR_INVALID_LENGTH: u8 = 0x04;
pub const ERR_INVALID_DATA: u8 = 0x05;
pub const ERR_ACCESS_DENIED: u8 = 0x07;
pub const ERR_INVALID_COMMAND: u8 = 0x0A;
pub const ERR_OUT_OF_SEQUENCE: u8 = 0x0B;
pub const ERR_VERIFICATION_FAILED: u8 = 0x2C;

/// Objects the host may read but not write
pub const OID_COPROCESSOR_UID: u16 = 0xE0C2;
pub const OID_LIFE_CYCLE_STATUS: u16 = 0xE0C0;
/// Device certificate, holds the public key of [`OID_DEVICE_KEY`]
pub const OID_DEVICE_CERTIFICATE: u16 = 0xE0E0;
pub const OID_DEVICE_KEY: u16 = 0xE0F0;
pub const OID_PLATFORM_BINDING_SECRET: u16 = 0xE140;
pub const OID_AES_KEY: u16 = 0xE200;

const KEY_OBJECTS: [u16; 7] = [0xE0F0, 0xE0F1, 0xE0F2, 0xE0F3, 0xE0FC, 0xE0FD, OID_AES_KEY];
/// Size of an exported hash context
pub const HASH_CONTEXT_LENGTH: usize = 130;
const HASH_CONTEXT_HANDLE_SIZE: usize = 8;
const RANDOM_MIN_LENGTH: u16 = 0x08;
const RANDOM_MAX_LENGTH: u16 = 0x100;

type Reply = Result<Vec<u8>, u8>;

struct DataObject {
    data: Vec<u8>,
    max_size: usize,
    metadata: Vec<u8>,
    writable: bool,
}

impl DataObject {
    fn new(max_size: usize, data: Vec<u8>) -> DataObject {
        DataObject {
            data,
            max_size,
            metadata: Vec::new(),
            writable: true,
        }
    }

    fn read_only(data: Vec<u8>) -> DataObject {
        DataObject {
            max_size: data.len(),
            writable: false,
            ..DataObject::new(0, data)
        }
    }

    fn metadata(&self) -> Vec<u8> {
        if !self.metadata.is_empty() {
            return self.metadata.clone();
        }
        let max = (self.max_size as u16).to_be_bytes();
        let used = (self.data.len() as u16).to_be_bytes();
        vec![0x20, 0x08, 0xC4, 0x02, max[0], max[1], 0xC5, 0x02, used[0], used[1]]
    }
}

/// Key material in a key slot or a session context
#[derive(Clone)]
struct StoredKey {
    /// Key algorithm byte, 0 for plain secrets
    algorithm: u8,
    secret: Vec<u8>,
}

impl StoredKey {
    fn secret(secret: Vec<u8>) -> StoredKey {
        StoredKey {
            algorithm: 0,
            secret,
        }
    }

    fn asymmetric(&self) -> Result<KeyAlgorithm, u8> {
        KeyAlgorithm::from_u8(self.algorithm).ok_or(ERR_INVALID_DATA)
    }
}

enum SymEngine {
    Stream { key: Vec<u8>, iv: Vec<u8>, offset: usize },
    Mac { mac: HmacSha256, tag_length: usize },
    Verify { mac: HmacSha256, expected: Vec<u8> },
}

struct SymState {
    cmd: u8,
    mode: u8,
    engine: SymEngine,
}

struct ProtectedUpdate {
    target: u16,
    data: Vec<u8>,
}

pub struct SimulatedChip {
    objects: HashMap<u16, DataObject>,
    keys: HashMap<u16, StoredKey>,
    sessions: HashMap<u16, StoredKey>,
    last_error: u8,
    app_open: bool,
    hibernate_handle: Option<[u8; OPTIGA_APP_CONTEXT_SIZE]>,
    hash: Option<Sha256>,
    hash_contexts: HashMap<[u8; HASH_CONTEXT_HANDLE_SIZE], Sha256>,
    sym: Option<SymState>,
    protected_update: Option<ProtectedUpdate>,
    auto_state: bool,
    commands: u32,
}

impl Default for SimulatedChip {
    fn default() -> SimulatedChip {
        let mut objects = HashMap::new();
        objects.insert(OID_COPROCESSOR_UID, DataObject::read_only(random_bytes(27)));
        objects.insert(OID_LIFE_CYCLE_STATUS, DataObject::new(1, vec![0x07]));
        objects.insert(0xF1C0, DataObject::new(1, vec![0x01]));
        for oid in 0xE0E0..=0xE0E3 {
            objects.insert(oid, DataObject::new(1728, Vec::new()));
        }
        for oid in [0xE0E8u16, 0xE0E9, 0xE0EF].iter() {
            objects.insert(*oid, DataObject::new(1200, Vec::new()));
        }
        for oid in 0xE120..=0xE123 {
            objects.insert(
                oid,
                DataObject::new(8, vec![0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]),
            );
        }
        objects.insert(
            OID_PLATFORM_BINDING_SECRET,
            DataObject::new(64, random_bytes(64)),
        );
        for oid in 0xF1D0..=0xF1DB {
            objects.insert(oid, DataObject::new(140, Vec::new()));
        }
        for oid in 0xF1E0..=0xF1E1 {
            objects.insert(oid, DataObject::new(1500, Vec::new()));
        }

        let device_key = StoredKey {
            algorithm: KeyAlgorithm::EccNistP256 as u8,
            secret: random_bytes(KeyAlgorithm::EccNistP256.private_key_length() as usize),
        };
        if let Some(certificate) = objects.get_mut(&OID_DEVICE_CERTIFICATE) {
            certificate.data = public_key(KeyAlgorithm::EccNistP256, &device_key.secret);
        }
        let mut keys = HashMap::new();
        keys.insert(OID_DEVICE_KEY, device_key);

        SimulatedChip {
            objects,
            keys,
            sessions: HashMap::new(),
            last_error: 0,
            app_open: false,
            hibernate_handle: None,
            hash: None,
            hash_contexts: HashMap::new(),
            sym: None,
            protected_update: None,
            auto_state: false,
            commands: 0,
        }
    }
}

impl ApduResponder for SimulatedChip {
    fn respond(&mut self, apdu: &[u8]) -> Vec<u8> {
        self.commands += 1;
        match self.execute(apdu) {
            Ok(data) => {
                let length = (data.len() as u16).to_be_bytes();
                let mut response = vec![0x00, 0x00, length[0], length[1]];
                response.extend_from_slice(&data);
                response
            }
            Err(code) => {
                warn!(
                    "Simulated chip failed command {:#04x}, error {:#04x}",
                    apdu.first().copied().unwrap_or(0),
                    code
                );
                self.last_error = code;
                vec![0xFF, 0x00, 0x00, 0x00]
            }
        }
    }
}

impl SimulatedChip {
    /// Number of APDUs answered so far
    pub fn commands(&self) -> u32 {
        self.commands
    }

    pub fn is_app_open(&self) -> bool {
        self.app_open
    }

    pub fn last_error(&self) -> u8 {
        self.last_error
    }

    /// Content of a data object, `None` for unknown objects
    pub fn object(&self, oid: u16) -> Option<&[u8]> {
        self.objects.get(&oid).map(|object| object.data.as_slice())
    }

    /// Whether the session context holds anything
    pub fn session_in_use(&self, oid: u16) -> bool {
        self.sessions.contains_key(&oid)
    }

    /// Set by a successful HMAC verification, cleared by ClearAutoState
    pub fn auto_state(&self) -> bool {
        self.auto_state
    }

    fn execute(&mut self, apdu: &[u8]) -> Reply {
        if apdu.len() < 4 {
            return Err(ERR_INVALID_LENGTH);
        }
        let (cmd, param) = (apdu[0], apdu[1]);
        let length = u16::from_be_bytes([apdu[2], apdu[3]]) as usize;
        let data = &apdu[4..];
        if length != data.len() {
            return Err(ERR_INVALID_LENGTH);
        }
        debug!("Simulated chip command {:#04x} param {:#04x}", cmd, param);
        if cmd == CMD_OPEN_APPLICATION {
            return self.open_application(param, data);
        }
        if cmd == CMD_GET_DATA_OBJECT_NO_CLEAR && param == 0 {
            return self.get_data_object(cmd, param, data);
        }
        if !self.app_open {
            return Err(ERR_INVALID_COMMAND);
        }
        match cmd {
            CMD_CLOSE_APPLICATION => self.close_application(param),
            CMD_GET_DATA_OBJECT | CMD_GET_DATA_OBJECT_NO_CLEAR => {
                self.get_data_object(cmd, param, data)
            }
            CMD_SET_DATA_OBJECT => self.set_data_object(param, data),
            CMD_SET_OBJECT_PROTECTED => self.set_object_protected(data),
            CMD_GET_RANDOM => self.get_random(param, data),
            CMD_CALC_HASH => self.calc_hash(data),
            CMD_CALC_SIGN => self.calc_sign(data),
            CMD_VERIFY_SIGN => self.verify_sign(data),
            CMD_CALC_SSEC => self.calc_ssec(data),
            CMD_DERIVE_KEY => self.derive_key(param, data),
            CMD_GEN_KEYPAIR => self.gen_keypair(param, data),
            CMD_GEN_SYMKEY => self.gen_symkey(param, data),
            CMD_ENCRYPT_ASYM => self.encrypt_asym(data),
            CMD_DECRYPT_ASYM => self.decrypt_asym(data),
            CMD_ENCRYPT_SYM | CMD_DECRYPT_SYM => self.symmetric(cmd, param, data),
            _ => Err(ERR_INVALID_COMMAND),
        }
    }

    fn open_application(&mut self, param: u8, data: &[u8]) -> Reply {
        if data.len() < OPTIGA_APPLICATION_ID.len() || data[..16] != OPTIGA_APPLICATION_ID {
            return Err(ERR_INVALID_DATA);
        }
        if param == OPTIGA_CMD_PARAM_HIBERNATE {
            let handle = &data[16..];
            match self.hibernate_handle.take() {
                Some(saved) if saved[..] == *handle => {
                    debug!("Simulated chip restored the saved context");
                }
                _ => return Err(ERR_INVALID_DATA),
            }
        } else {
            self.sessions.clear();
            self.auto_state = false;
            self.hibernate_handle = None;
        }
        self.hash = None;
        self.sym = None;
        self.protected_update = None;
        self.app_open = true;
        Ok(Vec::new())
    }

    fn close_application(&mut self, param: u8) -> Reply {
        self.app_open = false;
        if param == OPTIGA_CMD_PARAM_HIBERNATE {
            let mut handle = [0u8; OPTIGA_APP_CONTEXT_SIZE];
            rand::thread_rng().fill(&mut handle[..]);
            handle[0] |= 0x01;
            self.hibernate_handle = Some(handle);
            return Ok(handle.to_vec());
        }
        self.sessions.clear();
        Ok(Vec::new())
    }

    fn get_data_object(&mut self, cmd: u8, param: u8, data: &[u8]) -> Reply {
        let oid = read_u16(data, 0)?;
        if oid == OPTIGA_LAST_ERROR_CODE_OID {
            let code = self.last_error;
            if cmd == CMD_GET_DATA_OBJECT {
                self.last_error = 0;
            }
            return Ok(if code == 0 { Vec::new() } else { vec![code] });
        }
        if KEY_OBJECTS.contains(&oid) {
            return Err(ERR_ACCESS_DENIED);
        }
        let object = self.objects.get(&oid).ok_or(ERR_INVALID_OID)?;
        if param == WriteMode::Metadata as u8 {
            return Ok(object.metadata());
        }
        let offset = read_u16(data, 2)? as usize;
        let length = read_u16(data, 4)? as usize;
        let size = object.data.len();
        if offset > size || (offset == size && size != 0) {
            return Err(OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY);
        }
        let end = (offset + length).min(size);
        Ok(object.data[offset..end].to_vec())
    }

    fn set_data_object(&mut self, param: u8, data: &[u8]) -> Reply {
        let oid = read_u16(data, 0)?;
        let offset = read_u16(data, 2)? as usize;
        let value = data.get(4..).unwrap_or(&[]);
        if KEY_OBJECTS.contains(&oid) || oid == OPTIGA_LAST_ERROR_CODE_OID {
            return Err(ERR_ACCESS_DENIED);
        }
        let object = self.objects.get_mut(&oid).ok_or(ERR_INVALID_OID)?;
        if !object.writable {
            return Err(ERR_ACCESS_DENIED);
        }
        match param {
            p if p == WriteMode::Metadata as u8 => {
                if value.first() != Some(&0x20) {
                    return Err(ERR_INVALID_DATA);
                }
                object.metadata = value.to_vec();
            }
            p if p == WriteMode::Count as u8 => {
                let count = *value.first().ok_or(ERR_INVALID_LENGTH)?;
                if object.data.len() != 8 {
                    return Err(ERR_INVALID_OID);
                }
                let counter = u32::from_be_bytes([
                    object.data[0],
                    object.data[1],
                    object.data[2],
                    object.data[3],
                ]);
                let threshold = u32::from_be_bytes([
                    object.data[4],
                    object.data[5],
                    object.data[6],
                    object.data[7],
                ]);
                if counter >= threshold {
                    return Err(ERR_ACCESS_DENIED);
                }
                let counter = counter.saturating_add(count as u32).min(threshold);
                object.data[..4].copy_from_slice(&counter.to_be_bytes());
            }
            p if p == WriteMode::Write as u8 || p == WriteMode::EraseAndWrite as u8 => {
                if offset + value.len() > object.max_size {
                    return Err(OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY);
                }
                if p == WriteMode::EraseAndWrite as u8 {
                    object.data.clear();
                }
                if offset > object.data.len() {
                    object.data.resize(offset, 0);
                }
                let end = offset + value.len();
                if end > object.data.len() {
                    object.data.resize(end, 0);
                }
                object.data[offset..end].copy_from_slice(value);
            }
            _ => return Err(ERR_INVALID_PARAM),
        }
        Ok(Vec::new())
    }

    fn set_object_protected(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let (tag, value) = *tlvs.first().ok_or(ERR_INVALID_DATA)?;
        if tag & 0xF0 != protected::TAG_SET_OBJECT_PROTECTED {
            return Err(ERR_INVALID_DATA);
        }
        match tag & 0x0F {
            0x00 => {
                // manifest: target object first
                let target = read_u16(value, 0)?;
                if !self.objects.contains_key(&target) {
                    return Err(ERR_INVALID_OID);
                }
                self.protected_update = Some(ProtectedUpdate {
                    target,
                    data: Vec::new(),
                });
            }
            0x02 => match self.protected_update.as_mut() {
                Some(update) => update.data.extend_from_slice(value),
                None => return Err(ERR_OUT_OF_SEQUENCE),
            },
            0x01 => {
                let mut update = self.protected_update.take().ok_or(ERR_OUT_OF_SEQUENCE)?;
                update.data.extend_from_slice(value);
                let object = self
                    .objects
                    .get_mut(&update.target)
                    .ok_or(ERR_INVALID_OID)?;
                if update.data.len() > object.max_size {
                    return Err(OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY);
                }
                object.data = update.data;
            }
            _ => return Err(ERR_INVALID_DATA),
        }
        Ok(Vec::new())
    }

    fn get_random(&mut self, param: u8, data: &[u8]) -> Reply {
        let length = read_u16(data, 0)?;
        if !(RANDOM_MIN_LENGTH..=RANDOM_MAX_LENGTH).contains(&length) {
            return Err(ERR_INVALID_LENGTH);
        }
        match param {
            0x00 | 0x01 => Ok(random_bytes(length as usize)),
            0x04 => {
                let session = read_u16(data, 2)?;
                check_session(session)?;
                let tlvs = parse_tlvs(&data[4..])?;
                let mut secret = find(&tlvs, random::TAG_PRE_MASTER_OPTIONAL_DATA)
                    .unwrap_or(&[])
                    .to_vec();
                secret.extend(random_bytes(length as usize));
                self.sessions.insert(session, StoredKey::secret(secret));
                Ok(Vec::new())
            }
            _ => Err(ERR_INVALID_PARAM),
        }
    }

    fn calc_hash(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let (tag, value) = *tlvs.first().ok_or(ERR_INVALID_DATA)?;
        let sequence = tag & !hash::TAG_OID_DATA;
        if sequence > 0x03 {
            return Err(ERR_INVALID_DATA);
        }
        let input = if tag & hash::TAG_OID_DATA != 0 {
            let oid = read_u16(value, 0)?;
            let offset = read_u16(value, 2)? as usize;
            let length = read_u16(value, 4)? as usize;
            let object = self.objects.get(&oid).ok_or(ERR_INVALID_OID)?;
            let start = offset.min(object.data.len());
            let end = (offset + length).min(object.data.len());
            object.data[start..end].to_vec()
        } else {
            value.to_vec()
        };

        let imported = match find(&tlvs[1..], hash::TAG_INTERMEDIATE_CONTEXT) {
            Some(context) => {
                let mut handle = [0u8; HASH_CONTEXT_HANDLE_SIZE];
                handle.copy_from_slice(context.get(..HASH_CONTEXT_HANDLE_SIZE).ok_or(ERR_INVALID_DATA)?);
                Some(self.hash_contexts.get(&handle).cloned().ok_or(ERR_INVALID_DATA)?)
            }
            None => None,
        };
        let mut state = match (sequence, imported) {
            (0x00, _) | (0x01, _) => Sha256::new(),
            (_, Some(state)) => state,
            _ => self.hash.take().ok_or(ERR_OUT_OF_SEQUENCE)?,
        };
        state.update(&input);

        if sequence == 0x01 || sequence == 0x03 {
            self.hash = None;
            let mut out = vec![hash::TAG_DIGEST_OUT, 0x00, 0x20];
            out.extend_from_slice(&state.finalize());
            return Ok(out);
        }
        let export = find(&tlvs[1..], hash::TAG_CONTEXT_OUT).is_some();
        let mut out = Vec::new();
        if export {
            let mut handle = [0u8; HASH_CONTEXT_HANDLE_SIZE];
            rand::thread_rng().fill(&mut handle[..]);
            self.hash_contexts.insert(handle, state.clone());
            let mut context = vec![0u8; HASH_CONTEXT_LENGTH];
            context[..HASH_CONTEXT_HANDLE_SIZE].copy_from_slice(&handle);
            out.push(hash::TAG_INTERMEDIATE_CONTEXT);
            out.extend_from_slice(&(HASH_CONTEXT_LENGTH as u16).to_be_bytes());
            out.extend_from_slice(&context);
        }
        self.hash = Some(state);
        Ok(out)
    }

    fn calc_sign(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let digest = find(&tlvs, sign_verify::TAG_DIGEST).ok_or(ERR_INVALID_DATA)?;
        let oid = read_u16(find(&tlvs, sign_verify::TAG_SIGN_KEY_OID).ok_or(ERR_INVALID_DATA)?, 0)?;
        let private = self.stored_key(oid)?;
        let public = public_key(private.asymmetric()?, &private.secret);
        Ok(signature(&public, digest))
    }

    fn verify_sign(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let digest = find(&tlvs, sign_verify::TAG_DIGEST).ok_or(ERR_INVALID_DATA)?;
        let received = find(&tlvs, sign_verify::TAG_SIGNATURE).ok_or(ERR_INVALID_DATA)?;
        let public = self.public_key_in(&tlvs, sign_verify::TAG_PUBLIC_KEY_OID, sign_verify::TAG_PUBLIC_KEY)?;
        let expected = signature(&public, digest);
        match (der_integers(received), der_integers(&expected)) {
            (Some(received), Some(expected)) if received == expected => Ok(Vec::new()),
            _ => Err(ERR_VERIFICATION_FAILED),
        }
    }

    fn calc_ssec(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let oid = read_u16(find(&tlvs, key::TAG_SSEC_PRIVATE_KEY).ok_or(ERR_INVALID_DATA)?, 0)?;
        let algorithm = *find(&tlvs, key::TAG_SSEC_ALGORITHM)
            .and_then(|value| value.first())
            .ok_or(ERR_INVALID_DATA)?;
        let peer = find(&tlvs, key::TAG_SSEC_PUBLIC_KEY).ok_or(ERR_INVALID_DATA)?;
        let private = self.stored_key(oid)?;
        if private.algorithm != algorithm {
            return Err(ERR_INVALID_DATA);
        }
        let curve = private.asymmetric()?;
        let own = public_key(curve, &private.secret);
        if own.len() != peer.len() {
            return Err(ERR_INVALID_DATA);
        }
        let mixed: Vec<u8> = own.iter().zip(peer.iter()).map(|(a, b)| a ^ b).collect();
        let secret = p_hash(&mixed, b"shared secret", curve.private_key_length() as usize - 2);
        self.deliver_secret(&tlvs, secret)
    }

    fn derive_key(&mut self, param: u8, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let oid = read_u16(find(&tlvs, key::TAG_DERIVE_SECRET_OID).ok_or(ERR_INVALID_DATA)?, 0)?;
        let length = read_u16(find(&tlvs, key::TAG_DERIVE_KEY_LENGTH).ok_or(ERR_INVALID_DATA)?, 0)?;
        if length < key::DERIVE_KEY_MIN_LENGTH {
            return Err(ERR_INVALID_LENGTH);
        }
        let seed = find(&tlvs, key::TAG_DERIVE_DATA).unwrap_or(&[]);
        let info = find(&tlvs, key::TAG_DERIVE_INFO).unwrap_or(&[]);
        let secret = self.secret(oid)?;
        let derived = match param {
            p if p == KeyDerivation::TlsPrfSha256 as u8
                || p == KeyDerivation::TlsPrfSha384 as u8
                || p == KeyDerivation::TlsPrfSha512 as u8 =>
            {
                p_hash(&secret, seed, length as usize)
            }
            p if p == KeyDerivation::HkdfSha256 as u8
                || p == KeyDerivation::HkdfSha384 as u8
                || p == KeyDerivation::HkdfSha512 as u8 =>
            {
                hkdf(&secret, seed, info, length as usize)
            }
            _ => return Err(ERR_INVALID_PARAM),
        };
        self.deliver_secret(&tlvs, derived)
    }

    /// Exports `secret` or keeps it in the session named by the request
    fn deliver_secret(&mut self, tlvs: &[(u8, &[u8])], secret: Vec<u8>) -> Reply {
        if find(tlvs, key::TAG_EXPORT).is_some() {
            return Ok(secret);
        }
        let session = read_u16(find(tlvs, key::TAG_STORE_SESSION).ok_or(ERR_INVALID_DATA)?, 0)?;
        check_session(session)?;
        self.sessions.insert(session, StoredKey::secret(secret));
        Ok(Vec::new())
    }

    fn gen_keypair(&mut self, param: u8, data: &[u8]) -> Reply {
        let algorithm = KeyAlgorithm::from_u8(param).ok_or(ERR_INVALID_PARAM)?;
        let tlvs = parse_tlvs(data)?;
        let private = StoredKey {
            algorithm: param,
            secret: random_bytes(algorithm.private_key_length() as usize),
        };
        let public = public_key(algorithm, &private.secret);
        let mut out = Vec::new();
        if find(&tlvs, key::TAG_EXPORT).is_some() {
            put_tlv(&mut out, key::TAG_PRIVATE_KEY_OUT, &private.secret);
        } else {
            let oid = read_u16(find(&tlvs, key::TAG_KEY_OID).ok_or(ERR_INVALID_DATA)?, 0)?;
            self.store_key(oid, private)?;
        }
        put_tlv(&mut out, key::TAG_PUBLIC_KEY_OUT, &public);
        Ok(out)
    }

    fn gen_symkey(&mut self, param: u8, data: &[u8]) -> Reply {
        let length = match param {
            0x81 => 16,
            0x82 => 24,
            0x83 => 32,
            _ => return Err(ERR_INVALID_PARAM),
        };
        let tlvs = parse_tlvs(data)?;
        let generated = StoredKey {
            algorithm: param,
            secret: random_bytes(length),
        };
        if find(&tlvs, key::TAG_EXPORT).is_some() {
            let mut out = Vec::new();
            put_tlv(&mut out, key::TAG_SYM_KEY_OUT, &generated.secret);
            return Ok(out);
        }
        let oid = read_u16(find(&tlvs, key::TAG_KEY_OID).ok_or(ERR_INVALID_DATA)?, 0)?;
        if oid != OID_AES_KEY {
            return Err(ERR_INVALID_OID);
        }
        self.keys.insert(oid, generated);
        Ok(Vec::new())
    }

    fn encrypt_asym(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let message = match find(&tlvs, asym::TAG_MESSAGE) {
            Some(message) => message.to_vec(),
            None => {
                let session =
                    read_u16(find(&tlvs, asym::TAG_SESSION_OID).ok_or(ERR_INVALID_DATA)?, 0)?;
                self.stored_key(session)?.secret.clone()
            }
        };
        let public = self.public_key_in(&tlvs, asym::TAG_PUBLIC_KEY_OID, asym::TAG_PUBLIC_KEY)?;
        let mut out = Vec::new();
        put_tlv(&mut out, asym::TAG_MESSAGE, &xor_stream(&public, &[], 0, &message));
        Ok(out)
    }

    fn decrypt_asym(&mut self, data: &[u8]) -> Reply {
        let tlvs = parse_tlvs(data)?;
        let message = find(&tlvs, asym::TAG_MESSAGE).ok_or(ERR_INVALID_DATA)?;
        let oid = read_u16(find(&tlvs, asym::TAG_DECRYPT_KEY).ok_or(ERR_INVALID_DATA)?, 0)?;
        let private = self.stored_key(oid)?;
        let public = public_key(private.asymmetric()?, &private.secret);
        let plain = xor_stream(&public, &[], 0, message);
        match find(&tlvs, asym::TAG_SESSION_OID) {
            Some(session) => {
                let session = read_u16(session, 0)?;
                check_session(session)?;
                self.sessions.insert(session, StoredKey::secret(plain));
                Ok(Vec::new())
            }
            None => {
                let mut out = Vec::new();
                put_tlv(&mut out, asym::TAG_MESSAGE, &plain);
                Ok(out)
            }
        }
    }

    fn symmetric(&mut self, cmd: u8, mode: u8, data: &[u8]) -> Reply {
        let key_oid = read_u16(data, 0)?;
        let sequence = *data.get(2).ok_or(ERR_INVALID_LENGTH)?;
        let length = read_u16(data, 3)? as usize;
        let payload = data.get(5..5 + length).ok_or(ERR_INVALID_LENGTH)?;
        let tlvs = parse_tlvs(&data[5 + length..])?;
        let hmac_mode = mode >= SymmetricMode::HmacSha256 as u8;
        let verify = cmd == CMD_DECRYPT_SYM && hmac_mode;
        // HMAC verification names the session authorising it ahead of the data
        let payload = if verify {
            read_u16(payload, 0)?;
            &payload[2..]
        } else {
            payload
        };
        let first = sequence == 0x00 || sequence == 0x01;
        let last = sequence == 0x01 || sequence == 0x03;
        if sequence > 0x03 {
            return Err(ERR_INVALID_PARAM);
        }

        let expected = find(&tlvs, sym::TAG_VERIFICATION_DATA);
        if verify && sequence == 0x01 && payload.is_empty() && expected.is_none() {
            debug!("Simulated chip cleared the auto state");
            self.auto_state = false;
            return Ok(Vec::new());
        }

        let mut state = if first {
            let secret = self.secret(key_oid)?;
            let engine = if verify {
                SymEngine::Verify {
                    mac: HmacSha256::new(&secret),
                    expected: expected.ok_or(ERR_INVALID_DATA)?.to_vec(),
                }
            } else if is_mac(mode) {
                SymEngine::Mac {
                    mac: HmacSha256::new(&secret),
                    tag_length: mac_length(mode),
                }
            } else {
                SymEngine::Stream {
                    key: secret,
                    iv: find(&tlvs, sym::TAG_IV).unwrap_or(&[]).to_vec(),
                    offset: 0,
                }
            };
            SymState { cmd, mode, engine }
        } else {
            match self.sym.take() {
                Some(state) if state.cmd == cmd && state.mode == mode => state,
                _ => return Err(ERR_OUT_OF_SEQUENCE),
            }
        };

        let mut out = Vec::new();
        match &mut state.engine {
            SymEngine::Stream { key, iv, offset } => {
                put_tlv(&mut out, sym::TAG_OUT_DATA, &xor_stream(key, iv, *offset, payload));
                *offset += payload.len();
            }
            SymEngine::Mac { mac, .. } | SymEngine::Verify { mac, .. } => mac.update(payload),
        }
        if !last {
            self.sym = Some(state);
            return Ok(out);
        }
        match state.engine {
            SymEngine::Stream { .. } => {}
            SymEngine::Mac { mac, tag_length } => {
                let tag = extend_tag(mac, tag_length);
                put_tlv(&mut out, sym::TAG_OUT_DATA, &tag);
            }
            SymEngine::Verify { mac, expected } => {
                if mac.finalize()[..] != expected[..] {
                    return Err(ERR_VERIFICATION_FAILED);
                }
                self.auto_state = true;
            }
        }
        Ok(out)
    }

    fn store_key(&mut self, oid: u16, stored: StoredKey) -> Result<(), u8> {
        if is_session(oid) {
            self.sessions.insert(oid, stored);
        } else if KEY_OBJECTS.contains(&oid) && oid != OID_AES_KEY {
            self.keys.insert(oid, stored);
        } else {
            return Err(ERR_INVALID_OID);
        }
        Ok(())
    }

    /// Key in a key slot or session context
    fn stored_key(&self, oid: u16) -> Result<&StoredKey, u8> {
        let stored = if is_session(oid) {
            self.sessions.get(&oid)
        } else if KEY_OBJECTS.contains(&oid) {
            self.keys.get(&oid)
        } else {
            return Err(ERR_INVALID_OID);
        };
        stored.ok_or(ERR_ACCESS_DENIED)
    }

    /// Secret usable by derivation and MACs: a key, a session or a data object
    fn secret(&self, oid: u16) -> Result<Vec<u8>, u8> {
        if is_session(oid) || KEY_OBJECTS.contains(&oid) {
            return self.stored_key(oid).map(|stored| stored.secret.clone());
        }
        match self.objects.get(&oid) {
            Some(object) if !object.data.is_empty() => Ok(object.data.clone()),
            Some(_) => Err(ERR_ACCESS_DENIED),
            None => Err(ERR_INVALID_OID),
        }
    }

    /// Public key given by OID or inline with its algorithm
    fn public_key_in(&self, tlvs: &[(u8, &[u8])], oid_tag: u8, key_tag: u8) -> Result<Vec<u8>, u8> {
        if let Some(oid) = find(tlvs, oid_tag) {
            let oid = read_u16(oid, 0)?;
            let object = self.objects.get(&oid).ok_or(ERR_INVALID_OID)?;
            if object.data.is_empty() {
                return Err(ERR_ACCESS_DENIED);
            }
            return Ok(object.data.clone());
        }
        find(tlvs, key_tag)
            .map(|key| key.to_vec())
            .ok_or(ERR_INVALID_DATA)
    }
}

fn random_bytes(length: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(Standard)
        .take(length)
        .collect()
}

fn is_session(oid: u16) -> bool {
    oid >= OPTIGA_CMD_SESSION_BASE_OID
        && oid < OPTIGA_CMD_SESSION_BASE_OID + OPTIGA_CMD_MAX_SESSIONS as u16
}

fn check_session(oid: u16) -> Result<(), u8> {
    if is_session(oid) {
        Ok(())
    } else {
        Err(ERR_INVALID_OID)
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, u8> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or(ERR_INVALID_LENGTH)
}

/// Splits in-data into `(tag, value)` pairs
fn parse_tlvs(mut data: &[u8]) -> Result<Vec<(u8, &[u8])>, u8> {
    let mut tlvs = Vec::new();
    while !data.is_empty() {
        let length = read_u16(data, 1).map_err(|_| ERR_INVALID_DATA)? as usize;
        let value = data
            .get(TLV_HEADER_SIZE..TLV_HEADER_SIZE + length)
            .ok_or(ERR_INVALID_DATA)?;
        tlvs.push((data[0], value));
        data = &data[TLV_HEADER_SIZE + length..];
    }
    Ok(tlvs)
}

fn find<'a>(tlvs: &[(u8, &'a [u8])], tag: u8) -> Option<&'a [u8]> {
    tlvs.iter()
        .find(|(found, _)| *found == tag)
        .map(|(_, value)| *value)
}

fn put_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn is_mac(mode: u8) -> bool {
    mode == SymmetricMode::CbcMac as u8
        || mode == SymmetricMode::Cmac as u8
        || mode >= SymmetricMode::HmacSha256 as u8
}

fn mac_length(mode: u8) -> usize {
    match mode {
        m if m == SymmetricMode::HmacSha384 as u8 => 48,
        m if m == SymmetricMode::HmacSha512 as u8 => 64,
        m if m == SymmetricMode::HmacSha256 as u8 => 32,
        _ => 16,
    }
}

struct HmacSha256 {
    inner: Sha256,
    outer_key: [u8; 64],
}

impl HmacSha256 {
    fn new(key: &[u8]) -> HmacSha256 {
        let mut block = [0u8; 64];
        if key.len() > block.len() {
            block[..32].copy_from_slice(&Sha256::digest(key));
        } else {
            block[..key.len()].copy_from_slice(key);
        }
        let mut inner = Sha256::new();
        let inner_key: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
        inner.update(&inner_key);
        let mut outer_key = [0u8; 64];
        for (outer, b) in outer_key.iter_mut().zip(block.iter()) {
            *outer = b ^ 0x5C;
        }
        HmacSha256 { inner, outer_key }
    }

    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize(self) -> [u8; 32] {
        let mut outer = Sha256::new();
        outer.update(&self.outer_key[..]);
        outer.update(&self.inner.finalize());
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&outer.finalize());
        tag
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new(key);
    mac.update(data);
    mac.finalize()
}

/// MAC truncated or stretched to the length of the mode
fn extend_tag(mac: HmacSha256, length: usize) -> Vec<u8> {
    let first = mac.finalize();
    let mut tag = first.to_vec();
    if length > tag.len() {
        tag.extend_from_slice(&p_hash(&first, b"tag", length - tag.len()));
    }
    tag.truncate(length);
    tag
}

/// TLS 1.2 P_SHA256
fn p_hash(secret: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(length + 32);
    let mut a = hmac(secret, seed);
    while out.len() < length {
        let mut mac = HmacSha256::new(secret);
        mac.update(&a);
        mac.update(seed);
        out.extend_from_slice(&mac.finalize());
        a = hmac(secret, &a);
    }
    out.truncate(length);
    out
}

/// RFC 5869 HKDF with SHA-256
fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let prk = hmac(salt, ikm);
    let mut out = Vec::with_capacity(length + 32);
    let mut block: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while out.len() < length {
        let mut mac = HmacSha256::new(&prk);
        mac.update(&block);
        mac.update(info);
        mac.update(&[counter]);
        block = mac.finalize().to_vec();
        out.extend_from_slice(&block);
        counter = counter.wrapping_add(1);
    }
    out.truncate(length);
    out
}

/// Keystream cipher standing in for AES and RSA
fn xor_stream(key: &[u8], iv: &[u8], offset: usize, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut position = offset;
    for byte in data {
        let block_index = (position / 32) as u32;
        let mut block = Sha256::new();
        block.update(key);
        block.update(iv);
        block.update(&block_index.to_be_bytes());
        let block = block.finalize();
        out.push(byte ^ block[position % 32]);
        position += 1;
    }
    out
}

fn der_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else if length <= 0xFF {
        vec![0x81, length as u8]
    } else {
        vec![0x82, (length >> 8) as u8, length as u8]
    }
}

fn public_key_body_length(algorithm: KeyAlgorithm) -> usize {
    match algorithm {
        KeyAlgorithm::Rsa1024 => 128,
        KeyAlgorithm::Rsa2048 => 256,
        ecc => 2 * (ecc.private_key_length() as usize - 2),
    }
}

/// Public key as a BIT STRING, uncompressed point for ECC keys
fn public_key(algorithm: KeyAlgorithm, private: &[u8]) -> Vec<u8> {
    let body = p_hash(private, b"public key", public_key_body_length(algorithm));
    let prefix: &[u8] = match algorithm {
        KeyAlgorithm::Rsa1024 | KeyAlgorithm::Rsa2048 => &[0x00],
        _ => &[0x00, 0x04],
    };
    let mut key = vec![0x03];
    key.extend(der_length(prefix.len() + body.len()));
    key.extend_from_slice(prefix);
    key.extend(body);
    key
}

/// r and s as DER integers; r carries its sign byte, s a redundant one
fn signature(public: &[u8], digest: &[u8]) -> Vec<u8> {
    let component = |label: &[u8]| {
        let mut h = Sha256::new();
        h.update(label);
        h.update(public);
        h.update(digest);
        h.finalize()
    };
    let mut r = component(b"r");
    let mut s = component(b"s");
    r[0] |= 0x80;
    s[0] = (s[0] & 0x7F) | 0x01;
    let mut out = Vec::with_capacity(70);
    for value in [&r[..], &s[..]].iter() {
        out.extend_from_slice(&[0x02, 0x21, 0x00]);
        out.extend_from_slice(value);
    }
    out
}

/// The two integers of a signature without leading zero bytes
fn der_integers(signature: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut values = Vec::with_capacity(2);
    let mut rest = signature;
    for _ in 0..2 {
        if rest.len() < 2 || rest[0] != 0x02 {
            return None;
        }
        let length = rest[1] as usize;
        let value = rest.get(2..2 + length)?;
        let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
        values.push(value[start..].to_vec());
        rest = &rest[2 + length..];
    }
    let s = values.pop()?;
    let r = values.pop()?;
    Some((r, s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apdu(cmd: u8, param: u8, data: &[u8]) -> Vec<u8> {
        let mut apdu = vec![cmd, param];
        apdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        apdu.extend_from_slice(data);
        apdu
    }

    fn opened() -> SimulatedChip {
        let mut chip = SimulatedChip::default();
        let response = chip.respond(&apdu(CMD_OPEN_APPLICATION, 0x00, &OPTIGA_APPLICATION_ID));
        assert_eq!(response, vec![0x00, 0x00, 0x00, 0x00]);
        chip
    }

    fn hex(text: &str) -> Vec<u8> {
        (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn commands_need_open_application() {
        let mut chip = SimulatedChip::default();
        let response = chip.respond(&apdu(CMD_GET_RANDOM, 0x00, &[0x00, 0x10]));
        assert_eq!(response, vec![0xFF, 0x00, 0x00, 0x00]);
        // the last error code stays readable
        let response = chip.respond(&apdu(
            CMD_GET_DATA_OBJECT_NO_CLEAR,
            0x00,
            &[0xF1, 0xC2, 0x00, 0x00, 0x00, 0x01],
        ));
        assert_eq!(response, vec![0x00, 0x00, 0x00, 0x01, ERR_INVALID_COMMAND]);
        assert_eq!(chip.last_error(), ERR_INVALID_COMMAND);
    }

    #[test]
    fn last_error_cleared_by_regular_read() {
        let mut chip = opened();
        chip.respond(&apdu(CMD_GET_DATA_OBJECT, 0x00, &[0x12, 0x34, 0, 0, 0, 1]));
        assert_eq!(chip.last_error(), ERR_INVALID_OID);
        let response = chip.respond(&apdu(CMD_GET_DATA_OBJECT, 0x00, &[0xF1, 0xC2, 0, 0, 0, 1]));
        assert_eq!(response[4..], [ERR_INVALID_OID]);
        assert_eq!(chip.last_error(), 0);
    }

    #[test]
    fn write_bounds_and_read_past_end() {
        let mut chip = opened();
        let mut data = vec![0xF1, 0xD0, 0x00, 0x00];
        data.extend_from_slice(&[0xAB; 10]);
        assert_eq!(chip.respond(&apdu(CMD_SET_DATA_OBJECT, 0x00, &data))[0], 0x00);
        assert_eq!(chip.object(0xF1D0), Some(&[0xAB; 10][..]));

        let response = chip.respond(&apdu(CMD_GET_DATA_OBJECT, 0x00, &[0xF1, 0xD0, 0, 4, 0, 100]));
        assert_eq!(&response[2..4], &[0x00, 0x06]);

        let response = chip.respond(&apdu(CMD_GET_DATA_OBJECT, 0x00, &[0xF1, 0xD0, 0, 10, 0, 1]));
        assert_eq!(response[0], 0xFF);
        assert_eq!(chip.last_error(), OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY);

        let mut data = vec![0xF1, 0xD0, 0x00, 0x8A];
        data.extend_from_slice(&[0x01; 3]);
        assert_eq!(chip.respond(&apdu(CMD_SET_DATA_OBJECT, 0x00, &data))[0], 0xFF);
        assert_eq!(chip.last_error(), OPTIGA_DEVICE_ERROR_OUT_OF_BOUNDARY);
    }

    #[test]
    fn key_objects_not_readable() {
        let mut chip = opened();
        let response = chip.respond(&apdu(CMD_GET_DATA_OBJECT, 0x00, &[0xE0, 0xF0, 0, 0, 0, 1]));
        assert_eq!(response[0], 0xFF);
        assert_eq!(chip.last_error(), ERR_ACCESS_DENIED);
    }

    #[test]
    fn sha256_digest() {
        let mut chip = opened();
        let response = chip.respond(&apdu(CMD_CALC_HASH, 0xE2, &[0x01, 0x00, 0x03, b'a', b'b', b'c']));
        assert_eq!(&response[4..7], &[hash::TAG_DIGEST_OUT, 0x00, 0x20]);
        assert_eq!(
            response[7..].to_vec(),
            hex("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn hmac_and_key_derivation_vectors() {
        // RFC 4231 test case 2
        assert_eq!(
            hmac(b"Jefe", b"what do ya want for nothing?").to_vec(),
            hex("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
        // RFC 5869 test case 1
        let okm = hkdf(&[0x0B; 22], &hex("000102030405060708090a0b0c"), &hex("f0f1f2f3f4f5f6f7f8f9"), 42);
        assert_eq!(
            okm,
            hex("3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865")
        );
    }

    #[test]
    fn signature_integers() {
        let public = public_key(KeyAlgorithm::EccNistP256, &[1u8; 34]);
        let sig = signature(&public, &[0x55; 32]);
        assert_eq!(sig.len(), 70);
        let (r, s) = der_integers(&sig).unwrap();
        assert_eq!(r.len(), 32);
        assert!(r[0] & 0x80 != 0);
        assert!(s.len() == 32 && s[0] <= 0x7F);
    }

    #[test]
    fn hibernate_handle_restores_once() {
        let mut chip = opened();
        let response = chip.respond(&apdu(CMD_CLOSE_APPLICATION, OPTIGA_CMD_PARAM_HIBERNATE, &[]));
        let handle = response[4..].to_vec();
        assert_eq!(handle.len(), OPTIGA_APP_CONTEXT_SIZE);
        assert!(!chip.is_app_open());

        let mut data = OPTIGA_APPLICATION_ID.to_vec();
        data.extend_from_slice(&handle);
        let restore = apdu(CMD_OPEN_APPLICATION, OPTIGA_CMD_PARAM_HIBERNATE, &data);
        assert_eq!(chip.respond(&restore)[0], 0x00);
        assert_eq!(chip.respond(&restore)[0], 0xFF);
    }
}
