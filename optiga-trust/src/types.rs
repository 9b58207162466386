#[macro_use]
extern crate strum_macros; // 0.21.1

/// Return status for stack and chip accessing functions.
/// Each variant maps onto the 16-bit status code space of the chip library.
#[derive(Copy, Clone, Debug, Display, PartialEq)]
pub enum OptigaStatus {
    /// Function succeeded.
    LibSuccess,
    /// Operation accepted and still in progress
    Busy,
    /// The chip failed an APDU; carries the byte read back from the last error code object
    DeviceError(u8),
    /// Link level failure (retries and resync exhausted)
    CommsError,
    /// Invalid argument passed to the communication stack
    CommsInvalidInput,
    /// Receive buffer too small for the reassembled response
    CommsMemoryInsufficient,
    /// Stack of the communication layer is not initialised
    CommsStackMemory,
    /// Unrecoverable physical layer failure
    CommsFatal,
    /// Shielded connection handshake failed
    CommsHandshake,
    /// Shielded connection session became invalid
    CommsSession,
    /// Command layer failure
    CmdError,
    /// Structurally invalid command parameters or strict lock misuse
    CmdInvalidInput,
    /// APDU or caller buffer too small
    CmdMemoryInsufficient,
    UtilError,
    UtilInvalidInput,
    UtilMemoryInsufficient,
    /// The instance already has an operation in flight
    UtilInstanceInUse,
    CryptError,
    CryptInvalidInput,
    CryptMemoryInsufficient,
    CryptInstanceInUse,
    /// Code outside of the known status space
    Unknown(u16),
} // pub enum OptigaStatus

impl OptigaStatus {
    /// 16-bit status code as reported by the chip library
    pub fn code(self) -> u16 {
        match self {
            OptigaStatus::LibSuccess => 0x0000,
            OptigaStatus::Busy => 0x0001,
            OptigaStatus::DeviceError(code) => 0x8000 | code as u16,
            OptigaStatus::CommsError => 0x0102,
            OptigaStatus::CommsInvalidInput => 0x0103,
            OptigaStatus::CommsMemoryInsufficient => 0x0104,
            OptigaStatus::CommsStackMemory => 0x0105,
            OptigaStatus::CommsFatal => 0x0106,
            OptigaStatus::CommsHandshake => 0x0107,
            OptigaStatus::CommsSession => 0x0108,
            OptigaStatus::CmdError => 0x0202,
            OptigaStatus::CmdInvalidInput => 0x0203,
            OptigaStatus::CmdMemoryInsufficient => 0x0204,
            OptigaStatus::UtilError => 0x0302,
            OptigaStatus::UtilInvalidInput => 0x0303,
            OptigaStatus::UtilMemoryInsufficient => 0x0304,
            OptigaStatus::UtilInstanceInUse => 0x0305,
            OptigaStatus::CryptError => 0x0402,
            OptigaStatus::CryptInvalidInput => 0x0403,
            OptigaStatus::CryptMemoryInsufficient => 0x0404,
            OptigaStatus::CryptInstanceInUse => 0x0405,
            OptigaStatus::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == OptigaStatus::LibSuccess
    }
}

impl From<u16> for OptigaStatus {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => OptigaStatus::LibSuccess,
            0x0001 => OptigaStatus::Busy,
            0x0102 => OptigaStatus::CommsError,
            0x0103 => OptigaStatus::CommsInvalidInput,
            0x0104 => OptigaStatus::CommsMemoryInsufficient,
            0x0105 => OptigaStatus::CommsStackMemory,
            0x0106 => OptigaStatus::CommsFatal,
            0x0107 => OptigaStatus::CommsHandshake,
            0x0108 => OptigaStatus::CommsSession,
            0x0202 => OptigaStatus::CmdError,
            0x0203 => OptigaStatus::CmdInvalidInput,
            0x0204 => OptigaStatus::CmdMemoryInsufficient,
            0x0302 => OptigaStatus::UtilError,
            0x0303 => OptigaStatus::UtilInvalidInput,
            0x0304 => OptigaStatus::UtilMemoryInsufficient,
            0x0305 => OptigaStatus::UtilInstanceInUse,
            0x0402 => OptigaStatus::CryptError,
            0x0403 => OptigaStatus::CryptInvalidInput,
            0x0404 => OptigaStatus::CryptMemoryInsufficient,
            0x0405 => OptigaStatus::CryptInstanceInUse,
            _ if code & 0xFF00 == 0x8000 => OptigaStatus::DeviceError(code as u8),
            _ => OptigaStatus::Unknown(code),
        }
    }
}

/// Bus the chip is attached to
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OptigaIfaceType {
    I2c,
    Uart,
    /// In-process simulated chip behind the I2C protocol stack
    Simulator,
    Unknown,
} // pub enum OptigaIfaceType

/// Chip variant, or the behaviour of the simulated chip
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OptigaChipType {
    OptigaTrustM,
    OptigaTrustX,
    /// Simulated chip answering every frame correctly
    SimAlwaysSuccess,
    /// Simulated chip whose physical layer fails every transfer
    SimAlwaysFail,
    /// Simulated chip that drops every n-th frame it receives
    SimLossyLink(u8),
    Unknown,
} // pub enum OptigaChipType

/// I2C bus parameters
#[derive(Clone, Debug, PartialEq)]
pub struct OptigaIfaceI2c {
    pub bus: u8,
    pub slave_address: u8,
    /// Minimum gap between two bus transactions
    pub guard_time_us: u32,
    /// Delay between two status polls while the chip is busy
    pub polling_interval_us: u32,
    pub polling_retries: u32,
} // pub struct OptigaIfaceI2c

/// UART parameters
#[derive(Clone, Debug, PartialEq)]
pub struct OptigaIfaceUart {
    /// Path of the file naming the serial port (`optiga_comms.ini`)
    pub config_file: String,
    pub baud: u32,
} // pub struct OptigaIfaceUart

/// Configuration of one chip instance and the stack in front of it
#[derive(Clone, Debug, PartialEq)]
pub struct OptigaCommsCfg {
    pub iface_type: OptigaIfaceType,
    pub chip_type: OptigaChipType,
    pub instance_id: u8,
    pub i2c: Option<OptigaIfaceI2c>,
    pub uart: Option<OptigaIfaceUart>,
    /// Data link frame size negotiated with the chip
    pub frame_size: u16,
    /// Default protection level of new command instances
    pub protection_level: u8,
    pub protocol_version: u8,
    /// Datastore slot of the hibernate context handle, `OPTIGA_DATASTORE_NOT_CONFIGURED` to disable
    pub datastore_id: u16,
    /// Directory backing the datastore; kept in memory when `None`
    pub datastore_path: Option<String>,
} // pub struct OptigaCommsCfg

/// Sequence of a chained hash operation
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum HashSequence {
    Start = 0x00,
    StartFinal = 0x01,
    Continue = 0x02,
    Final = 0x03,
}

/// Sequence of a symmetric encrypt/decrypt/MAC operation
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SymSequence {
    Start = 0x00,
    StartFinal = 0x01,
    Continue = 0x02,
    Final = 0x03,
}

/// Symmetric encryption and MAC modes supported by the chip
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SymmetricMode {
    Ecb = 0x08,
    Cbc = 0x09,
    CbcMac = 0x0A,
    Cmac = 0x0B,
    Ccm = 0x0C,
    HmacSha256 = 0x20,
    HmacSha384 = 0x21,
    HmacSha512 = 0x22,
}

impl SymmetricMode {
    pub fn is_hmac(self) -> bool {
        matches!(
            self,
            SymmetricMode::HmacSha256 | SymmetricMode::HmacSha384 | SymmetricMode::HmacSha512
        )
    }

    /// MAC modes produce output only on the final fragment
    pub fn is_mac(self) -> bool {
        self.is_hmac() || matches!(self, SymmetricMode::Cmac | SymmetricMode::CbcMac)
    }

    pub fn block_size(self) -> u16 {
        match self {
            SymmetricMode::Ecb | SymmetricMode::Cbc | SymmetricMode::CbcMac | SymmetricMode::Cmac => {
                0x10
            }
            _ => 0x01,
        }
    }
}

/// Kind of symmetric operation carried in the APDU info byte
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SymOperation {
    Decrypt = 0x00,
    Encrypt = 0x01,
    Hmac = 0x02,
    ClearAutoState = 0x03,
}

/// Asymmetric key algorithms (ECC curves and RSA key sizes)
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum KeyAlgorithm {
    EccNistP256 = 0x03,
    EccNistP384 = 0x04,
    EccNistP521 = 0x05,
    EccBrainpoolP256r1 = 0x13,
    EccBrainpoolP384r1 = 0x15,
    EccBrainpoolP512r1 = 0x16,
    Rsa1024 = 0x41,
    Rsa2048 = 0x42,
}

impl KeyAlgorithm {
    pub fn from_u8(value: u8) -> Option<KeyAlgorithm> {
        match value {
            0x03 => Some(KeyAlgorithm::EccNistP256),
            0x04 => Some(KeyAlgorithm::EccNistP384),
            0x05 => Some(KeyAlgorithm::EccNistP521),
            0x13 => Some(KeyAlgorithm::EccBrainpoolP256r1),
            0x15 => Some(KeyAlgorithm::EccBrainpoolP384r1),
            0x16 => Some(KeyAlgorithm::EccBrainpoolP512r1),
            0x41 => Some(KeyAlgorithm::Rsa1024),
            0x42 => Some(KeyAlgorithm::Rsa2048),
            _ => None,
        }
    }

    /// Length of the private key TLV the chip returns on export
    pub fn private_key_length(self) -> u16 {
        match self {
            KeyAlgorithm::EccNistP256 | KeyAlgorithm::EccBrainpoolP256r1 => 0x22,
            KeyAlgorithm::EccNistP384 | KeyAlgorithm::EccBrainpoolP384r1 => 0x32,
            KeyAlgorithm::EccNistP521 => 0x44,
            KeyAlgorithm::EccBrainpoolP512r1 => 0x42,
            KeyAlgorithm::Rsa1024 => 0x83,
            KeyAlgorithm::Rsa2048 => 0x104,
        }
    }
}

/// AES key sizes for symmetric key generation
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SymmetricKeyType {
    Aes128 = 0x81,
    Aes192 = 0x82,
    Aes256 = 0x83,
}

/// Hash algorithm identifiers
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum HashType {
    Sha256 = 0xE2,
}

/// Manifest/fragment tag of a protected update sequence
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProtectedUpdateTag {
    Start = 0x00,
    Final = 0x01,
    Continue = 0x02,
}

/// Session context handling requested from the shielded connection on open/close
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ManageContext {
    Restore = 0x11,
    Save = 0x22,
    None = 0x33,
}

/// Shielded connection options settable per command instance
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ShieldedOption {
    ProtectionLevel(u8),
    ProtocolVersion(u8),
    ManageContext(ManageContext),
}

/// Key usage flags for key generation
pub mod key_usage {
    pub const AUTHENTICATION: u8 = 0x01;
    pub const ENCRYPTION: u8 = 0x02;
    pub const SIGN: u8 = 0x10;
    pub const KEY_AGREEMENT: u8 = 0x20;
}

/// A caller owned output buffer with a fixed capacity.
/// Handlers never write more than `capacity` bytes and never truncate silently.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl OutBuffer {
    pub fn with_capacity(capacity: usize) -> OutBuffer {
        OutBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Replaces the content; fails without touching the buffer if `src` does not fit
    pub(crate) fn fill(&mut self, src: &[u8]) -> Result<(), OptigaStatus> {
        if src.len() > self.capacity {
            return Err(OptigaStatus::CmdMemoryInsufficient);
        }
        self.data.clear();
        self.data.extend_from_slice(src);
        Ok(())
    }

    /// Appends; fails without touching the buffer if the result would not fit
    pub(crate) fn append(&mut self, src: &[u8]) -> Result<(), OptigaStatus> {
        if self.data.len() + src.len() > self.capacity {
            return Err(OptigaStatus::CmdMemoryInsufficient);
        }
        self.data.extend_from_slice(src);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// Parameters of OpenApplication
#[derive(Clone, Debug, Default)]
pub struct OpenAppParams {
    /// Restore the shielded connection context saved by a hibernating close
    pub hibernate: bool,
}

/// Parameters of CloseApplication
#[derive(Clone, Debug, Default)]
pub struct CloseAppParams {
    /// Save the shielded connection context handle returned by the chip
    pub hibernate: bool,
}

/// Parameters of GetDataObject
#[derive(Clone, Debug)]
pub struct GetDataObjectParams {
    pub oid: u16,
    pub offset: u16,
    /// Bytes requested in total
    pub bytes_to_read: u16,
    /// Read the object metadata instead of its data
    pub read_metadata: bool,
    /// Receives the data; its capacity bounds how much may be returned
    pub buffer: OutBuffer,
    pub(crate) accumulated_size: u16,
    pub(crate) last_read_size: u16,
}

impl GetDataObjectParams {
    pub fn new(oid: u16, offset: u16, bytes_to_read: u16) -> GetDataObjectParams {
        GetDataObjectParams {
            oid,
            offset,
            bytes_to_read,
            read_metadata: false,
            buffer: OutBuffer::with_capacity(bytes_to_read as usize),
            accumulated_size: 0,
            last_read_size: 0,
        }
    }

    pub fn metadata(oid: u16, capacity: u16) -> GetDataObjectParams {
        GetDataObjectParams {
            read_metadata: true,
            ..GetDataObjectParams::new(oid, 0, capacity)
        }
    }
}

/// How SetDataObject applies the data
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WriteMode {
    /// Write data at the offset (0x40 erase-and-write is a separate mode)
    Write = 0x00,
    /// Write metadata
    Metadata = 0x01,
    /// Increment a counter object by `count`
    Count = 0x02,
    EraseAndWrite = 0x40,
}

/// Parameters of SetDataObject
#[derive(Clone, Debug)]
pub struct SetDataObjectParams {
    pub oid: u16,
    pub offset: u16,
    pub mode: WriteMode,
    pub data: Vec<u8>,
    /// Counter increment, only for [`WriteMode::Count`]
    pub count: u8,
    pub(crate) written_size: u16,
}

impl SetDataObjectParams {
    pub fn new(oid: u16, offset: u16, mode: WriteMode, data: Vec<u8>) -> SetDataObjectParams {
        SetDataObjectParams {
            oid,
            offset,
            mode,
            data,
            count: 0,
            written_size: 0,
        }
    }

    pub fn count(oid: u16, count: u8) -> SetDataObjectParams {
        SetDataObjectParams {
            count,
            ..SetDataObjectParams::new(oid, 0, WriteMode::Count, Vec::new())
        }
    }
}

/// Kind of random requested from the chip
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RandomType {
    Trng = 0x00,
    Drng = 0x01,
    /// RSA pre-master secret kept in the session
    PreMasterSecret = 0x04,
}

/// Parameters of GetRandom
#[derive(Clone, Debug)]
pub struct GetRandomParams {
    pub random_type: RandomType,
    pub length: u16,
    pub random: OutBuffer,
    /// Keep the random in the acquired session (pre-master secret)
    pub store_in_session: bool,
    pub optional_data: Vec<u8>,
}

impl GetRandomParams {
    pub fn new(random_type: RandomType, length: u16) -> GetRandomParams {
        GetRandomParams {
            random_type,
            length,
            random: OutBuffer::with_capacity(length as usize),
            store_in_session: false,
            optional_data: Vec::new(),
        }
    }
}

/// Parameters of CalcHash
#[derive(Clone, Debug)]
pub struct CalcHashParams {
    pub hash_type: HashType,
    pub sequence: HashSequence,
    pub data: Option<Vec<u8>>,
    /// Hash a data object instead of host data: (oid, offset, length)
    pub data_object: Option<(u16, u16, u16)>,
    /// Intermediate context to import (apparent length tracked internally)
    pub context: Option<Vec<u8>>,
    /// Export the intermediate context into this buffer
    pub export_context: Option<OutBuffer>,
    /// Final digest
    pub digest: Option<OutBuffer>,
    pub(crate) data_sent: u32,
    pub(crate) apparent_context_size: u16,
    pub(crate) current_sequence: u8,
}

impl CalcHashParams {
    pub fn new(hash_type: HashType, sequence: HashSequence) -> CalcHashParams {
        CalcHashParams {
            hash_type,
            sequence,
            data: None,
            data_object: None,
            context: None,
            export_context: None,
            digest: None,
            data_sent: 0,
            apparent_context_size: 0,
            current_sequence: sequence as u8,
        }
    }
}

/// Signature schemes of CalcSign and VerifySign
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SignatureScheme {
    RsaSsaPkcs1V15Sha256 = 0x01,
    RsaSsaPkcs1V15Sha384 = 0x02,
    RsaSsaPkcs1V15Sha512 = 0x03,
    EcdsaFips186_3WithoutHash = 0x11,
}

/// Parameters of CalcSign
#[derive(Clone, Debug)]
pub struct CalcSignParams {
    pub scheme: SignatureScheme,
    pub digest: Vec<u8>,
    /// Private key object; `KEY_ID_SESSION_BASED` selects the acquired session
    pub private_key_oid: u16,
    pub signature: OutBuffer,
}

/// Public key source of VerifySign / EncryptAsym
#[derive(Clone, Debug, PartialEq)]
pub enum PublicKeySource {
    /// Certificate or public key object on the chip
    Oid(u16),
    /// Host supplied key: (algorithm, encoded public key)
    Host(KeyAlgorithm, Vec<u8>),
}

/// Parameters of VerifySign
#[derive(Clone, Debug)]
pub struct VerifySignParams {
    pub scheme: SignatureScheme,
    pub digest: Vec<u8>,
    pub signature: Vec<u8>,
    pub public_key: PublicKeySource,
}

/// Parameters of CalcSSec (ECDH)
#[derive(Clone, Debug)]
pub struct CalcSsecParams {
    pub private_key_oid: u16,
    pub algorithm: KeyAlgorithm,
    pub public_key: Vec<u8>,
    /// `Some` exports the shared secret, `None` stores it in the session
    pub shared_secret: Option<OutBuffer>,
}

/// Key derivation functions of DeriveKey
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum KeyDerivation {
    TlsPrfSha256 = 0x01,
    TlsPrfSha384 = 0x02,
    TlsPrfSha512 = 0x03,
    HkdfSha256 = 0x08,
    HkdfSha384 = 0x09,
    HkdfSha512 = 0x0A,
}

/// Parameters of DeriveKey
#[derive(Clone, Debug)]
pub struct DeriveKeyParams {
    pub derivation: KeyDerivation,
    pub input_secret_oid: u16,
    pub label: Vec<u8>,
    pub random: Vec<u8>,
    pub info: Vec<u8>,
    pub derived_key_length: u16,
    /// `Some` exports the derived key, `None` stores it in the session
    pub derived_key: Option<OutBuffer>,
}

/// Parameters of GenKeyPair
#[derive(Clone, Debug)]
pub struct GenKeyPairParams {
    pub algorithm: KeyAlgorithm,
    pub key_usage: u8,
    /// Private key object; `KEY_ID_SESSION_BASED` stores it in the session
    pub private_key_oid: u16,
    /// `Some` exports the private key instead of storing it
    pub private_key: Option<OutBuffer>,
    pub public_key: OutBuffer,
}

/// RSA encryption schemes
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RsaEncryptionScheme {
    RsaesPkcs1V15 = 0x11,
}

/// Parameters of EncryptAsym
#[derive(Clone, Debug)]
pub struct EncryptAsymParams {
    pub scheme: RsaEncryptionScheme,
    /// Message to encrypt; `None` encrypts the session content (pre-master secret)
    pub message: Option<Vec<u8>>,
    pub public_key: PublicKeySource,
    pub encrypted: OutBuffer,
}

/// Parameters of DecryptAsym
#[derive(Clone, Debug)]
pub struct DecryptAsymParams {
    pub scheme: RsaEncryptionScheme,
    pub message: Vec<u8>,
    pub private_key_oid: u16,
    /// `Some` exports the plaintext, `None` keeps it in the session
    pub decrypted: Option<OutBuffer>,
}

/// Parameters of the symmetric encrypt/decrypt/HMAC family
#[derive(Clone, Debug)]
pub struct SymParams {
    pub mode: SymmetricMode,
    pub operation: SymOperation,
    pub sequence: SymSequence,
    /// Key object; `KEY_ID_SESSION_BASED` selects the acquired session
    pub key_oid: u16,
    pub in_data: Vec<u8>,
    pub iv: Vec<u8>,
    pub associated_data: Vec<u8>,
    pub total_input_length: u16,
    /// Reference MAC for HMAC/CMAC verification (decrypt only)
    pub generated_hmac: Vec<u8>,
    pub out_data: Option<OutBuffer>,
    /// Set when dispatched as DecryptSym
    pub(crate) decrypt: bool,
    pub(crate) sent_length: u32,
    pub(crate) current_sequence: u8,
}

impl SymParams {
    pub fn new(
        mode: SymmetricMode,
        operation: SymOperation,
        sequence: SymSequence,
        key_oid: u16,
        in_data: Vec<u8>,
    ) -> SymParams {
        SymParams {
            mode,
            operation,
            sequence,
            key_oid,
            in_data,
            iv: Vec::new(),
            associated_data: Vec::new(),
            total_input_length: 0,
            generated_hmac: Vec::new(),
            out_data: None,
            decrypt: false,
            sent_length: 0,
            current_sequence: RESET_SEQUENCE,
        }
    }
}

/// Parameters of SetObjectProtected
#[derive(Clone, Debug)]
pub struct SetObjectProtectedParams {
    /// Manifest format version, sent as the APDU parameter
    pub manifest_version: u8,
    pub tag: ProtectedUpdateTag,
    /// Manifest or fragment; `None` with `Final` only releases the strict lock
    pub buffer: Option<Vec<u8>>,
}

/// Parameters of GenSymKey
#[derive(Clone, Debug)]
pub struct GenSymKeyParams {
    pub key_type: SymmetricKeyType,
    pub key_usage: u8,
    pub key_oid: u16,
    /// `Some` exports the key instead of storing it in `key_oid`
    pub exported_key: Option<OutBuffer>,
}
