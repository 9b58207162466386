use serial_test::serial;

// Types
use super::super::{
    CalcHashParams, CalcSignParams, CalcSsecParams, CloseAppParams, CmdHandle, DecryptAsymParams,
    DeriveKeyParams, EncryptAsymParams, GenKeyPairParams, GenSymKeyParams, GetDataObjectParams,
    GetRandomParams, HashSequence, HashType, KeyAlgorithm, KeyDerivation, OpenAppParams,
    OptigaCommsCfg, OptigaContext, OptigaStatus, OutBuffer, ProtectedUpdateTag, PublicKeySource,
    RandomType, RsaEncryptionScheme, SetDataObjectParams, SetObjectProtectedParams,
    SignatureScheme, SymOperation, SymParams, SymSequence, SymmetricKeyType, SymmetricMode,
    VerifySignParams,
};
// Constants
use super::super::{
    OPTIGA_CMD_MAX_REGISTRATIONS, OPTIGA_CMD_SESSION_BASE_OID, OPTIGA_HIBERNATE_CONTEXT_ID,
    OPTIGA_KEY_ID_SESSION_BASED,
};
// Functions
use super::super::setup_optiga_context;
use super::{complete, read_object, recording_instance, write_object, Statuses};
// Modules
use super::super::cmd::handlers::Operation;

const SHA256_ABC: [u8; 32] = [
    0xBA, 0x78, 0x16, 0xBF, 0x8F, 0x01, 0xCF, 0xEA, 0x41, 0x41, 0x40, 0xDE, 0x5D, 0xAE, 0x22, 0x23,
    0xB0, 0x03, 0x61, 0xA3, 0x96, 0x17, 0x7A, 0x9C, 0xB4, 0x10, 0xFF, 0x61, 0xF2, 0x00, 0x15, 0xAD,
];

/// Simulated chip context; `chip_type` selects the link behaviour
pub fn test_setup(chip_type: &str) -> OptigaContext {
    let cfg = OptigaCommsCfg::default()
        .set_iface_type("simulator".to_owned())
        .set_chip_type(chip_type.to_owned())
        .set_datastore_id(OPTIGA_HIBERNATE_CONTEXT_ID);
    match setup_optiga_context(cfg) {
        Ok(ctx) => ctx,
        Err(err) => panic!("{}", err),
    }
}

/// Simulated chip context with the application opened by the returned instance
fn opened(chip_type: &str) -> (OptigaContext, CmdHandle, Statuses) {
    let mut ctx = test_setup(chip_type);
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.open_application(handle, OpenAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    (ctx, handle, statuses)
}

fn hash(
    ctx: &mut OptigaContext,
    handle: CmdHandle,
    statuses: &Statuses,
    params: CalcHashParams,
) -> CalcHashParams {
    ctx.calc_hash(handle, params).unwrap();
    assert_eq!(complete(ctx, statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::CalcHash(params) => params,
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

fn sym(
    ctx: &mut OptigaContext,
    handle: CmdHandle,
    statuses: &Statuses,
    params: SymParams,
    decrypt: bool,
) -> Result<Vec<u8>, OptigaStatus> {
    if decrypt {
        ctx.decrypt_sym(handle, params)?;
    } else {
        ctx.encrypt_sym(handle, params)?;
    }
    let status = complete(ctx, statuses);
    if !status.is_success() {
        return Err(status);
    }
    match ctx.take_operation(handle)? {
        Operation::EncryptSym(params) | Operation::DecryptSym(params) => {
            Ok(params.out_data.map(OutBuffer::into_vec).unwrap_or_default())
        }
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

fn cipher(mode: SymmetricMode, sequence: SymSequence, key_oid: u16, data: &[u8]) -> SymParams {
    let mut params = SymParams::new(mode, SymOperation::Encrypt, sequence, key_oid, data.to_vec());
    params.out_data = Some(OutBuffer::with_capacity(data.len()));
    params
}

fn gen_keypair(
    ctx: &mut OptigaContext,
    handle: CmdHandle,
    statuses: &Statuses,
    algorithm: KeyAlgorithm,
    private_key_oid: u16,
) -> Vec<u8> {
    ctx.gen_keypair(
        handle,
        GenKeyPairParams {
            algorithm,
            key_usage: 0x10,
            private_key_oid,
            private_key: None,
            public_key: OutBuffer::with_capacity(300),
        },
    )
    .unwrap();
    assert_eq!(complete(ctx, statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::GenKeyPair(params) => params.public_key.into_vec(),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

fn shared_secret(
    ctx: &mut OptigaContext,
    handle: CmdHandle,
    statuses: &Statuses,
    private_key_oid: u16,
    public_key: &[u8],
) -> Vec<u8> {
    ctx.calc_ssec(
        handle,
        CalcSsecParams {
            private_key_oid,
            algorithm: KeyAlgorithm::EccNistP256,
            public_key: public_key.to_vec(),
            shared_secret: Some(OutBuffer::with_capacity(64)),
        },
    )
    .unwrap();
    assert_eq!(complete(ctx, statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::CalcSsec(params) => params.shared_secret.map(OutBuffer::into_vec).unwrap(),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

fn pre_master_secret(ctx: &mut OptigaContext, handle: CmdHandle, statuses: &Statuses) {
    let mut params = GetRandomParams::new(RandomType::PreMasterSecret, 48);
    params.store_in_session = true;
    ctx.get_random(handle, params).unwrap();
    assert_eq!(complete(ctx, statuses), OptigaStatus::LibSuccess);
}

#[test]
#[serial]
fn commands_need_open_channel() {
    let mut ctx = test_setup("always-success");
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.get_random(handle, GetRandomParams::new(RandomType::Trng, 16))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::CommsError);
}

#[test]
#[serial]
fn open_and_close() {
    let (mut ctx, handle, statuses) = opened("always-success");
    ctx.close_application(handle, CloseAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    assert_eq!(
        read_object(&mut ctx, handle, &statuses, 0xE0C0, 0, 1),
        Err(OptigaStatus::DeviceError(0x0A))
    );
}

#[test]
#[serial]
fn hibernate_keeps_session_content() {
    let (mut ctx, handle, statuses) = opened("always-success");
    pre_master_secret(&mut ctx, handle, &statuses);

    ctx.close_application(handle, CloseAppParams { hibernate: true })
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    ctx.open_application(handle, OpenAppParams { hibernate: true })
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    // the pre-master secret survived in the session context
    ctx.derive_key(
        handle,
        DeriveKeyParams {
            derivation: KeyDerivation::TlsPrfSha256,
            input_secret_oid: OPTIGA_KEY_ID_SESSION_BASED,
            label: b"master secret".to_vec(),
            random: vec![0x5A; 32],
            info: Vec::new(),
            derived_key_length: 48,
            derived_key: Some(OutBuffer::with_capacity(48)),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::DeriveKey(params) => assert_eq!(params.derived_key.unwrap().len(), 48),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

#[test]
#[serial]
fn hibernate_handle_used_once() {
    let (mut ctx, handle, statuses) = opened("always-success");
    ctx.close_application(handle, CloseAppParams { hibernate: true })
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    ctx.open_application(handle, OpenAppParams { hibernate: true })
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    ctx.open_application(handle, OpenAppParams { hibernate: true })
        .unwrap();
    assert!(!complete(&mut ctx, &statuses).is_success());
}

#[test]
#[serial]
fn write_and_read_back_over_many_frames() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let data: Vec<u8> = (0..1400u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1E0, &data),
        OptigaStatus::LibSuccess
    );
    // asking for more than stored ends the read at the object size
    let read = read_object(&mut ctx, handle, &statuses, 0xF1E0, 0, 1500).unwrap();
    assert_eq!(read, data);
    let tail = read_object(&mut ctx, handle, &statuses, 0xF1E0, 1390, 10).unwrap();
    assert_eq!(tail, &data[1390..]);
}

#[test]
#[serial]
fn read_past_end_reports_out_of_boundary() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, &[0x11; 16]),
        OptigaStatus::LibSuccess
    );
    assert_eq!(
        read_object(&mut ctx, handle, &statuses, 0xF1D0, 16, 4),
        Err(OptigaStatus::DeviceError(0x08))
    );
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, &[0x22; 141]),
        OptigaStatus::DeviceError(0x08)
    );
}

#[test]
#[serial]
fn device_error_from_last_error_object() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        read_object(&mut ctx, handle, &statuses, 0xE0F0, 0, 32),
        Err(OptigaStatus::DeviceError(0x07))
    );
    assert_eq!(
        read_object(&mut ctx, handle, &statuses, 0x1234, 0, 4),
        Err(OptigaStatus::DeviceError(0x01))
    );
    // reading the code cleared it; a regular command succeeds again
    assert!(read_object(&mut ctx, handle, &statuses, 0xE0C0, 0, 1).is_ok());
}

#[test]
#[serial]
fn metadata_and_counter() {
    let (mut ctx, handle, statuses) = opened("always-success");
    ctx.get_data_object(handle, GetDataObjectParams::metadata(0xF1D1, 44))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::GetDataObject(params) => assert_eq!(params.buffer.as_slice()[0], 0x20),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }

    ctx.set_data_object(handle, SetDataObjectParams::count(0xE120, 5))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    let counter = read_object(&mut ctx, handle, &statuses, 0xE120, 0, 8).unwrap();
    assert_eq!(counter, vec![0, 0, 0, 5, 0xFF, 0xFF, 0xFF, 0xFF]);
}

#[test]
#[serial]
fn sha256_in_one_go() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::StartFinal);
    params.data = Some(b"abc".to_vec());
    params.digest = Some(OutBuffer::with_capacity(32));
    let params = hash(&mut ctx, handle, &statuses, params);
    assert_eq!(params.digest.unwrap().as_slice(), &SHA256_ABC);
}

#[test]
#[serial]
fn sha256_over_exported_context() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let mut start = CalcHashParams::new(HashType::Sha256, HashSequence::Start);
    start.data = Some(b"ab".to_vec());
    start.export_context = Some(OutBuffer::with_capacity(130));
    let start = hash(&mut ctx, handle, &statuses, start);
    let context = start.export_context.unwrap().into_vec();
    assert_eq!(context.len(), 130);

    let mut last = CalcHashParams::new(HashType::Sha256, HashSequence::Final);
    last.data = Some(b"c".to_vec());
    last.context = Some(context);
    last.digest = Some(OutBuffer::with_capacity(32));
    let last = hash(&mut ctx, handle, &statuses, last);
    assert_eq!(last.digest.unwrap().as_slice(), &SHA256_ABC);
}

#[test]
#[serial]
fn sha256_of_data_object() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D2, b"xxabc"),
        OptigaStatus::LibSuccess
    );
    let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::StartFinal);
    params.data_object = Some((0xF1D2, 2, 3));
    params.digest = Some(OutBuffer::with_capacity(32));
    let params = hash(&mut ctx, handle, &statuses, params);
    assert_eq!(params.digest.unwrap().as_slice(), &SHA256_ABC);
}

#[test]
#[serial]
fn sign_and_verify_with_device_certificate() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let digest = SHA256_ABC.to_vec();
    ctx.calc_sign(
        handle,
        CalcSignParams {
            scheme: SignatureScheme::EcdsaFips186_3WithoutHash,
            digest: digest.clone(),
            private_key_oid: 0xE0F0,
            signature: OutBuffer::with_capacity(72),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    let signature = match ctx.take_operation(handle).unwrap() {
        Operation::CalcSign(params) => params.signature.into_vec(),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    };
    assert_eq!(signature[0], 0x02);

    let verify = |digest: Vec<u8>| VerifySignParams {
        scheme: SignatureScheme::EcdsaFips186_3WithoutHash,
        digest,
        signature: signature.clone(),
        public_key: PublicKeySource::Oid(0xE0E0),
    };
    ctx.verify_sign(handle, verify(digest.clone())).unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    let mut tampered = digest;
    tampered[0] ^= 0x01;
    ctx.verify_sign(handle, verify(tampered)).unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::DeviceError(0x2C));
}

#[test]
#[serial]
fn sign_with_generated_key_verified_by_host_key() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let public_key = gen_keypair(&mut ctx, handle, &statuses, KeyAlgorithm::EccNistP256, 0xE0F1);
    assert_eq!(public_key.len(), 68);
    assert_eq!(&public_key[..4], &[0x03, 0x42, 0x00, 0x04]);

    let digest = vec![0x3C; 32];
    ctx.calc_sign(
        handle,
        CalcSignParams {
            scheme: SignatureScheme::EcdsaFips186_3WithoutHash,
            digest: digest.clone(),
            private_key_oid: 0xE0F1,
            signature: OutBuffer::with_capacity(72),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    let signature = match ctx.take_operation(handle).unwrap() {
        Operation::CalcSign(params) => params.signature.into_vec(),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    };

    ctx.verify_sign(
        handle,
        VerifySignParams {
            scheme: SignatureScheme::EcdsaFips186_3WithoutHash,
            digest,
            signature,
            public_key: PublicKeySource::Host(KeyAlgorithm::EccNistP256, public_key),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
}

#[test]
#[serial]
fn ecdh_secrets_agree() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let alice = gen_keypair(&mut ctx, handle, &statuses, KeyAlgorithm::EccNistP256, 0xE0F1);
    let bob = gen_keypair(&mut ctx, handle, &statuses, KeyAlgorithm::EccNistP256, 0xE0F2);

    let alice_secret = shared_secret(&mut ctx, handle, &statuses, 0xE0F1, &bob);
    let bob_secret = shared_secret(&mut ctx, handle, &statuses, 0xE0F2, &alice);
    assert_eq!(alice_secret.len(), 32);
    assert_eq!(alice_secret, bob_secret);
}

#[test]
#[serial]
fn ecdh_with_session_key() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let peer = gen_keypair(&mut ctx, handle, &statuses, KeyAlgorithm::EccNistP256, 0xE0F2);
    gen_keypair(
        &mut ctx,
        handle,
        &statuses,
        KeyAlgorithm::EccNistP256,
        OPTIGA_KEY_ID_SESSION_BASED,
    );
    assert_eq!(ctx.session_oid(handle), Ok(OPTIGA_CMD_SESSION_BASE_OID));

    let secret = shared_secret(&mut ctx, handle, &statuses, OPTIGA_KEY_ID_SESSION_BASED, &peer);
    assert_eq!(secret.len(), 32);
    ctx.release_session(handle).unwrap();
    assert_eq!(ctx.sessions_in_use(), 0);
}

#[test]
#[serial]
fn hkdf_sha256_vector() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, &[0x0B; 22]),
        OptigaStatus::LibSuccess
    );
    ctx.derive_key(
        handle,
        DeriveKeyParams {
            derivation: KeyDerivation::HkdfSha256,
            input_secret_oid: 0xF1D0,
            label: Vec::new(),
            random: (0x00..=0x0C).collect(),
            info: (0xF0..=0xF9).collect(),
            derived_key_length: 42,
            derived_key: Some(OutBuffer::with_capacity(42)),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    let okm = match ctx.take_operation(handle).unwrap() {
        Operation::DeriveKey(params) => params.derived_key.unwrap().into_vec(),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    };
    assert_eq!(
        okm,
        vec![
            0x3C, 0xB2, 0x5F, 0x25, 0xFA, 0xAC, 0xD5, 0x7A, 0x90, 0x43, 0x4F, 0x64, 0xD0, 0x36,
            0x2F, 0x2A, 0x2D, 0x2D, 0x0A, 0x90, 0xCF, 0x1A, 0x5A, 0x4C, 0x5D, 0xB0, 0x2D, 0x56,
            0xEC, 0xC4, 0xC5, 0xBF, 0x34, 0x00, 0x72, 0x08, 0xD5, 0xB8, 0x87, 0x18, 0x58, 0x65,
        ]
    );
}

#[test]
#[serial]
fn short_derived_key_is_cut() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, &[0x0B; 32]),
        OptigaStatus::LibSuccess
    );
    ctx.derive_key(
        handle,
        DeriveKeyParams {
            derivation: KeyDerivation::TlsPrfSha256,
            input_secret_oid: 0xF1D0,
            label: b"key expansion".to_vec(),
            random: vec![0x01; 32],
            info: Vec::new(),
            derived_key_length: 8,
            derived_key: Some(OutBuffer::with_capacity(8)),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::DeriveKey(params) => assert_eq!(params.derived_key.unwrap().len(), 8),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

#[test]
#[serial]
fn rsa_encrypt_then_decrypt() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let public_key = gen_keypair(&mut ctx, handle, &statuses, KeyAlgorithm::Rsa1024, 0xE0FC);
    let message = b"premaster".to_vec();

    ctx.encrypt_asym(
        handle,
        EncryptAsymParams {
            scheme: RsaEncryptionScheme::RsaesPkcs1V15,
            message: Some(message.clone()),
            public_key: PublicKeySource::Host(KeyAlgorithm::Rsa1024, public_key),
            encrypted: OutBuffer::with_capacity(128),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    let encrypted = match ctx.take_operation(handle).unwrap() {
        Operation::EncryptAsym(params) => params.encrypted.into_vec(),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    };
    assert_ne!(encrypted, message);

    ctx.decrypt_asym(
        handle,
        DecryptAsymParams {
            scheme: RsaEncryptionScheme::RsaesPkcs1V15,
            message: encrypted,
            private_key_oid: 0xE0FC,
            decrypted: Some(OutBuffer::with_capacity(128)),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::DecryptAsym(params) => assert_eq!(params.decrypted.unwrap().into_vec(), message),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

#[test]
#[serial]
fn symmetric_round_trip() {
    let (mut ctx, handle, statuses) = opened("always-success");
    ctx.gen_symkey(
        handle,
        GenSymKeyParams {
            key_type: SymmetricKeyType::Aes128,
            key_usage: 0x02,
            key_oid: 0xE200,
            exported_key: None,
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    let plain: Vec<u8> = (0..64u8).collect();
    let mut params = cipher(SymmetricMode::Cbc, SymSequence::StartFinal, 0xE200, &plain);
    params.iv = vec![0xA5; 16];
    let encrypted = sym(&mut ctx, handle, &statuses, params, false).unwrap();
    assert_eq!(encrypted.len(), plain.len());
    assert_ne!(encrypted, plain);

    let mut params = cipher(SymmetricMode::Cbc, SymSequence::StartFinal, 0xE200, &encrypted);
    params.operation = SymOperation::Decrypt;
    params.iv = vec![0xA5; 16];
    let decrypted = sym(&mut ctx, handle, &statuses, params, true).unwrap();
    assert_eq!(decrypted, plain);
}

#[test]
#[serial]
fn symmetric_sequence_matches_one_shot() {
    let (mut ctx, handle, statuses) = opened("always-success");
    ctx.gen_symkey(
        handle,
        GenSymKeyParams {
            key_type: SymmetricKeyType::Aes256,
            key_usage: 0x02,
            key_oid: 0xE200,
            exported_key: None,
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    let plain = vec![0x42; 96];
    let one_shot = sym(
        &mut ctx,
        handle,
        &statuses,
        cipher(SymmetricMode::Ecb, SymSequence::StartFinal, 0xE200, &plain),
        false,
    )
    .unwrap();

    let mut pieces = Vec::new();
    for (sequence, chunk) in [SymSequence::Start, SymSequence::Continue, SymSequence::Final]
        .iter()
        .zip(plain.chunks(32))
    {
        let out = sym(
            &mut ctx,
            handle,
            &statuses,
            cipher(SymmetricMode::Ecb, *sequence, 0xE200, chunk),
            false,
        )
        .unwrap();
        pieces.extend(out);
    }
    assert_eq!(pieces, one_shot);
}

#[test]
#[serial]
fn strict_lock_holds_off_other_instances() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, &[0x77; 16]),
        OptigaStatus::LibSuccess
    );
    let data = vec![0x10; 32];
    sym(
        &mut ctx,
        handle,
        &statuses,
        cipher(SymmetricMode::Ecb, SymSequence::Start, 0xF1D0, &data),
        false,
    )
    .unwrap();

    let (other, other_statuses) = recording_instance(&mut ctx);
    ctx.get_random(other, GetRandomParams::new(RandomType::Trng, 16))
        .unwrap();
    assert_eq!(ctx.run_until_idle(), Err(OptigaStatus::Busy));
    assert!(other_statuses.borrow().is_empty());

    ctx.encrypt_sym(
        handle,
        cipher(SymmetricMode::Ecb, SymSequence::Final, 0xF1D0, &data),
    )
    .unwrap();
    ctx.run_until_idle().unwrap();
    assert_eq!(statuses.borrow().last(), Some(&OptigaStatus::LibSuccess));
    assert_eq!(*other_statuses.borrow(), vec![OptigaStatus::LibSuccess]);
}

#[test]
#[serial]
fn continue_without_start_rejected() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        sym(
            &mut ctx,
            handle,
            &statuses,
            cipher(SymmetricMode::Ecb, SymSequence::Continue, 0xF1D0, &[0; 16]),
            false,
        ),
        Err(OptigaStatus::CmdInvalidInput)
    );
}

#[test]
#[serial]
fn hmac_generate_verify_and_clear() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, b"Jefe"),
        OptigaStatus::LibSuccess
    );
    let message = b"what do ya want for nothing?".to_vec();
    let mut params = SymParams::new(
        SymmetricMode::HmacSha256,
        SymOperation::Hmac,
        SymSequence::StartFinal,
        0xF1D0,
        message.clone(),
    );
    params.out_data = Some(OutBuffer::with_capacity(32));
    let mac = sym(&mut ctx, handle, &statuses, params, false).unwrap();
    assert_eq!(
        mac,
        vec![
            0x5B, 0xDC, 0xC1, 0x46, 0xBF, 0x60, 0x75, 0x4E, 0x6A, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xC7, 0x5A, 0x00, 0x3F, 0x08, 0x9D, 0x27, 0x39, 0x83, 0x9D, 0xEC, 0x58, 0xB9,
            0x64, 0xEC, 0x38, 0x43,
        ]
    );

    let verify = |generated_hmac: Vec<u8>| {
        let mut params = SymParams::new(
            SymmetricMode::HmacSha256,
            SymOperation::Hmac,
            SymSequence::StartFinal,
            0xF1D0,
            message.clone(),
        );
        params.generated_hmac = generated_hmac;
        params
    };
    pre_master_secret(&mut ctx, handle, &statuses);
    assert!(sym(&mut ctx, handle, &statuses, verify(mac.clone()), true).is_ok());
    // verification gives the session back
    assert_eq!(ctx.sessions_in_use(), 0);

    let mut wrong = mac;
    wrong[31] ^= 0xFF;
    pre_master_secret(&mut ctx, handle, &statuses);
    assert_eq!(
        sym(&mut ctx, handle, &statuses, verify(wrong), true),
        Err(OptigaStatus::DeviceError(0x2C))
    );
    assert_eq!(ctx.sessions_in_use(), 0);

    let clear = SymParams::new(
        SymmetricMode::HmacSha256,
        SymOperation::ClearAutoState,
        SymSequence::StartFinal,
        0xF1D0,
        Vec::new(),
    );
    assert!(sym(&mut ctx, handle, &statuses, clear, true).is_ok());
}

#[test]
#[serial]
fn truncated_mac() {
    let (mut ctx, handle, statuses) = opened("always-success");
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1D0, b"Jefe"),
        OptigaStatus::LibSuccess
    );
    let mut params = SymParams::new(
        SymmetricMode::HmacSha256,
        SymOperation::Hmac,
        SymSequence::StartFinal,
        0xF1D0,
        b"what do ya want for nothing?".to_vec(),
    );
    params.out_data = Some(OutBuffer::with_capacity(16));
    let mac = sym(&mut ctx, handle, &statuses, params, false).unwrap();
    assert_eq!(&mac[..4], &[0x5B, 0xDC, 0xC1, 0x46]);
    assert_eq!(mac.len(), 16);
}

#[test]
#[serial]
fn protected_update_writes_target() {
    let (mut ctx, handle, statuses) = opened("always-success");
    let update = |tag, buffer: &[u8]| SetObjectProtectedParams {
        manifest_version: 0x01,
        tag,
        buffer: Some(buffer.to_vec()),
    };
    ctx.set_object_protected(handle, update(ProtectedUpdateTag::Start, &[0xF1, 0xD3]))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    ctx.set_object_protected(handle, update(ProtectedUpdateTag::Continue, &[0x01; 60]))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    ctx.set_object_protected(handle, update(ProtectedUpdateTag::Final, &[0x02; 20]))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    let mut expected = vec![0x01; 60];
    expected.extend_from_slice(&[0x02; 20]);
    assert_eq!(
        read_object(&mut ctx, handle, &statuses, 0xF1D3, 0, 140).unwrap(),
        expected
    );
}

#[test]
#[serial]
fn symmetric_key_exported() {
    let (mut ctx, handle, statuses) = opened("always-success");
    ctx.gen_symkey(
        handle,
        GenSymKeyParams {
            key_type: SymmetricKeyType::Aes192,
            key_usage: 0x02,
            key_oid: 0xE200,
            exported_key: Some(OutBuffer::with_capacity(32)),
        },
    )
    .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::GenSymKey(params) => assert_eq!(params.exported_key.unwrap().len(), 24),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

#[test]
#[serial]
fn sessions_shared_between_instances() {
    let mut ctx = test_setup("always-success");
    let instances: Vec<_> = (0..OPTIGA_CMD_MAX_REGISTRATIONS - 2)
        .map(|_| recording_instance(&mut ctx))
        .collect();
    let (first, first_statuses) = &instances[0];
    ctx.open_application(*first, OpenAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, first_statuses), OptigaStatus::LibSuccess);

    for (handle, statuses) in instances.iter() {
        pre_master_secret(&mut ctx, *handle, statuses);
    }
    let oids: Vec<u16> = instances
        .iter()
        .map(|(handle, _)| ctx.session_oid(*handle).unwrap())
        .collect();
    assert_eq!(oids, vec![0xE100, 0xE101, 0xE102, 0xE103]);
    assert_eq!(ctx.sessions_in_use(), 4);

    ctx.destroy(instances[1].0).unwrap();
    assert_eq!(ctx.sessions_in_use(), 3);
}

#[test]
#[serial]
fn lossy_link_recovers() {
    let (mut ctx, handle, statuses) = opened("lossy-link");
    let data: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
    assert_eq!(
        write_object(&mut ctx, handle, &statuses, 0xF1E1, &data),
        OptigaStatus::LibSuccess
    );
    assert_eq!(
        read_object(&mut ctx, handle, &statuses, 0xF1E1, 0, 600).unwrap(),
        data
    );
}

#[test]
#[serial]
fn failing_link_reported() {
    let mut ctx = test_setup("always-fail");
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.open_application(handle, OpenAppParams::default())
        .unwrap();
    let status = complete(&mut ctx, &statuses);
    assert!(
        matches!(status, OptigaStatus::CommsError | OptigaStatus::CommsFatal),
        "unexpected status {:?}",
        status
    );
}

#[test]
#[serial]
fn one_context_per_instance() {
    let _ctx = test_setup("always-success");
    let cfg = OptigaCommsCfg::default()
        .set_iface_type("simulator".to_owned())
        .set_chip_type("always-success".to_owned());
    assert!(setup_optiga_context(cfg).is_err());
}

#[test]
#[serial]
fn bad_frame_size_rejected() {
    let cfg = OptigaCommsCfg::default()
        .set_iface_type("simulator".to_owned())
        .set_frame_size(4);
    assert!(setup_optiga_context(cfg).is_err());
}
