//! Tests against a chip on a real bus, configured in `config.toml`.
//! Run with `cargo test -- --ignored` on a board with the chip attached.

use serial_test::serial;
use std::fs::read_to_string;
use std::path::Path;

// Types
use super::super::{
    CalcHashParams, CloseAppParams, GetRandomParams, HashSequence, HashType, OpenAppParams,
    OptigaContext, OptigaIfaceType, OptigaStatus, OutBuffer, RandomType,
};
// Functions
use super::super::setup_optiga_context;
use super::{complete, read_object, recording_instance, TestConfig};
// Modules
use super::super::cmd::handlers::Operation;

const SHA256_EMPTY: [u8; 32] = [
    0xE3, 0xB0, 0xC4, 0x42, 0x98, 0xFC, 0x1C, 0x14, 0x9A, 0xFB, 0xF4, 0xC8, 0x99, 0x6F, 0xB9, 0x24,
    0x27, 0xAE, 0x41, 0xE4, 0x64, 0x9B, 0x93, 0x4C, 0xA4, 0x95, 0x99, 0x1B, 0x78, 0x52, 0xB8, 0x55,
];

fn load_config(config_path: &str) -> TestConfig {
    let config_path = Path::new(config_path);
    let config_string = read_to_string(config_path).expect("file not found");
    toml::from_str(&config_string).unwrap()
}

/// Chip context for the bus named in `config.toml`
pub fn test_setup() -> OptigaContext {
    let cfg = load_config("config.toml").comms_cfg();
    assert_ne!(cfg.iface_type, OptigaIfaceType::Unknown);

    match setup_optiga_context(cfg) {
        Ok(ctx) => ctx,
        Err(err) => panic!("{}", err),
    }
}

#[test]
#[serial]
fn config_file_present() {
    let config = load_config("config.toml");
    assert_eq!(config.device.iface_type, "i2c");
    assert!(config.interface.is_some());
}

#[test]
#[serial]
#[ignore]
fn open_and_close() {
    let mut ctx = test_setup();
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.open_application(handle, OpenAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    ctx.close_application(handle, CloseAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
}

#[test]
#[serial]
#[ignore]
fn random_and_identity() {
    let mut ctx = test_setup();
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.open_application(handle, OpenAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    ctx.get_random(handle, GetRandomParams::new(RandomType::Trng, 32))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::GetRandom(params) => assert_eq!(params.random.len(), 32),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }

    let uid = read_object(&mut ctx, handle, &statuses, 0xE0C2, 0, 27).unwrap();
    assert_eq!(uid.len(), 27);
}

#[test]
#[serial]
#[ignore]
fn sha256_of_nothing() {
    let mut ctx = test_setup();
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.open_application(handle, OpenAppParams::default())
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);

    let mut params = CalcHashParams::new(HashType::Sha256, HashSequence::StartFinal);
    params.data = Some(Vec::new());
    params.digest = Some(OutBuffer::with_capacity(32));
    ctx.calc_hash(handle, params).unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::CalcHash(params) => {
            assert_eq!(params.digest.unwrap().as_slice(), &SHA256_EMPTY)
        }
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}
