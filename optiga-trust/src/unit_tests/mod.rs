use serial_test::serial;
use std::cell::RefCell;
use std::rc::Rc;

// Types
#[allow(unused_imports)]
use super::{
    CmdHandle, GetDataObjectParams, GetRandomParams, OpenAppParams, OptigaCommsCfg,
    OptigaContext, OptigaStatus, RandomType, SetDataObjectParams, WriteMode,
};
// Functions
#[allow(unused_imports)]
use super::setup_optiga_context;
// Modules
#[allow(unused_imports)]
use super::cmd::handlers::Operation;

#[cfg(feature = "hardware-backend")]
mod hw_backend;
mod sw_backend;

/// Completion statuses collected by an instance callback
pub type Statuses = Rc<RefCell<Vec<OptigaStatus>>>;

/// Creates a command instance recording every completion it is told about
pub fn recording_instance(ctx: &mut OptigaContext) -> (CmdHandle, Statuses) {
    let statuses: Statuses = Rc::new(RefCell::new(Vec::new()));
    let sink = statuses.clone();
    let handle = ctx
        .create(move |status| sink.borrow_mut().push(status))
        .expect("no free command slot");
    (handle, statuses)
}

/// Drives the context until the started operation completed, returns its status
pub fn complete(ctx: &mut OptigaContext, statuses: &Statuses) -> OptigaStatus {
    let before = statuses.borrow().len();
    ctx.run_until_idle().expect("scheduler stalled");
    let reported = statuses.borrow();
    assert_eq!(reported.len(), before + 1, "exactly one completion expected");
    reported[before]
}

/// Reads `length` bytes of an object, `Err` carries the completion status
pub fn read_object(
    ctx: &mut OptigaContext,
    handle: CmdHandle,
    statuses: &Statuses,
    oid: u16,
    offset: u16,
    length: u16,
) -> Result<Vec<u8>, OptigaStatus> {
    ctx.get_data_object(handle, GetDataObjectParams::new(oid, offset, length))?;
    let status = complete(ctx, statuses);
    if !status.is_success() {
        return Err(status);
    }
    match ctx.take_operation(handle)? {
        Operation::GetDataObject(params) => Ok(params.buffer.into_vec()),
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

pub fn write_object(
    ctx: &mut OptigaContext,
    handle: CmdHandle,
    statuses: &Statuses,
    oid: u16,
    data: &[u8],
) -> OptigaStatus {
    ctx.set_data_object(
        handle,
        SetDataObjectParams::new(oid, 0, WriteMode::EraseAndWrite, data.to_vec()),
    )
    .expect("write not started");
    complete(ctx, statuses)
}

fn open_context() -> (OptigaContext, CmdHandle, Statuses) {
    let mut ctx = sw_backend::test_setup("always-success");
    let (handle, statuses) = recording_instance(&mut ctx);
    ctx.open_application(handle, OpenAppParams::default())
        .expect("open not started");
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    (ctx, handle, statuses)
}

#[test]
#[serial]
fn random() {
    let (mut ctx, handle, statuses) = open_context();
    ctx.get_random(handle, GetRandomParams::new(RandomType::Trng, 32))
        .unwrap();
    assert_eq!(complete(&mut ctx, &statuses), OptigaStatus::LibSuccess);
    match ctx.take_operation(handle).unwrap() {
        Operation::GetRandom(params) => {
            assert_eq!(params.random.len(), 32);
            assert!(params.random.as_slice().iter().any(|b| *b != 0));
        }
        other => panic!("unexpected operation {:?}", other.apdu_info()),
    }
}

#[test]
#[serial]
fn read_life_cycle_status() {
    let (mut ctx, handle, statuses) = open_context();
    let lcso = read_object(&mut ctx, handle, &statuses, 0xE0C0, 0, 1).unwrap();
    assert_eq!(lcso.len(), 1);
    let uid = read_object(&mut ctx, handle, &statuses, 0xE0C2, 0, 27).unwrap();
    assert_eq!(uid.len(), 27);
}

#[test]
#[serial]
fn config_file_parsed() {
    let config: TestConfig = toml::from_str(
        r#"
        [device]
        iface_type = "simulator"
        chip_type = "lossy-link"
        frame_size = 128

        [interface]
        bus = 1
        slave_address = 0x30
        "#,
    )
    .unwrap();
    let cfg = config.comms_cfg();
    assert_eq!(cfg.iface_type, super::OptigaIfaceType::Simulator);
    assert_eq!(cfg.frame_size, 128);
    assert_eq!(cfg.i2c.unwrap().slave_address, 0x30);
}

/// Test configuration, as found in `config.toml`
#[derive(serde::Deserialize)]
pub struct TestConfig {
    pub device: TestDevice,
    pub interface: Option<TestInterface>,
}

#[derive(serde::Deserialize)]
pub struct TestDevice {
    pub iface_type: String,
    pub chip_type: String,
    pub frame_size: Option<u16>,
    pub datastore_id: Option<u16>,
    pub uart_config_file: Option<String>,
}

#[derive(serde::Deserialize, Copy, Clone)]
pub struct TestInterface {
    pub bus: u8,
    pub slave_address: u8,
    pub guard_time_us: Option<u32>,
}

impl TestConfig {
    pub fn comms_cfg(&self) -> OptigaCommsCfg {
        let mut cfg = OptigaCommsCfg::default()
            .set_iface_type(self.device.iface_type.clone())
            .set_chip_type(self.device.chip_type.clone());
        if let Some(frame_size) = self.device.frame_size {
            cfg = cfg.set_frame_size(frame_size);
        }
        if let Some(datastore_id) = self.device.datastore_id {
            cfg = cfg.set_datastore_id(datastore_id);
        }
        if let Some(file) = &self.device.uart_config_file {
            cfg = cfg.set_uart_config_file(file.clone());
        }
        if let Some(interface) = self.interface {
            let mut i2c = super::OptigaIfaceI2c::default()
                .set_bus(interface.bus)
                .set_slave_address(interface.slave_address);
            if let Some(guard_time_us) = interface.guard_time_us {
                i2c = i2c.set_guard_time_us(guard_time_us);
            }
            cfg = cfg.set_i2c(i2c);
        }
        cfg
    }
}
