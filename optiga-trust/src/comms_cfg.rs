use super::{
    ManageContext, OptigaChipType, OptigaCommsCfg, OptigaIfaceI2c, OptigaIfaceType,
    OptigaIfaceUart, DL_DEFAULT_FRAME_SIZE, OPTIGA_COMMS_NO_PROTECTION,
    OPTIGA_COMMS_PROTOCOL_VERSION_PRE_SHARED_SECRET, OPTIGA_DATASTORE_NOT_CONFIGURED,
};
use log::error;

/// Default I2C address of the chip
pub const OPTIGA_I2C_BASE_ADDRESS: u8 = 0x30;
/// Frames dropped by a `lossy-link` simulated chip: one in this many
pub const SIM_DEFAULT_DROP_PERIOD: u8 = 4;

impl Default for OptigaCommsCfg {
    fn default() -> OptigaCommsCfg {
        OptigaCommsCfg {
            iface_type: OptigaIfaceType::Unknown,
            chip_type: OptigaChipType::Unknown,
            instance_id: 0u8,
            i2c: None,
            uart: None,
            frame_size: DL_DEFAULT_FRAME_SIZE,
            protection_level: OPTIGA_COMMS_NO_PROTECTION,
            protocol_version: OPTIGA_COMMS_PROTOCOL_VERSION_PRE_SHARED_SECRET,
            datastore_id: OPTIGA_DATASTORE_NOT_CONFIGURED,
            datastore_path: None,
        }
    }
}

impl Default for OptigaIfaceI2c {
    fn default() -> OptigaIfaceI2c {
        OptigaIfaceI2c {
            bus: 1u8,
            slave_address: OPTIGA_I2C_BASE_ADDRESS,
            guard_time_us: 50u32,
            polling_interval_us: 1000u32,
            polling_retries: 200u32,
        }
    }
}

impl Default for OptigaIfaceUart {
    fn default() -> OptigaIfaceUart {
        OptigaIfaceUart {
            config_file: super::uart::UART_CONFIG_FILE_NAME.to_owned(),
            baud: super::uart::UART_BAUD_RATE,
        }
    }
}

impl OptigaCommsCfg {
    pub fn set_iface_type(mut self, iface_type: String) -> OptigaCommsCfg {
        self.iface_type = match iface_type.as_str() {
            "i2c" => OptigaIfaceType::I2c,
            "uart" => OptigaIfaceType::Uart,
            "simulator" => OptigaIfaceType::Simulator,
            _ => {
                error!("Unsupported OPTIGA interface type {}", iface_type);
                OptigaIfaceType::Unknown
            }
        };
        self
    }
    pub fn set_chip_type(mut self, chip_type: String) -> OptigaCommsCfg {
        self.chip_type = match chip_type.as_str() {
            "optiga-trust-m" => OptigaChipType::OptigaTrustM,
            "optiga-trust-x" => OptigaChipType::OptigaTrustX,
            "always-success" => OptigaChipType::SimAlwaysSuccess,
            "always-fail" => OptigaChipType::SimAlwaysFail,
            "lossy-link" => OptigaChipType::SimLossyLink(SIM_DEFAULT_DROP_PERIOD),
            _ => {
                error!("Unsupported OPTIGA chip type {}", chip_type);
                OptigaChipType::Unknown
            }
        };
        self
    }
    pub fn set_instance_id(mut self, instance_id: u8) -> OptigaCommsCfg {
        self.instance_id = instance_id;
        self
    }
    pub fn set_i2c(mut self, i2c: OptigaIfaceI2c) -> OptigaCommsCfg {
        self.i2c = Some(i2c);
        self
    }
    pub fn set_uart(mut self, uart: OptigaIfaceUart) -> OptigaCommsCfg {
        self.uart = Some(uart);
        self
    }
    pub fn set_uart_config_file(self, config_file: String) -> OptigaCommsCfg {
        let uart = self.uart.clone().unwrap_or_default().set_config_file(config_file);
        self.set_uart(uart)
    }
    pub fn set_frame_size(mut self, frame_size: u16) -> OptigaCommsCfg {
        self.frame_size = frame_size;
        self
    }
    pub fn set_protection_level(mut self, protection_level: u8) -> OptigaCommsCfg {
        self.protection_level = protection_level;
        self
    }
    pub fn set_protocol_version(mut self, protocol_version: u8) -> OptigaCommsCfg {
        self.protocol_version = protocol_version;
        self
    }
    pub fn set_datastore_id(mut self, datastore_id: u16) -> OptigaCommsCfg {
        self.datastore_id = datastore_id;
        self
    }
    pub fn set_datastore_path(mut self, datastore_path: String) -> OptigaCommsCfg {
        self.datastore_path = Some(datastore_path);
        self
    }
}

impl OptigaIfaceI2c {
    pub fn set_bus(mut self, bus: u8) -> OptigaIfaceI2c {
        self.bus = bus;
        self
    }
    pub fn set_slave_address(mut self, slave_address: u8) -> OptigaIfaceI2c {
        self.slave_address = slave_address;
        self
    }
    pub fn set_guard_time_us(mut self, guard_time_us: u32) -> OptigaIfaceI2c {
        self.guard_time_us = guard_time_us;
        self
    }
    pub fn set_polling(mut self, interval_us: u32, retries: u32) -> OptigaIfaceI2c {
        self.polling_interval_us = interval_us;
        self.polling_retries = retries;
        self
    }
}

impl OptigaIfaceUart {
    pub fn set_config_file(mut self, config_file: String) -> OptigaIfaceUart {
        self.config_file = config_file;
        self
    }
    pub fn set_baud(mut self, baud: u32) -> OptigaIfaceUart {
        self.baud = baud;
        self
    }
}

/// Parses the manage-context names used in configuration files
pub fn manage_context_from_str(name: &str) -> ManageContext {
    match name {
        "save" => ManageContext::Save,
        "restore" => ManageContext::Restore,
        "none" => ManageContext::None,
        _ => {
            error!("Unsupported manage context operation {}", name);
            ManageContext::None
        }
    }
}
