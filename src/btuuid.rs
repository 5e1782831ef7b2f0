//! `Uuid` extensions for Bluetooth UUIDs

use uuid::Uuid;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// This is the Bluetooth Base UUID. It is used with 16-bit and 32-bit UUIDs
/// [defined](https://www.bluetooth.com/specifications/assigned-numbers/) by the Bluetooth SIG.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Const function to create a 16-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Const function to create a 32-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u32(uuid: u32) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Extension trait for [uuid::Uuid] with helper methods for dealing with Bluetooth 16-bit and 32-bit UUIDs
pub trait BluetoothUuidExt: private::Sealed + Sized {
    /// Creates a 16-bit Bluetooth UUID
    fn from_u16(uuid: u16) -> Self;

    /// Creates a 32-bit Bluetooth UUID
    fn from_u32(uuid: u32) -> Self;

    /// Parses a UUID written in full (`0000180a-0000-1000-8000-00805f9b34fb`) or in its short 16-bit (`180a`) or
    /// 32-bit (`0000180a`) form.
    fn parse_bluetooth(s: &str) -> Result<Self>;

    /// Returns `true` if self is a valid 16-bit Bluetooth UUID
    fn is_u16_uuid(&self) -> bool;

    /// Returns `true` if self is a valid 32-bit Bluetooth UUID
    fn is_u32_uuid(&self) -> bool;

    /// Tries to convert self into a 16-bit Bluetooth UUID
    fn try_to_u16(&self) -> Option<u16>;

    /// Tries to convert self into a 32-bit Bluetooth UUID
    fn try_to_u32(&self) -> Option<u32>;
}

impl BluetoothUuidExt for Uuid {
    fn from_u16(uuid: u16) -> Self {
        bluetooth_uuid_from_u16(uuid)
    }

    fn from_u32(uuid: u32) -> Self {
        bluetooth_uuid_from_u32(uuid)
    }

    fn parse_bluetooth(s: &str) -> Result<Self> {
        let invalid = || Error::with_message(ErrorKind::InvalidParameter, format!("invalid UUID `{s}`"));
        match s.len() {
            4 => u16::from_str_radix(s, 16).map(Self::from_u16).map_err(|_| invalid()),
            8 => u32::from_str_radix(s, 16).map(Self::from_u32).map_err(|_| invalid()),
            _ => Uuid::parse_str(s).map_err(|_| invalid()),
        }
    }

    fn is_u16_uuid(&self) -> bool {
        let u = self.as_u128();
        (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID && (((u >> 96) as u32) & 0xffff0000) == 0
    }

    fn is_u32_uuid(&self) -> bool {
        let u = self.as_u128();
        (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID
    }

    fn try_to_u16(&self) -> Option<u16> {
        self.is_u16_uuid().then(|| (self.as_u128() >> 96) as u16)
    }

    fn try_to_u32(&self) -> Option<u32> {
        self.is_u32_uuid().then(|| (self.as_u128() >> 96) as u32)
    }
}

mod private {
    use uuid::Uuid;

    pub trait Sealed {}

    impl Sealed for Uuid {}
}

/// Bluetooth GATT Service 16-bit UUIDs
#[allow(missing_docs)]
pub mod services {
    use super::bluetooth_uuid_from_u16;
    use crate::Uuid;

    pub const GENERIC_ACCESS: Uuid = bluetooth_uuid_from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = bluetooth_uuid_from_u16(0x1801);
    pub const DEVICE_INFORMATION: Uuid = bluetooth_uuid_from_u16(0x180A);
    pub const HEART_RATE: Uuid = bluetooth_uuid_from_u16(0x180D);
    pub const BATTERY: Uuid = bluetooth_uuid_from_u16(0x180F);
}

/// Bluetooth GATT Characteristic 16-bit UUIDs
#[allow(missing_docs)]
pub mod characteristics {
    use super::bluetooth_uuid_from_u16;
    use crate::Uuid;

    pub const DEVICE_NAME: Uuid = bluetooth_uuid_from_u16(0x2A00);
    pub const APPEARANCE: Uuid = bluetooth_uuid_from_u16(0x2A01);
    pub const SERVICE_CHANGED: Uuid = bluetooth_uuid_from_u16(0x2A05);
    pub const BATTERY_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A19);
    pub const SYSTEM_ID: Uuid = bluetooth_uuid_from_u16(0x2A23);
    pub const MODEL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A24);
    pub const SERIAL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A25);
    pub const FIRMWARE_REVISION_STRING: Uuid = bluetooth_uuid_from_u16(0x2A26);
    pub const HARDWARE_REVISION_STRING: Uuid = bluetooth_uuid_from_u16(0x2A27);
    pub const SOFTWARE_REVISION_STRING: Uuid = bluetooth_uuid_from_u16(0x2A28);
    pub const MANUFACTURER_NAME_STRING: Uuid = bluetooth_uuid_from_u16(0x2A29);
    pub const HEART_RATE_MEASUREMENT: Uuid = bluetooth_uuid_from_u16(0x2A37);
}
