use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::uuid::parse_uuid;
use crate::{Error, Result};

/// The longest advertising timeout the native stack accepts (3 minutes)
pub const MAX_TIMEOUT_MILLIS: u32 = 180_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseMode {
    #[serde(rename = "ADVERTISE_MODE_LOW_POWER")]
    LowPower,
    #[serde(rename = "ADVERTISE_MODE_BALANCED")]
    Balanced,
    #[serde(rename = "ADVERTISE_MODE_LOW_LATENCY")]
    LowLatency,
}

impl Default for AdvertiseMode {
    fn default() -> Self {
        AdvertiseMode::LowPower
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPowerLevel {
    #[serde(rename = "ADVERTISE_TX_POWER_ULTRA_LOW")]
    UltraLow,
    #[serde(rename = "ADVERTISE_TX_POWER_LOW")]
    Low,
    #[serde(rename = "ADVERTISE_TX_POWER_MEDIUM")]
    Medium,
    #[serde(rename = "ADVERTISE_TX_POWER_HIGH")]
    High,
}

impl Default for TxPowerLevel {
    fn default() -> Self {
        TxPowerLevel::Medium
    }
}

/// Advertising parameters as accepted by [`AdvertiseSettings::from_json`]:
///
/// ```json
/// {
///   "advertiseMode": "ADVERTISE_MODE_BALANCED",
///   "txPowerLevel": "ADVERTISE_TX_POWER_HIGH",
///   "broadcastData": {
///     "includeDeviceName": true,
///     "serviceUUIDs": ["180d"],
///     "manufacturerData": { "89": [1, 2, 3] }
///   }
/// }
/// ```
///
/// `connectable` defaults to whether the local GATT server is running.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseSettings {
    #[serde(default)]
    pub advertise_mode: AdvertiseMode,
    #[serde(default)]
    pub connectable: Option<bool>,
    /// 0 advertises until stopped
    #[serde(default)]
    pub timeout_millis: u32,
    #[serde(default)]
    pub tx_power_level: TxPowerLevel,
    pub broadcast_data: AdvertiseData,
    #[serde(default)]
    pub scan_response_data: Option<AdvertiseData>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseData {
    #[serde(default)]
    pub include_device_name: bool,
    #[serde(default)]
    pub include_tx_power_level: bool,
    #[serde(rename = "serviceUUIDs", default)]
    pub service_uuids: Vec<String>,
    #[serde(default)]
    pub service_data: BTreeMap<String, Vec<u8>>,
    /// Keyed by company identifier
    #[serde(default)]
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl AdvertiseSettings {
    pub fn new(broadcast_data: AdvertiseData) -> Self {
        Self {
            advertise_mode: AdvertiseMode::default(),
            connectable: None,
            timeout_millis: 0,
            tx_power_level: TxPowerLevel::default(),
            broadcast_data,
            scan_response_data: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the settings and resolves them into what's handed to the
    /// radio
    pub(crate) fn resolve(&self, server_running: bool) -> Result<Advertisement> {
        if self.timeout_millis > MAX_TIMEOUT_MILLIS {
            return Err(Error::InvalidArgument(format!("Advertising timeout {}ms exceeds {}ms",
                                                      self.timeout_millis, MAX_TIMEOUT_MILLIS)));
        }

        Ok(Advertisement {
            mode: self.advertise_mode,
            connectable: self.connectable.unwrap_or(server_running),
            timeout_millis: self.timeout_millis,
            tx_power_level: self.tx_power_level,
            broadcast: self.broadcast_data.resolve()?,
            scan_response: self.scan_response_data.as_ref().map(AdvertiseData::resolve).transpose()?,
        })
    }
}

impl AdvertiseData {
    fn resolve(&self) -> Result<AdvertisementPayload> {
        let service_uuids = self.service_uuids.iter().map(|uuid| parse_uuid(uuid)).collect::<Result<_>>()?;
        let service_data = self.service_data
            .iter()
            .map(|(uuid, data)| Ok((parse_uuid(uuid)?, data.clone())))
            .collect::<Result<_>>()?;

        Ok(AdvertisementPayload {
            include_device_name: self.include_device_name,
            include_tx_power_level: self.include_tx_power_level,
            service_uuids,
            service_data,
            manufacturer_data: self.manufacturer_data.iter().map(|(id, data)| (*id, data.clone())).collect(),
        })
    }
}

/// Validated advertising parameters, as handed to
/// [`Radio::start_advertising`](crate::backend::Radio::start_advertising)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub mode: AdvertiseMode,
    pub connectable: bool,
    pub timeout_millis: u32,
    pub tx_power_level: TxPowerLevel,
    pub broadcast: AdvertisementPayload,
    pub scan_response: Option<AdvertisementPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisementPayload {
    pub include_device_name: bool,
    pub include_tx_power_level: bool,
    pub service_uuids: Vec<Uuid>,
    pub service_data: Vec<(Uuid, Vec<u8>)>,
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
}
