//! The device registry contract (§4.3) and an in-memory reference
//! implementation for tests and local development.
//!
//! The Join Engine only ever reads and updates records through
//! [`DeviceRegistry`]; it never owns the backing store. `store()` is
//! optimistic: a concurrently-modified record fails with
//! [`RegistryError::Conflict`] and the engine retries the whole validation
//! chain (§5).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ids::{AesKey, DevAddr, Eui64, KeyEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device not found")]
    NotFound,
    #[error("registry record was concurrently modified")]
    Conflict,
    #[error("registry backend error: {0}")]
    Backend(String),
}

/// LoRaWAN MAC version a device (or a join request) declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MacVersion {
    V1_0,
    V1_0_1,
    V1_0_2,
    V1_1,
}

impl MacVersion {
    pub fn is_1_1(self) -> bool {
        matches!(self, MacVersion::V1_1)
    }
}

/// The five identifiers that name an end device (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentifiers {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
}

#[derive(Debug, Clone)]
pub struct RootKeys {
    pub app_key: Option<AesKey>,
    pub nwk_key: Option<AesKey>,
}

/// An installed session: the keys + DevAddr issued by one successful join.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_key_id: String,
    pub started_at: DateTime<Utc>,
    pub dev_addr: DevAddr,
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    pub app_s_key: Option<KeyEnvelope>,
}

/// The registry entity the Join Engine mutates (§3's `EndDevice` table).
#[derive(Debug, Clone)]
pub struct EndDevice {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub app_id: String,
    pub dev_id: String,
    pub lorawan_version: MacVersion,
    pub network_server_address: String,
    pub application_server_address: String,
    pub root_keys: RootKeys,
    pub next_join_nonce: u32,
    pub next_dev_nonce: u32,
    pub used_dev_nonces: Vec<u32>,
    pub disable_join_nonce_check: bool,
    pub session: Option<Session>,
    pub session_fallback: Option<Session>,
    /// Opaque optimistic-concurrency token; bumped by every `store()`.
    pub version: u64,
}

impl EndDevice {
    pub fn identifiers(&self) -> DeviceIdentifiers {
        DeviceIdentifiers {
            join_eui: self.join_eui,
            dev_eui: self.dev_eui,
        }
    }
}

/// A handle on one device record, carrying the version it was read at so
/// `store()` can detect concurrent modification.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub device: EndDevice,
    read_version: u64,
}

impl DeviceHandle {
    pub fn new(device: EndDevice) -> Self {
        let read_version = device.version;
        DeviceHandle { device, read_version }
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_by_identifiers(&self, ids: DeviceIdentifiers) -> Result<DeviceHandle, RegistryError>;
    async fn find_by_dev_eui(&self, dev_eui: Eui64) -> Result<DeviceHandle, RegistryError>;
    /// Optimistic-concurrency write-back. Fails with `Conflict` if the
    /// record has been modified since `handle` was read.
    async fn store(&self, handle: &DeviceHandle) -> Result<(), RegistryError>;
}

/// Reference `DeviceRegistry` backed by an in-process map. Not for
/// production use — the real backing store is external per §4.3.
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRegistry {
        // Keyed by (JoinEUI, DevEUI); DevEUI-only lookup scans the same map,
        // which is fine at the scale this reference implementation targets.
        devices: Mutex<HashMap<(Eui64, Eui64), EndDevice>>,
    }

    impl InMemoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a device record out-of-band, as registry admin
        /// RPCs would (§6: "device-registry admin RPC set... not specified here").
        pub async fn put(&self, device: EndDevice) {
            let mut devices = self.devices.lock().await;
            devices.insert((device.join_eui, device.dev_eui), device);
        }

        pub async fn get(&self, ids: DeviceIdentifiers) -> Option<EndDevice> {
            let devices = self.devices.lock().await;
            devices.get(&(ids.join_eui, ids.dev_eui)).cloned()
        }
    }

    #[async_trait]
    impl DeviceRegistry for InMemoryRegistry {
        async fn find_by_identifiers(&self, ids: DeviceIdentifiers) -> Result<DeviceHandle, RegistryError> {
            let devices = self.devices.lock().await;
            devices
                .get(&(ids.join_eui, ids.dev_eui))
                .cloned()
                .map(DeviceHandle::new)
                .ok_or(RegistryError::NotFound)
        }

        async fn find_by_dev_eui(&self, dev_eui: Eui64) -> Result<DeviceHandle, RegistryError> {
            let devices = self.devices.lock().await;
            devices
                .values()
                .find(|d| d.dev_eui == dev_eui)
                .cloned()
                .map(DeviceHandle::new)
                .ok_or(RegistryError::NotFound)
        }

        async fn store(&self, handle: &DeviceHandle) -> Result<(), RegistryError> {
            let mut devices = self.devices.lock().await;
            let key = (handle.device.join_eui, handle.device.dev_eui);
            let current = devices.get(&key).ok_or(RegistryError::NotFound)?;
            if current.version != handle.read_version {
                return Err(RegistryError::Conflict);
            }
            let mut next = handle.device.clone();
            next.version = handle.read_version + 1;
            devices.insert(key, next);
            Ok(())
        }
    }

}
