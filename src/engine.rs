//! The join procedure itself (§4.4): validates a Join-Request against a
//! registry record, derives session keys, and rotates the installed
//! session. `JoinEngine` is the only thing that mutates an `EndDevice`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::codec::{malformed, CfList, DlSettings, JoinAcceptPayload, Major, Mhdr, MType, PhyPayload, JOIN_REQUEST_LEN};
use crate::crypto;
use crate::error::{CallerKind, CorruptRegistryReason, JoinError};
use crate::ids::{AesKey, DevAddr, Eui64, JoinNonce, KeyEnvelope, NetId};
use crate::prefix::PrefixMatcher;
use crate::registry::{DeviceIdentifiers, DeviceRegistry, EndDevice, MacVersion, RegistryError, Session};

const MAX_JOIN_ATTEMPTS: u32 = 3;
/// `JoinReqType` for an ordinary (non-rejoin) Join-Request, per the v1.1
/// Join-Accept MIC input (§4.4.1 step 14).
const JOIN_REQUEST_TYPE: u8 = 0xFF;

/// Who is calling an RPC and what address they claim, plus a cooperative
/// cancellation flag the transport can flip if the caller disconnects
/// before a response is sent (§5).
pub struct CallerContext {
    pub kind: CallerKind,
    pub address: String,
    pub cancelled: Arc<AtomicBool>,
}

impl CallerContext {
    pub fn new(kind: CallerKind, address: impl Into<String>) -> Self {
        CallerContext {
            kind,
            address: address.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What the Network Server hands the Join Server for one join attempt. The
/// payload may arrive already decoded, still raw, or both (a transport that
/// parsed it anyway can pass both so the engine doesn't re-decode).
#[derive(Debug, Clone, Default)]
pub struct JoinRequestInput {
    pub raw_payload: Option<Vec<u8>>,
    pub structured_payload: Option<PhyPayload>,
    /// DevAddr the Network Server intends to assign; owned by the NS, only
    /// carried through the Join-Accept by the Join Server.
    pub dev_addr: Option<DevAddr>,
    pub requested_mac_version: Option<MacVersion>,
    pub net_id: NetId,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<CfList>,
}

/// What the Join Server hands back to the Network Server: the Join-Accept
/// PHYPayload to relay downlink, plus the identifier the NS/AS will later
/// use to fetch session keys.
#[derive(Debug, Clone)]
pub struct JoinResponse {
    pub phy_payload: Vec<u8>,
    pub dev_eui: Eui64,
    pub session_key_id: String,
}

#[derive(Debug, Clone)]
pub struct AppSKeyResponse {
    pub dev_eui: Eui64,
    pub app_s_key: KeyEnvelope,
}

#[derive(Debug, Clone)]
pub struct NwkSKeysResponse {
    pub dev_eui: Eui64,
    pub f_nwk_s_int_key: KeyEnvelope,
    /// `None` for a v1.0.x session, which has no distinct SNwkSIntKey/NwkSEncKey.
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    pub nwk_s_enc_key: Option<KeyEnvelope>,
}

/// Which derived key is being delivered, so a [`KeyWrapper`] can pick a KEK
/// per key type if an operator's policy calls for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    FNwkSIntKey,
    SNwkSIntKey,
    NwkSEncKey,
    AppSKey,
    NwkSKeyLegacy,
}

/// Hook for wrapping a derived session key under an operator-managed KEK
/// before it leaves the Join Server (§9). The default, when no wrapper is
/// configured, is to deliver the key in the clear.
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    async fn wrap(&self, purpose: KeyPurpose, dev_eui: Eui64, key: AesKey) -> Result<KeyEnvelope, JoinError>;
}

/// Hook for relaying a Join-Request to another Join Server cluster when this
/// instance doesn't own the `JoinEUI` (§9). Absent by default, in which case
/// an unowned `JoinEUI` always surfaces as `JoinError::ForwardJoinRequest`.
#[async_trait]
pub trait JoinForwarder: Send + Sync {
    async fn forward(&self, join_eui: Eui64, raw_payload: &[u8]) -> Result<JoinResponse, JoinError>;
}

/// Coordinates the registry, the crypto primitives and the optional key-wrap
/// and forwarding hooks to carry out join attempts and session-key lookups.
pub struct JoinEngine {
    registry: Arc<dyn DeviceRegistry>,
    prefixes: PrefixMatcher,
    key_wrapper: Option<Arc<dyn KeyWrapper>>,
    forwarder: Option<Arc<dyn JoinForwarder>>,
}

impl JoinEngine {
    pub fn new(registry: Arc<dyn DeviceRegistry>, prefixes: PrefixMatcher, key_wrapper: Option<Arc<dyn KeyWrapper>>) -> Self {
        JoinEngine {
            registry,
            prefixes,
            key_wrapper,
            forwarder: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn JoinForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Run one join attempt to completion, retrying on registry write
    /// conflicts up to `MAX_JOIN_ATTEMPTS` times (§5).
    pub async fn handle_join(&self, req: JoinRequestInput, ctx: &CallerContext) -> Result<JoinResponse, JoinError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_handle_join(&req, ctx).await {
                Err(JoinError::Registry(RegistryError::Conflict)) if attempt < MAX_JOIN_ATTEMPTS => continue,
                Err(JoinError::Registry(RegistryError::Conflict)) => return Err(JoinError::TooManyConflicts),
                other => return other,
            }
        }
    }

    async fn try_handle_join(&self, req: &JoinRequestInput, ctx: &CallerContext) -> Result<JoinResponse, JoinError> {
        // Step 1: version gate.
        let mac_version = req.requested_mac_version.ok_or(JoinError::UnsupportedMACVersion)?;

        // Step 2: required fields + payload resolution.
        let dev_addr = req.dev_addr.ok_or(JoinError::MissingDevAddr)?;
        let (effective, raw) = resolve_payload(req)?;

        // Step 3: header check.
        let jr = match &effective {
            PhyPayload::JoinRequest(jr) => jr,
            PhyPayload::Other => return Err(JoinError::MissingJoinRequest),
        };
        if !matches!(jr.mhdr.major, Major::LoRaWANR1) {
            return Err(JoinError::UnsupportedLoRaWANVersion);
        }
        if jr.mhdr.mtype != MType::JoinRequest {
            return Err(JoinError::WrongPayloadType);
        }

        // Step 4: identifier check.
        if jr.dev_eui.is_zero() {
            return Err(JoinError::MissingDevEUI);
        }
        if jr.join_eui.is_zero() {
            return Err(JoinError::MissingJoinEUI);
        }

        // Step 5: registry lookup.
        let mut handle = self
            .registry
            .find_by_identifiers(DeviceIdentifiers {
                join_eui: jr.join_eui,
                dev_eui: jr.dev_eui,
            })
            .await
            .map_err(|e| match e {
                RegistryError::NotFound => JoinError::DeviceNotFound,
                other => JoinError::Registry(other),
            })?;

        // Step 6: caller authentication.
        let expected_address = match ctx.kind {
            CallerKind::NetworkServer => &handle.device.network_server_address,
            CallerKind::ApplicationServer => &handle.device.application_server_address,
        };
        if expected_address != &ctx.address {
            return Err(JoinError::AddressMismatch(ctx.kind));
        }

        // Step 7: JoinEUI routing.
        if !self.prefixes.matches(jr.join_eui) {
            return if handle.device.lorawan_version == MacVersion::V1_0 {
                Err(JoinError::UnknownAppEUI)
            } else {
                match &self.forwarder {
                    Some(forwarder) => forwarder.forward(jr.join_eui, &raw).await,
                    None => Err(JoinError::ForwardJoinRequest),
                }
            };
        }

        // Step 8: version compatibility.
        if handle.device.lorawan_version < mac_version {
            return Err(JoinError::MACVersionMismatch);
        }

        // Step 9: AppKey envelope.
        let app_key = non_zero(handle.device.root_keys.app_key, CorruptRegistryReason::AppKeyMissing)?;

        // Step 10: nonce discipline.
        let dn = jr.dev_nonce.as_u32();
        if !handle.device.disable_join_nonce_check {
            if mac_version.is_1_1() {
                // §8 guarantees `next_dev_nonce == u32::MAX` is the terminal state;
                // that check must run before the ordinary "too small" comparison
                // or it can never be reached, since every wire DevNonce fits in a u16.
                if handle.device.next_dev_nonce == u32::MAX {
                    return Err(JoinError::DevNonceTooHigh);
                }
                if dn < handle.device.next_dev_nonce {
                    return Err(JoinError::DevNonceTooSmall);
                }
                handle.device.next_dev_nonce = dn + 1;
            } else if handle.device.used_dev_nonces.contains(&dn) {
                return Err(JoinError::DevNonceReused);
            }
        }

        // Step 11: MIC verification. Verified over the raw wire bytes, not a
        // re-serialization of the structured payload: when a caller supplies
        // both, the structured form is authoritative for interpretation but
        // the raw bytes are authoritative for MIC (§4.1).
        let root_key = if mac_version.is_1_1() {
            non_zero(handle.device.root_keys.nwk_key, CorruptRegistryReason::NwkKeyMissing)?
        } else {
            app_key
        };
        let mic_window: [u8; 19] = raw[..19].try_into().unwrap();
        let wire_mic: [u8; 4] = raw[19..23].try_into().unwrap();
        crypto::verify_join_request_mic(&root_key, &mic_window, wire_mic).map_err(JoinError::MICCheckFailed)?;

        if ctx.is_cancelled() {
            return Err(JoinError::CallerCancelled);
        }

        let join_nonce = JoinNonce(handle.device.next_join_nonce);
        handle.device.next_join_nonce = handle.device.next_join_nonce.wrapping_add(1);

        let plaintext_payload = JoinAcceptPayload {
            mhdr: Mhdr {
                mtype: MType::JoinAccept,
                major: Major::LoRaWANR1,
            },
            join_nonce,
            net_id: req.net_id,
            dev_addr,
            dl_settings: req.dl_settings,
            rx_delay: req.rx_delay,
            cf_list: req.cf_list,
        };
        let plaintext = plaintext_payload.encode_plaintext();
        let mic = if mac_version.is_1_1() {
            let js_int_key = crypto::derive_js_int_key(&root_key, jr.dev_eui);
            crypto::compute_join_accept_mic(&js_int_key, JOIN_REQUEST_TYPE, jr.join_eui, jr.dev_nonce, &plaintext)
                .map_err(JoinError::ComputeMIC)?
        } else {
            crypto::compute_legacy_join_accept_mic(&root_key, &plaintext).map_err(JoinError::ComputeMIC)?
        };
        let mut body = plaintext[1..].to_vec();
        body.extend_from_slice(&mic);
        let encrypted = crypto::encrypt_join_accept(&root_key, &body).map_err(JoinError::EncryptPayloadFailed)?;
        let mut phy_payload = Vec::with_capacity(1 + encrypted.len());
        phy_payload.push(plaintext[0]);
        phy_payload.extend_from_slice(&encrypted);

        let session_key_id = generate_session_key_id(join_nonce, jr.dev_eui);
        let session = if mac_version.is_1_1() {
            let f_nwk = crypto::derive_f_nwk_s_int_key(&root_key, join_nonce, jr.join_eui, jr.dev_nonce);
            let s_nwk = crypto::derive_s_nwk_s_int_key(&root_key, join_nonce, jr.join_eui, jr.dev_nonce);
            let nwk_enc = crypto::derive_nwk_s_enc_key(&root_key, join_nonce, jr.join_eui, jr.dev_nonce);
            let app_s = crypto::derive_app_s_key(&app_key, join_nonce, jr.join_eui, jr.dev_nonce);
            Session {
                session_key_id: session_key_id.clone(),
                started_at: Utc::now(),
                dev_addr,
                f_nwk_s_int_key: Some(self.wrap_key(KeyPurpose::FNwkSIntKey, jr.dev_eui, f_nwk).await?),
                s_nwk_s_int_key: Some(self.wrap_key(KeyPurpose::SNwkSIntKey, jr.dev_eui, s_nwk).await?),
                nwk_s_enc_key: Some(self.wrap_key(KeyPurpose::NwkSEncKey, jr.dev_eui, nwk_enc).await?),
                app_s_key: Some(self.wrap_key(KeyPurpose::AppSKey, jr.dev_eui, app_s).await?),
            }
        } else {
            let nwk_s_key = crypto::derive_legacy_nwk_s_key(&app_key, join_nonce, req.net_id, jr.dev_nonce);
            let app_s_key = crypto::derive_legacy_app_s_key(&app_key, join_nonce, req.net_id, jr.dev_nonce);
            Session {
                session_key_id: session_key_id.clone(),
                started_at: Utc::now(),
                dev_addr,
                f_nwk_s_int_key: Some(self.wrap_key(KeyPurpose::NwkSKeyLegacy, jr.dev_eui, nwk_s_key).await?),
                s_nwk_s_int_key: None,
                nwk_s_enc_key: None,
                app_s_key: Some(self.wrap_key(KeyPurpose::AppSKey, jr.dev_eui, app_s_key).await?),
            }
        };

        if !mac_version.is_1_1() && !handle.device.disable_join_nonce_check {
            handle.device.used_dev_nonces.push(dn);
        }
        handle.device.session_fallback = handle.device.session.take();
        handle.device.session = Some(session);

        self.registry.store(&handle).await?;

        Ok(JoinResponse {
            phy_payload,
            dev_eui: jr.dev_eui,
            session_key_id,
        })
    }

    pub async fn get_app_s_key(&self, dev_eui: Eui64, session_key_id: &str, ctx: &CallerContext) -> Result<AppSKeyResponse, JoinError> {
        if dev_eui.is_zero() {
            return Err(JoinError::MissingDevEUI);
        }
        if session_key_id.is_empty() {
            return Err(JoinError::MissingSessionKeyID);
        }
        let handle = self.registry.find_by_dev_eui(dev_eui).await.map_err(|e| match e {
            RegistryError::NotFound => JoinError::DeviceNotFound,
            other => JoinError::Registry(other),
        })?;
        if handle.device.application_server_address != ctx.address {
            return Err(JoinError::AddressMismatch(CallerKind::ApplicationServer));
        }
        let session = select_session(&handle.device, session_key_id)?;
        let app_s_key = session
            .app_s_key
            .clone()
            .ok_or(JoinError::CorruptRegistry(CorruptRegistryReason::AppSKeyEnvelopeNotFound))?;
        Ok(AppSKeyResponse { dev_eui, app_s_key })
    }

    pub async fn get_nwk_s_keys(&self, dev_eui: Eui64, session_key_id: &str, ctx: &CallerContext) -> Result<NwkSKeysResponse, JoinError> {
        if dev_eui.is_zero() {
            return Err(JoinError::MissingDevEUI);
        }
        if session_key_id.is_empty() {
            return Err(JoinError::MissingSessionKeyID);
        }
        let handle = self.registry.find_by_dev_eui(dev_eui).await.map_err(|e| match e {
            RegistryError::NotFound => JoinError::DeviceNotFound,
            other => JoinError::Registry(other),
        })?;
        if handle.device.network_server_address != ctx.address {
            return Err(JoinError::AddressMismatch(CallerKind::NetworkServer));
        }
        let session = select_session(&handle.device, session_key_id)?;
        let f_nwk_s_int_key = session
            .f_nwk_s_int_key
            .clone()
            .ok_or(JoinError::CorruptRegistry(CorruptRegistryReason::FNwkSIntKeyEnvelopeNotFound))?;
        Ok(NwkSKeysResponse {
            dev_eui,
            f_nwk_s_int_key,
            s_nwk_s_int_key: session.s_nwk_s_int_key.clone(),
            nwk_s_enc_key: session.nwk_s_enc_key.clone(),
        })
    }

    async fn wrap_key(&self, purpose: KeyPurpose, dev_eui: Eui64, key: AesKey) -> Result<KeyEnvelope, JoinError> {
        match &self.key_wrapper {
            Some(wrapper) => wrapper.wrap(purpose, dev_eui, key).await,
            None => Ok(KeyEnvelope::clear(key)),
        }
    }
}

/// Reconcile a caller-supplied raw/structured pair into one authoritative
/// `PhyPayload` plus its raw bytes (§4.4.1 steps 2-3).
fn resolve_payload(req: &JoinRequestInput) -> Result<(PhyPayload, Vec<u8>), JoinError> {
    match (&req.raw_payload, &req.structured_payload) {
        (Some(raw), Some(structured)) => {
            if raw.len() != JOIN_REQUEST_LEN {
                return Err(JoinError::UnmarshalPayloadFailed(malformed(format!(
                    "join-request must be {JOIN_REQUEST_LEN} bytes, got {}",
                    raw.len()
                ))));
            }
            Ok((structured.clone(), raw.clone()))
        }
        (Some(raw), None) => {
            let decoded = PhyPayload::decode(raw).map_err(JoinError::UnmarshalPayloadFailed)?;
            Ok((decoded, raw.clone()))
        }
        (None, Some(structured)) => match structured {
            PhyPayload::JoinRequest(jr) => Ok((structured.clone(), jr.encode().to_vec())),
            PhyPayload::Other => Err(JoinError::MissingJoinRequest),
        },
        (None, None) => Err(JoinError::MissingPayload),
    }
}

fn non_zero(key: Option<AesKey>, reason: CorruptRegistryReason) -> Result<AesKey, JoinError> {
    match key {
        Some(k) if !k.is_zero() => Ok(k),
        _ => Err(JoinError::CorruptRegistry(reason)),
    }
}

/// Pick the session (current, then one-deep fallback) whose SessionKeyID
/// matches the caller's request (§9).
fn select_session<'a>(device: &'a EndDevice, session_key_id: &str) -> Result<&'a Session, JoinError> {
    for session in [device.session.as_ref(), device.session_fallback.as_ref()].into_iter().flatten() {
        if session.session_key_id == session_key_id {
            return Ok(session);
        }
    }
    if device.session.is_none() && device.session_fallback.is_none() {
        Err(JoinError::NoSession)
    } else {
        Err(JoinError::SessionKeyIDMismatch)
    }
}

/// Deterministic SessionKeyID: the first 8 bytes of
/// `SHA-256(JoinNonce(3,LE) || DevEUI(8,LE))`, hex-encoded (§9).
fn generate_session_key_id(join_nonce: JoinNonce, dev_eui: Eui64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(join_nonce.to_le_bytes());
    hasher.update(dev_eui.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JoinRequestPayload, MType};
    use crate::ids::DevNonce;
    use crate::registry::{in_memory::InMemoryRegistry, RootKeys};

    fn device(join_eui: Eui64, dev_eui: Eui64, version: MacVersion) -> EndDevice {
        EndDevice {
            join_eui,
            dev_eui,
            app_id: "app".into(),
            dev_id: "dev".into(),
            lorawan_version: version,
            network_server_address: "ns1".into(),
            application_server_address: "as1".into(),
            root_keys: RootKeys {
                app_key: Some(AesKey([0x11; 16])),
                nwk_key: Some(AesKey([0x22; 16])),
            },
            next_join_nonce: 0,
            next_dev_nonce: 0,
            used_dev_nonces: Vec::new(),
            disable_join_nonce_check: false,
            session: None,
            session_fallback: None,
            version: 0,
        }
    }

    fn signed_join_request(key: &AesKey, join_eui: Eui64, dev_eui: Eui64, dev_nonce: u16) -> JoinRequestPayload {
        let mut jr = JoinRequestPayload {
            mhdr: Mhdr {
                mtype: MType::JoinRequest,
                major: Major::LoRaWANR1,
            },
            join_eui,
            dev_eui,
            dev_nonce: DevNonce(dev_nonce),
            mic: [0; 4],
        };
        let mic = crypto::compute_join_request_mic(key, &jr.mic_window()).unwrap();
        jr.mic = mic;
        jr
    }

    fn engine_with(registry: InMemoryRegistry, join_eui: Eui64) -> JoinEngine {
        JoinEngine::new(
            Arc::new(registry),
            PrefixMatcher::new(vec![crate::prefix::Eui64Prefix::new(join_eui, 64)]),
            None,
        )
    }

    fn base_input(dev_addr: DevAddr, version: MacVersion, jr: JoinRequestPayload) -> JoinRequestInput {
        JoinRequestInput {
            raw_payload: None,
            structured_payload: Some(PhyPayload::JoinRequest(jr)),
            dev_addr: Some(dev_addr),
            requested_mac_version: Some(version),
            net_id: NetId([0x00, 0x00, 0x01]),
            dl_settings: DlSettings(0),
            rx_delay: 1,
            cf_list: None,
        }
    }

    #[tokio::test]
    async fn v1_1_join_issues_session_and_rotates_fallback() {
        let join_eui = Eui64([1; 8]);
        let dev_eui = Eui64([2; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(join_eui, dev_eui, MacVersion::V1_1)).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x22; 16]), join_eui, dev_eui, 0);
        let input = base_input(DevAddr(0xAABBCCDD), MacVersion::V1_1, jr);
        let resp1 = engine.handle_join(input, &ctx).await.unwrap();
        assert_eq!(resp1.dev_eui, dev_eui);

        let jr2 = signed_join_request(&AesKey([0x22; 16]), join_eui, dev_eui, 1);
        let input2 = base_input(DevAddr(0xAABBCCDD), MacVersion::V1_1, jr2);
        let resp2 = engine.handle_join(input2, &ctx).await.unwrap();
        assert_ne!(resp1.session_key_id, resp2.session_key_id);

        let as_ctx = CallerContext::new(CallerKind::ApplicationServer, "as1");
        let current = engine.get_app_s_key(dev_eui, &resp2.session_key_id, &as_ctx).await.unwrap();
        assert_eq!(current.dev_eui, dev_eui);
        let fallback = engine.get_app_s_key(dev_eui, &resp1.session_key_id, &as_ctx).await.unwrap();
        assert_ne!(fallback.app_s_key, current.app_s_key);
    }

    #[tokio::test]
    async fn legacy_device_nonce_reuse_is_rejected() {
        let join_eui = Eui64([3; 8]);
        let dev_eui = Eui64([4; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(join_eui, dev_eui, MacVersion::V1_0_2)).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x11; 16]), join_eui, dev_eui, 42);
        let input = base_input(DevAddr(1), MacVersion::V1_0_2, jr.clone());
        engine.handle_join(input, &ctx).await.unwrap();

        let input_again = base_input(DevAddr(1), MacVersion::V1_0_2, jr);
        let err = engine.handle_join(input_again, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::DevNonceReused));
    }

    #[tokio::test]
    async fn v1_1_dev_nonce_below_watermark_is_too_small() {
        let join_eui = Eui64([5; 8]);
        let dev_eui = Eui64([6; 8]);
        let mut dev = device(join_eui, dev_eui, MacVersion::V1_1);
        dev.next_dev_nonce = 10;
        let registry = InMemoryRegistry::new();
        registry.put(dev).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x22; 16]), join_eui, dev_eui, 3);
        let input = base_input(DevAddr(1), MacVersion::V1_1, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::DevNonceTooSmall));
    }

    #[tokio::test]
    async fn v1_1_exhausted_nonce_counter_is_too_high_even_though_any_u16_is_smaller() {
        let join_eui = Eui64([7; 8]);
        let dev_eui = Eui64([8; 8]);
        let mut dev = device(join_eui, dev_eui, MacVersion::V1_1);
        dev.next_dev_nonce = u32::MAX;
        let registry = InMemoryRegistry::new();
        registry.put(dev).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x22; 16]), join_eui, dev_eui, 65535);
        let input = base_input(DevAddr(1), MacVersion::V1_1, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::DevNonceTooHigh));
    }

    #[tokio::test]
    async fn wrong_network_server_address_is_rejected() {
        let join_eui = Eui64([9; 8]);
        let dev_eui = Eui64([10; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(join_eui, dev_eui, MacVersion::V1_0_2)).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "wrong-ns");

        let jr = signed_join_request(&AesKey([0x11; 16]), join_eui, dev_eui, 1);
        let input = base_input(DevAddr(1), MacVersion::V1_0_2, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::AddressMismatch(CallerKind::NetworkServer)));
    }

    #[tokio::test]
    async fn unowned_join_eui_is_forwarded_for_a_v1_1_device() {
        let owned = Eui64([0xAA; 8]);
        let elsewhere = Eui64([0xBB; 8]);
        let dev_eui = Eui64([11; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(elsewhere, dev_eui, MacVersion::V1_1)).await;
        let engine = engine_with(registry, owned);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x22; 16]), elsewhere, dev_eui, 0);
        let input = base_input(DevAddr(1), MacVersion::V1_1, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::ForwardJoinRequest));
    }

    #[tokio::test]
    async fn unowned_join_eui_is_unknown_app_eui_for_a_v1_0_device() {
        let owned = Eui64([0xAA; 8]);
        let elsewhere = Eui64([0xCC; 8]);
        let dev_eui = Eui64([12; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(elsewhere, dev_eui, MacVersion::V1_0)).await;
        let engine = engine_with(registry, owned);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x11; 16]), elsewhere, dev_eui, 1);
        let input = base_input(DevAddr(1), MacVersion::V1_0, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::UnknownAppEUI));
    }

    #[tokio::test]
    async fn unregistered_device_is_not_found_even_on_an_owned_prefix() {
        let join_eui = Eui64([0xAA; 8]);
        let dev_eui = Eui64([13; 8]);
        let registry = InMemoryRegistry::new();
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x11; 16]), join_eui, dev_eui, 1);
        let input = base_input(DevAddr(1), MacVersion::V1_0_2, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::DeviceNotFound));
    }

    #[tokio::test]
    async fn device_version_below_requested_version_is_a_mismatch() {
        let join_eui = Eui64([14; 8]);
        let dev_eui = Eui64([15; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(join_eui, dev_eui, MacVersion::V1_0)).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x11; 16]), join_eui, dev_eui, 1);
        let input = base_input(DevAddr(1), MacVersion::V1_0_2, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::MACVersionMismatch));
    }

    #[tokio::test]
    async fn device_version_above_requested_version_is_accepted() {
        let join_eui = Eui64([16; 8]);
        let dev_eui = Eui64([17; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(join_eui, dev_eui, MacVersion::V1_0_2)).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        let jr = signed_join_request(&AesKey([0x11; 16]), join_eui, dev_eui, 1);
        let input = base_input(DevAddr(1), MacVersion::V1_0, jr);
        engine.handle_join(input, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn missing_session_key_id_is_rejected_before_registry_lookup() {
        let registry = InMemoryRegistry::new();
        let engine = engine_with(registry, Eui64([18; 8]));
        let ctx = CallerContext::new(CallerKind::ApplicationServer, "as1");
        let err = engine.get_app_s_key(Eui64([19; 8]), "", &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::MissingSessionKeyID));
    }

    #[tokio::test]
    async fn bad_mic_is_rejected() {
        let join_eui = Eui64([12; 8]);
        let dev_eui = Eui64([13; 8]);
        let registry = InMemoryRegistry::new();
        registry.put(device(join_eui, dev_eui, MacVersion::V1_0_2)).await;
        let engine = engine_with(registry, join_eui);
        let ctx = CallerContext::new(CallerKind::NetworkServer, "ns1");

        // Signed with the wrong key.
        let jr = signed_join_request(&AesKey([0x99; 16]), join_eui, dev_eui, 1);
        let input = base_input(DevAddr(1), MacVersion::V1_0_2, jr);
        let err = engine.handle_join(input, &ctx).await.unwrap_err();
        assert!(matches!(err, JoinError::MICCheckFailed(_)));
    }

    #[test]
    fn session_key_id_is_deterministic_and_eui_sensitive() {
        let jn = JoinNonce(42);
        let a = generate_session_key_id(jn, Eui64([1; 8]));
        let b = generate_session_key_id(jn, Eui64([1; 8]));
        let c = generate_session_key_id(jn, Eui64([2; 8]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
