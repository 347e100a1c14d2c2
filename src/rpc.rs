//! Reference RPC transport for the join procedure (§6).
//!
//! The wire format here — one JSON object per line over TCP — is a
//! development stand-in, not a wire-format contract: §6 leaves the real
//! transport (gRPC, HTTP, a message bus) to the deployment. It exists so the
//! engine has a runnable front door and so `handle_join`/`get_app_s_key`/
//! `get_nwk_s_keys` can be exercised end to end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::codec::{CfList, DlSettings, PhyPayload};
use crate::engine::{CallerContext, JoinEngine, JoinRequestInput};
use crate::error::{CallerKind, JoinError};
use crate::ids::{DevAddr, Eui64, NetId};
use crate::registry::MacVersion;

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
enum Request {
    HandleJoin(HandleJoinParams),
    GetAppSKey(SessionKeyParams),
    GetNwkSKeys(SessionKeyParams),
}

#[derive(Debug, Deserialize)]
struct HandleJoinParams {
    caller_kind: CallerKindWire,
    caller_address: String,
    /// Hex-encoded raw PHYPayload. The reference transport never forwards a
    /// pre-decoded payload; every request round-trips through the codec.
    phy_payload_hex: String,
    dev_addr: String,
    mac_version: MacVersionWire,
    net_id: String,
    dl_settings: u8,
    rx_delay: u8,
    cf_list_hex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionKeyParams {
    caller_kind: CallerKindWire,
    caller_address: String,
    dev_eui: String,
    session_key_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CallerKindWire {
    NetworkServer,
    ApplicationServer,
}

impl From<CallerKindWire> for CallerKind {
    fn from(value: CallerKindWire) -> Self {
        match value {
            CallerKindWire::NetworkServer => CallerKind::NetworkServer,
            CallerKindWire::ApplicationServer => CallerKind::ApplicationServer,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MacVersionWire {
    V1_0,
    V1_0_1,
    V1_0_2,
    V1_1,
}

impl From<MacVersionWire> for MacVersion {
    fn from(value: MacVersionWire) -> Self {
        match value {
            MacVersionWire::V1_0 => MacVersion::V1_0,
            MacVersionWire::V1_0_1 => MacVersion::V1_0_1,
            MacVersionWire::V1_0_2 => MacVersion::V1_0_2,
            MacVersionWire::V1_1 => MacVersion::V1_1,
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> Envelope<T> {
    fn ok(value: T) -> Self {
        Envelope { ok: Some(value), error: None }
    }

    fn err(e: &JoinError) -> Self {
        Envelope { ok: None, error: Some(e.to_string()) }
    }
}

#[derive(Debug, Serialize)]
struct JoinAnswer {
    phy_payload_hex: String,
    dev_eui: String,
    session_key_id: String,
}

#[derive(Debug, Serialize)]
struct AppSKeyAnswer {
    dev_eui: String,
    app_s_key_hex: String,
    kek_label: String,
}

#[derive(Debug, Serialize)]
struct NwkSKeysAnswer {
    dev_eui: String,
    f_nwk_s_int_key_hex: String,
    s_nwk_s_int_key_hex: Option<String>,
    nwk_s_enc_key_hex: Option<String>,
}

fn parse_eui(s: &str) -> Result<Eui64, JoinError> {
    let bytes = hex::decode(s).map_err(|_| JoinError::MissingDevEUI)?;
    let mut be: [u8; 8] = bytes.try_into().map_err(|_| JoinError::MissingDevEUI)?;
    be.reverse();
    Ok(Eui64(be))
}

async fn dispatch(engine: &JoinEngine, request: Request) -> Result<serde_json::Value, JoinError> {
    match request {
        Request::HandleJoin(params) => {
            let ctx = CallerContext::new(params.caller_kind.into(), params.caller_address);
            let raw_payload = hex::decode(&params.phy_payload_hex).map_err(|e| {
                JoinError::UnmarshalPayloadFailed(crate::codec::malformed(e.to_string()))
            })?;
            let dev_addr_bytes: [u8; 4] = hex::decode(&params.dev_addr)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or(JoinError::MissingDevAddr)?;
            let mut dev_addr_le = dev_addr_bytes;
            dev_addr_le.reverse();
            let net_id_bytes: [u8; 3] = hex::decode(&params.net_id)
                .ok()
                .and_then(|b| b.try_into().ok())
                .unwrap_or([0, 0, 0]);
            let mut net_id_le = net_id_bytes;
            net_id_le.reverse();
            let cf_list = params
                .cf_list_hex
                .as_deref()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| <[u8; 16]>::try_from(b).ok())
                .map(CfList);

            let input = JoinRequestInput {
                raw_payload: Some(raw_payload),
                structured_payload: None::<PhyPayload>,
                dev_addr: Some(DevAddr::from_le_bytes(dev_addr_le)),
                requested_mac_version: Some(params.mac_version.into()),
                net_id: NetId::from_le_bytes(net_id_le),
                dl_settings: DlSettings(params.dl_settings),
                rx_delay: params.rx_delay,
                cf_list,
            };
            let response = engine.handle_join(input, &ctx).await?;
            Ok(serde_json::to_value(JoinAnswer {
                phy_payload_hex: hex::encode(response.phy_payload),
                dev_eui: response.dev_eui.to_string(),
                session_key_id: response.session_key_id,
            })
            .expect("JoinAnswer always serializes"))
        }
        Request::GetAppSKey(params) => {
            let ctx = CallerContext::new(params.caller_kind.into(), params.caller_address);
            let dev_eui = parse_eui(&params.dev_eui)?;
            let response = engine.get_app_s_key(dev_eui, &params.session_key_id, &ctx).await?;
            Ok(serde_json::to_value(AppSKeyAnswer {
                dev_eui: response.dev_eui.to_string(),
                app_s_key_hex: hex::encode(&response.app_s_key.key),
                kek_label: response.app_s_key.kek_label,
            })
            .expect("AppSKeyAnswer always serializes"))
        }
        Request::GetNwkSKeys(params) => {
            let ctx = CallerContext::new(params.caller_kind.into(), params.caller_address);
            let dev_eui = parse_eui(&params.dev_eui)?;
            let response = engine.get_nwk_s_keys(dev_eui, &params.session_key_id, &ctx).await?;
            Ok(serde_json::to_value(NwkSKeysAnswer {
                dev_eui: response.dev_eui.to_string(),
                f_nwk_s_int_key_hex: hex::encode(&response.f_nwk_s_int_key.key),
                s_nwk_s_int_key_hex: response.s_nwk_s_int_key.map(|k| hex::encode(k.key)),
                nwk_s_enc_key_hex: response.nwk_s_enc_key.map(|k| hex::encode(k.key)),
            })
            .expect("NwkSKeysAnswer always serializes"))
        }
    }
}

async fn handle_connection(stream: TcpStream, engine: Arc<JoinEngine>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("connection read error: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let body = match serde_json::from_str::<Request>(&line) {
            Ok(request) => match dispatch(&engine, request).await {
                Ok(value) => serde_json::to_string(&Envelope::ok(value)),
                Err(e) => {
                    debug!("join RPC failed: {}", e);
                    serde_json::to_string(&Envelope::<serde_json::Value>::err(&e))
                }
            },
            Err(e) => serde_json::to_string(&Envelope::<serde_json::Value>::err(&JoinError::UnmarshalPayloadFailed(
                crate::codec::malformed(e.to_string()),
            ))),
        };

        let mut body = body.unwrap_or_else(|_| "{\"error\":\"internal error\"}".to_string());
        body.push('\n');
        if let Err(e) = writer.write_all(body.as_bytes()).await {
            warn!("connection write error: {}", e);
            return;
        }
    }
}

/// Accept connections and serve join-procedure RPCs until the process exits.
pub async fn run_server(bind: &str, engine: Arc<JoinEngine>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("join server listening on {}", bind);

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("accepted connection from {}", peer);
        let engine = engine.clone();
        tokio::spawn(async move {
            handle_connection(stream, engine).await;
            debug!("connection from {} closed", peer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_eui_reverses_big_endian_text_to_le_storage() {
        let eui = parse_eui("42FF000000000001").unwrap();
        assert_eq!(eui.as_be_u64() >> 56, 0x42);
    }

    #[test]
    fn parse_eui_rejects_wrong_length() {
        assert!(parse_eui("42FF").is_err());
    }

    #[test]
    fn request_tag_dispatches_on_method_field() {
        let json = r#"{"method":"get_app_s_key","params":{"caller_kind":"application_server","caller_address":"as1","dev_eui":"0000000000000001","session_key_id":"abc"}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(request, Request::GetAppSKey(_)));
    }
}
