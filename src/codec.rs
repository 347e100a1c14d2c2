//! LoRaWAN PHY payload codec for the join exchange.
//!
//! Layout (§4.1): a Join-Request is exactly 23 bytes —
//! `MHDR(1) | JoinEUI(8,LE) | DevEUI(8,LE) | DevNonce(2,LE) | MIC(4)`.
//! A Join-Accept plaintext is `MHDR(1) | JoinNonce(3,LE) | NetID(3,LE) |
//! DevAddr(4,LE) | DLSettings(1) | RxDelay(1) | [CFList(16)]`; after the
//! 4-byte MIC is appended and everything past the MHDR is encrypted, the
//! raw frame is 17 bytes without a `CFList` or 33 bytes with one.
//!
//! Encoding and decoding are pure functions: they never fail for any reason
//! but a malformed buffer.

use crate::ids::{DevAddr, DevNonce, Eui64, JoinNonce, NetId};

pub const JOIN_REQUEST_LEN: usize = 23;
pub const JOIN_ACCEPT_PLAINTEXT_LEN: usize = 13; // MHDR + JoinNonce + NetID + DevAddr + DLSettings + RxDelay
pub const CFLIST_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

pub(crate) fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedPayload {
        reason: reason.into(),
    }
}

/// LoRaWAN Major version field (2 bits of MHDR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    LoRaWANR1,
    Unknown(u8),
}

impl From<u8> for Major {
    fn from(v: u8) -> Self {
        match v & 0b11 {
            0b00 => Major::LoRaWANR1,
            other => Major::Unknown(other),
        }
    }
}

impl From<Major> for u8 {
    fn from(m: Major) -> Self {
        match m {
            Major::LoRaWANR1 => 0b00,
            Major::Unknown(v) => v & 0b11,
        }
    }
}

/// LoRaWAN MAC Header message type (3 bits of MHDR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl From<u8> for MType {
    fn from(v: u8) -> Self {
        match (v >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            0b111 => MType::Proprietary,
            _ => unreachable!("3-bit field"),
        }
    }
}

impl From<MType> for u8 {
    fn from(m: MType) -> Self {
        let bits: u8 = match m {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    pub mtype: MType,
    pub major: Major,
}

impl Mhdr {
    pub fn to_byte(self) -> u8 {
        u8::from(self.mtype) | u8::from(self.major)
    }

    pub fn from_byte(b: u8) -> Self {
        Mhdr {
            mtype: MType::from(b),
            major: Major::from(b),
        }
    }
}

/// Parsed Join-Request, before MIC verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestPayload {
    pub mhdr: Mhdr,
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: DevNonce,
    pub mic: [u8; 4],
}

impl JoinRequestPayload {
    /// Decode the fixed 23-byte Join-Request frame.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != JOIN_REQUEST_LEN {
            return Err(malformed(format!(
                "join-request must be {JOIN_REQUEST_LEN} bytes, got {}",
                data.len()
            )));
        }
        let mhdr = Mhdr::from_byte(data[0]);
        let join_eui = Eui64::from_le_bytes(data[1..9].try_into().unwrap());
        let dev_eui = Eui64::from_le_bytes(data[9..17].try_into().unwrap());
        let dev_nonce = DevNonce::from_le_bytes(data[17..19].try_into().unwrap());
        let mic: [u8; 4] = data[19..23].try_into().unwrap();
        Ok(JoinRequestPayload {
            mhdr,
            join_eui,
            dev_eui,
            dev_nonce,
            mic,
        })
    }

    /// Re-serialize to the canonical 23-byte raw form, authoritative for MIC.
    pub fn encode(&self) -> [u8; JOIN_REQUEST_LEN] {
        let mut out = [0u8; JOIN_REQUEST_LEN];
        out[0] = self.mhdr.to_byte();
        out[1..9].copy_from_slice(&self.join_eui.to_le_bytes());
        out[9..17].copy_from_slice(&self.dev_eui.to_le_bytes());
        out[17..19].copy_from_slice(&self.dev_nonce.to_le_bytes());
        out[19..23].copy_from_slice(&self.mic);
        out
    }

    /// The first 19 bytes (everything but the MIC), the window the MIC is computed over.
    pub fn mic_window(&self) -> [u8; 19] {
        let full = self.encode();
        full[..19].try_into().unwrap()
    }
}

/// Downlink settings byte (RX1DRoffset / RX2DataRate / OptNeg, opaque here —
/// the join procedure only needs to carry it through unmodified).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings(pub u8);

/// Channel-frequency list optionally appended to a Join-Accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfList(pub [u8; CFLIST_LEN]);

/// Join-Accept payload in plaintext, before MIC + encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    pub mhdr: Mhdr,
    pub join_nonce: JoinNonce,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<CfList>,
}

impl JoinAcceptPayload {
    /// Serialize the plaintext (MHDR included), 13 or 29 bytes.
    pub fn encode_plaintext(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(JOIN_ACCEPT_PLAINTEXT_LEN + CFLIST_LEN);
        out.push(self.mhdr.to_byte());
        out.extend_from_slice(&self.join_nonce.to_le_bytes());
        out.extend_from_slice(&self.net_id.to_le_bytes());
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(self.dl_settings.0);
        out.push(self.rx_delay);
        if let Some(cf_list) = self.cf_list {
            out.extend_from_slice(&cf_list.0);
        }
        out
    }

    /// Decode a plaintext Join-Accept (used by tests and by anyone who
    /// already holds the decrypted bytes).
    pub fn decode_plaintext(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != JOIN_ACCEPT_PLAINTEXT_LEN && data.len() != JOIN_ACCEPT_PLAINTEXT_LEN + CFLIST_LEN {
            return Err(malformed(format!(
                "join-accept plaintext must be {} or {} bytes, got {}",
                JOIN_ACCEPT_PLAINTEXT_LEN,
                JOIN_ACCEPT_PLAINTEXT_LEN + CFLIST_LEN,
                data.len()
            )));
        }
        let mhdr = Mhdr::from_byte(data[0]);
        let join_nonce = JoinNonce::from_le_bytes(data[1..4].try_into().unwrap());
        let net_id = NetId::from_le_bytes(data[4..7].try_into().unwrap());
        let dev_addr = DevAddr::from_le_bytes(data[7..11].try_into().unwrap());
        let dl_settings = DlSettings(data[11]);
        let rx_delay = data[12];
        let cf_list = if data.len() == JOIN_ACCEPT_PLAINTEXT_LEN + CFLIST_LEN {
            Some(CfList(data[13..29].try_into().unwrap()))
        } else {
            None
        };
        Ok(JoinAcceptPayload {
            mhdr,
            join_nonce,
            net_id,
            dev_addr,
            dl_settings,
            rx_delay,
            cf_list,
        })
    }

    /// Raw frame length once MIC is appended and the body is encrypted:
    /// 17 bytes without a `CFList`, 33 bytes with one (§8, invariant 4).
    pub fn raw_len(&self) -> usize {
        self.encode_plaintext().len() + 4
    }
}

/// A structured interpretation of a raw PHY payload. The join procedure
/// only cares whether this is a `JoinRequest`; every other frame type is
/// folded into `Other` since the engine never needs to decode them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyPayload {
    JoinRequest(JoinRequestPayload),
    Other,
}

impl PhyPayload {
    /// Decode a raw frame just far enough to tell a Join-Request apart from
    /// everything else.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.is_empty() {
            return Err(malformed("empty payload"));
        }
        if MType::from(data[0]) == MType::JoinRequest {
            Ok(PhyPayload::JoinRequest(JoinRequestPayload::decode(data)?))
        } else {
            Ok(PhyPayload::Other)
        }
    }
}
