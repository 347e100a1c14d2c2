//! LoRaWAN identifiers and key material shared across the codec, registry and engine.
//!
//! Wire order for every multi-byte field here is little-endian, per §3 of the
//! join procedure: `EUI64`, `DevAddr`, `NetID`, `DevNonce` and `JoinNonce` are
//! all transmitted LE on the Join-Request/Join-Accept PHY payload. Text/log
//! rendering (`Display`) stays big-endian hex, matching how LoRaWAN tooling
//! prints these values.

use std::fmt;

/// 64-bit globally-unique identifier (`JoinEUI`/`AppEUI` or `DevEUI`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const ZERO: Eui64 = Eui64([0u8; 8]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Eui64(bytes)
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0
    }

    /// Big-endian `u64`, the conventional way an EUI is read as a number.
    pub fn as_be_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

/// Device-supplied anti-replay value carried in a Join-Request.
///
/// v1.0.x devices pick this at random; v1.1 devices must increment it
/// monotonically. Either way it is a 16-bit wire field, widened to `u32`
/// internally so `next_dev_nonce` can represent "one past the max `u16`"
/// without wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DevNonce(pub u16);

impl DevNonce {
    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        DevNonce(u16::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

/// Server-issued value carried in a Join-Accept; 24 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JoinNonce(pub u32);

impl JoinNonce {
    /// Lower 24 bits, little-endian.
    pub fn to_le_bytes(self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    pub fn from_le_bytes(bytes: [u8; 3]) -> Self {
        JoinNonce(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }
}

/// 32-bit short device address, assigned by the Network Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevAddr(pub u32);

impl DevAddr {
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        DevAddr(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// 24-bit network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetId(pub [u8; 3]);

impl NetId {
    pub fn to_le_bytes(self) -> [u8; 3] {
        self.0
    }

    pub fn from_le_bytes(bytes: [u8; 3]) -> Self {
        NetId(bytes)
    }
}

/// A 128-bit AES key. All-zero is treated as "absent" by [`AesKey::is_zero`]
/// and must be rejected wherever the protocol requires a real root key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AesKey(pub [u8; 16]);

impl AesKey {
    pub const ZERO: AesKey = AesKey([0u8; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Manual Debug: never print key material, even in test failure output.
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(<redacted>)")
    }
}

/// A key as delivered to an NS/AS: either cleartext (empty `kek_label`) or
/// wrapped by an operator-supplied KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEnvelope {
    pub key: Vec<u8>,
    pub kek_label: String,
}

impl KeyEnvelope {
    /// Build a clear-delivery envelope (no KEK configured).
    pub fn clear(key: AesKey) -> Self {
        KeyEnvelope {
            key: key.0.to_vec(),
            kek_label: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui64_zero_predicate() {
        assert!(Eui64::ZERO.is_zero());
        assert!(!Eui64([0, 0, 0, 0, 0, 0, 0, 1]).is_zero());
    }

    #[test]
    fn aes_key_zero_predicate() {
        assert!(AesKey::ZERO.is_zero());
        let mut bytes = [0u8; 16];
        bytes[15] = 1;
        assert!(!AesKey(bytes).is_zero());
    }

    #[test]
    fn join_nonce_roundtrips_through_24_bits() {
        let jn = JoinNonce(0x00ABCDEF & 0x00FF_FFFF);
        let bytes = jn.to_le_bytes();
        let back = JoinNonce::from_le_bytes(bytes);
        assert_eq!(jn.0, back.0);
    }

    #[test]
    fn dev_nonce_le_roundtrip() {
        let dn = DevNonce(0x4242);
        assert_eq!(DevNonce::from_le_bytes(dn.to_le_bytes()), dn);
    }

    #[test]
    fn key_envelope_debug_never_prints_key_bytes() {
        let key = AesKey([0xAB; 16]);
        let debug = format!("{:?}", key);
        assert!(!debug.contains("AB"));
    }
}
