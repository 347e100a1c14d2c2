//! The join-procedure error taxonomy (§7). Every variant here is one of the
//! named errors the spec calls out; none are collapsed into a string.

use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::registry::RegistryError;

/// Sub-reason for a corrupt-registry error: the record exists but is
/// missing something the join procedure required of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorruptRegistryReason {
    #[error("AppKey missing or zero")]
    AppKeyMissing,
    #[error("NwkKey missing or zero")]
    NwkKeyMissing,
    #[error("AppSKey envelope not found")]
    AppSKeyEnvelopeNotFound,
    #[error("NwkSEncKey envelope not found")]
    NwkSEncKeyEnvelopeNotFound,
    #[error("FNwkSIntKey envelope not found")]
    FNwkSIntKeyEnvelopeNotFound,
    #[error("SNwkSIntKey envelope not found")]
    SNwkSIntKeyEnvelopeNotFound,
}

/// Which caller's address failed to match the device record (§4.4.1 step 6,
/// §4.4.2 step 3, §4.4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallerKind {
    #[error("network server")]
    NetworkServer,
    #[error("application server")]
    ApplicationServer,
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    // --- Input ---
    #[error("missing DevAddr")]
    MissingDevAddr,
    #[error("missing payload")]
    MissingPayload,
    #[error("failed to unmarshal payload: {0}")]
    UnmarshalPayloadFailed(#[source] CodecError),
    #[error("unsupported LoRaWAN major version")]
    UnsupportedLoRaWANVersion,
    #[error("unsupported MAC version")]
    UnsupportedMACVersion,
    #[error("wrong payload type")]
    WrongPayloadType,
    #[error("missing join-request payload")]
    MissingJoinRequest,
    #[error("missing DevEUI")]
    MissingDevEUI,
    #[error("missing JoinEUI")]
    MissingJoinEUI,
    #[error("missing SessionKeyID")]
    MissingSessionKeyID,

    // --- Policy ---
    #[error("unknown AppEUI")]
    UnknownAppEUI,
    #[error("join request should be forwarded to another cluster")]
    ForwardJoinRequest,
    #[error("device's MAC version does not support the requested version")]
    MACVersionMismatch,
    #[error("caller address mismatch for {0}")]
    AddressMismatch(CallerKind),
    #[error("no session installed for device")]
    NoSession,
    #[error("SessionKeyID does not match current or fallback session")]
    SessionKeyIDMismatch,

    // --- Replay ---
    #[error("DevNonce is smaller than the next expected value")]
    DevNonceTooSmall,
    #[error("DevNonce counter has reached its maximum, no further joins are possible")]
    DevNonceTooHigh,
    #[error("DevNonce has already been used by this device")]
    DevNonceReused,

    // --- Integrity ---
    #[error("MIC check failed: {0}")]
    MICCheckFailed(#[source] CryptoError),

    // --- Registry integrity ---
    #[error("registry record is corrupt: {0}")]
    CorruptRegistry(CorruptRegistryReason),
    #[error("device not found")]
    DeviceNotFound,

    // --- Crypto ---
    #[error("failed to encrypt join-accept payload: {0}")]
    EncryptPayloadFailed(#[source] CryptoError),
    #[error("failed to compute MIC: {0}")]
    ComputeMIC(#[source] CryptoError),

    // --- Registry backend, surfaced rather than swallowed (§9) ---
    #[error("registry error: {0}")]
    Registry(#[source] RegistryError),
    #[error("registry write conflicted on every retry")]
    TooManyConflicts,

    // --- Cancellation (§5) ---
    #[error("caller disconnected before the join could be committed")]
    CallerCancelled,
}

impl From<RegistryError> for JoinError {
    fn from(e: RegistryError) -> Self {
        JoinError::Registry(e)
    }
}
