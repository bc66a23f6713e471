use std::time::Duration;

/// Which layer of the system an [`Error`] originated in. Carried alongside
/// the error so a single log statement at the boundary can tag the record
/// without every call site needing to know the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum Component {
    BusBridge,
    RsCodec,
    Registry,
    Scale,
    Engine,
    Safety,
    StateHub,
    Recipes,
    Dispatch,
}

/// The single error type returned by every fallible public operation in
/// this crate. Variants are grouped the way spec section 7's taxonomy
/// groups them: transport, EEPROM integrity, scale, dispensing, storage,
/// and locking.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus timed out after {0:?}")]
    BusTimeout(Duration),

    #[error("bus bridge reported a framing error: {0}")]
    BusFraming(String),

    #[error("no tank responded at bus {0}")]
    BusNoResponse(u8),

    #[error("bus index {0} is out of range (0..=5)")]
    BusIndexOutOfRange(u8),

    #[error("unexpected payload shape or length: {0}")]
    InvalidPayload(String),

    #[error("bridge read response rejected: {0}")]
    ReadRespError(String),

    #[error("a zero-length buffer was passed where one was required")]
    NullBuffer,

    #[error("EEPROM record uncorrectable: {syndromes_nonzero} syndromes nonzero, {errors_found} errors located")]
    EepromUncorrectable {
        syndromes_nonzero: usize,
        errors_found: usize,
    },

    #[error("EEPROM record failed Reed-Solomon re-verification after correction")]
    EepromCorrectionRejected,

    #[error("scale not settled after {0:?}")]
    ScaleNotSettled(Duration),

    #[error("scale calibration requires a known reference weight greater than zero")]
    ScaleBadReference,

    #[error("dispensing cycle aborted: {0}")]
    DispensingAborted(String),

    #[error("dispensing cycle exceeded its no-progress timeout of {0:?}")]
    DispensingStalled(Duration),

    #[error("tank {0} is empty or missing")]
    TankUnavailable(u8),

    #[error("recipe store has no quorum: {0} of 3 copies agree")]
    RecipeNoQuorum(usize),

    #[error("recipe percentages do not sum to 100 (got {0})")]
    RecipeInvalidMix(f32),

    #[error("failed to acquire {0} within {1:?}")]
    LockTimeout(&'static str, Duration),

    #[error("safety flag is latched: {0}")]
    SafetyLatched(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Best-effort classification used purely for the log target a caller
    /// tags this error with; not exhaustive, falls back to `StateHub`.
    pub fn component(&self) -> Component {
        match self {
            Error::BusTimeout(_)
            | Error::BusFraming(_)
            | Error::BusNoResponse(_)
            | Error::BusIndexOutOfRange(_)
            | Error::InvalidPayload(_)
            | Error::ReadRespError(_)
            | Error::NullBuffer => Component::BusBridge,
            Error::EepromUncorrectable { .. } | Error::EepromCorrectionRejected => {
                Component::RsCodec
            }
            Error::ScaleNotSettled(_) | Error::ScaleBadReference => Component::Scale,
            Error::DispensingAborted(_) | Error::DispensingStalled(_) => Component::Engine,
            Error::TankUnavailable(_) => Component::Registry,
            Error::RecipeNoQuorum(_) | Error::RecipeInvalidMix(_) => Component::Recipes,
            Error::SafetyLatched(_) => Component::Safety,
            Error::LockTimeout(..) => Component::StateHub,
            Error::Config(_) | Error::Io(_) | Error::Serde(_) => Component::StateHub,
        }
    }
}
