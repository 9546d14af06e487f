//! Error taxonomy shared by every layer of the crate.
//!
//! The variants follow the failure classes a caller has to tell apart: a rejected login, an
//! operation invoked before its setup, a simulation that failed versus a client that gave up
//! polling, a missing element, a write to a read-only signal, and a document whose shape does not
//! match the device that was synthesized from it. Nothing is retried here; every error is handed
//! back to the caller with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SirepoError {
    /// The login handshake was rejected by the service.
    #[error("authentication failed for {sim_type}/{sim_id}: {reason}")]
    Authentication {
        sim_type: String,
        sim_id: String,
        reason: String,
    },

    /// An operation was invoked before the setup it depends on.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The remote simulation reached a terminal state other than "completed".
    #[error("simulation finished in state '{state}': {detail}")]
    SimulationFailed { state: String, detail: String },

    /// The client stopped polling before the simulation reached a terminal state.
    #[error("gave up after {attempts} status calls, last state '{state}'")]
    PollBudgetExhausted { attempts: usize, state: String },

    #[error("no element with {field} == {value}")]
    NotFound { field: String, value: String },

    #[error("signal '{0}' is read-only")]
    ReadOnly(String),

    /// A derived computation expected a field the device or document does not carry.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("unknown simulation type '{0}'")]
    UnknownSimType(String),

    #[error("model group '{0}' is missing from the simulation document")]
    MissingModel(String),

    #[error("renaming '{from}' to '{to}' would overwrite an existing field")]
    ReservedNameCollision { from: String, to: String },

    #[error("unknown report '{0}'")]
    UnknownReport(String),

    #[error("unknown device '{name}', registered devices are {registered:?}")]
    UnknownDevice {
        name: String,
        registered: Vec<String>,
    },

    #[error("device '{device}' has no signal '{field}'")]
    UnknownSignal { device: String, field: String },

    #[error("request to {url} failed with HTTP status {status}")]
    Http { url: String, status: u16 },

    /// The service answered with a JSON state other than "ok".
    #[error("{endpoint} returned state '{state}'")]
    Remote { endpoint: String, state: String },

    /// A response was missing a field the protocol requires.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to parse result: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal consistency violated: {0}")]
    InternalConsistency(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SirepoResult<T> = Result<T, SirepoError>;

impl SirepoError {
    pub fn not_found(field: &str, value: impl ToString) -> Self {
        SirepoError::NotFound {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    /// True for the failure classes that describe the remote job rather than the client.
    pub fn is_remote_execution(&self) -> bool {
        matches!(
            self,
            SirepoError::SimulationFailed { .. } | SirepoError::PollBudgetExhausted { .. }
        )
    }
}
