//! Error taxonomy for cluster-control operations.
//!
//! The kinds mirror how failures are handled, not where they occur:
//! transient errors are retried inside operation deadlines, stale updates
//! are rejected back to the caller for re-sync, and identity or persistence
//! failures are fatal for the node that hits them.

use thiserror::Error;

/// A specialized `Result` type for Clustore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cluster-control plane.
#[derive(Debug, Error)]
pub enum Error {
    /// A transient network failure: connection refused, timeout, or a
    /// retryable 5xx from a peer. Retried within operation deadlines and
    /// never surfaced while retries remain.
    #[error("transient: {0}")]
    Transient(String),

    /// A metadata update carried a version that does not advance the
    /// receiver's copy. The sender must pull the higher version.
    #[error("stale {tag} update: have v{have}, got v{got}")]
    StaleUpdate {
        /// Which metadata object was updated ("smap" or "bmd").
        tag: &'static str,
        /// Version currently held by the receiver.
        have: i64,
        /// Version carried by the rejected update.
        got: i64,
    },

    /// A peer reports a different cluster UUID. Never recovered locally;
    /// the node refuses to merge and surfaces this to the operator.
    #[error("cluster identity mismatch: expected UUID {expected}, got {got}")]
    ClusterIdentity {
        /// UUID this node belongs to.
        expected: String,
        /// UUID reported by the peer (or a divergent persisted copy).
        got: String,
    },

    /// A primary election is in progress; metadata learned now must not be
    /// committed. A signal to wait, not a failure.
    #[error("vote in progress")]
    VoteInProgress,

    /// An election round timed out without collecting a proxy majority.
    #[error("no quorum at epoch {epoch}: {yes} yes of {needed} needed")]
    QuorumFailure {
        /// Smap version the election was called at.
        epoch: i64,
        /// Yes ballots collected from proxies.
        yes: usize,
        /// Ballots required for a strict majority.
        needed: usize,
    },

    /// No mountpath accepted a metadata write. Fatal for the writer: a
    /// primary that cannot persist must step down.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Every remaining proxy is flagged non-electable; the cluster is
    /// unavailable until an electable proxy joins.
    #[error("no electable proxy in cluster map")]
    NoElectableProxy,

    /// Invalid or unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request that can never succeed as posed (duplicate daemon ID,
    /// malformed endpoint, unknown node).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Returns the stable wire code for this error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::StaleUpdate { .. } => "stale-update",
            Self::ClusterIdentity { .. } => "cluster-identity",
            Self::VoteInProgress => "vote-in-progress",
            Self::QuorumFailure { .. } => "quorum-failure",
            Self::Persistence(_) => "persistence",
            Self::NoElectableProxy => "no-electable-proxy",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::InvalidRequest(_) => "invalid-request",
        }
    }

    /// Returns the HTTP status code used when this error crosses the wire.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Transient(_) | Self::VoteInProgress => 503,
            Self::StaleUpdate { .. } => 409,
            Self::ClusterIdentity { .. } => 412,
            Self::InvalidRequest(_) | Self::Config(_) => 400,
            Self::QuorumFailure { .. }
            | Self::Persistence(_)
            | Self::NoElectableProxy
            | Self::Io(_) => 500,
        }
    }

    /// Returns the status code as an `http::StatusCode`.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.http_status())
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// True if the operation may be retried within its deadline.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::VoteInProgress)
    }

    /// Builds the JSON envelope carried by non-2xx responses.
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.http_status(),
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// JSON body of a non-2xx control-plane response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    /// HTTP status code, duplicated in the body for log scraping.
    pub code: u16,
    /// Stable error kind, see [`Error::kind`].
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}
