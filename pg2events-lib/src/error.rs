use thiserror::Error;

/// Error types for change capture and event distribution
#[derive(Error, Debug)]
pub enum EventsError {
    /// Auxiliary (catalog) database errors
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Native replication connection errors
    #[cfg(feature = "libpq")]
    #[error("Replication error: {0}")]
    Replication(#[from] pg_walstream::ReplicationError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Replication connection could not be opened or used
    #[error("Connection error: {0}")]
    Connection(String),

    /// Replication slot administration errors
    #[error("Replication slot error: {0}")]
    ReplicationSlot(String),

    /// Replication wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// wal2json payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A handler reported a failure for a record
    #[error("Handler error: {0}")]
    Handler(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record offered to a queue that stopped accepting
    #[error("Event queue is closed")]
    QueueClosed,

    /// Record offered to a holder before `init`
    #[error("Event queue holder for table '{0}' is not initialized")]
    HolderNotInitialized(String),

    /// Batch offered to a distributor after `close`
    #[error("Event distributor is closed")]
    DistributorClosed,

    /// `start` called on a running producer
    #[error("Producer is already running")]
    AlreadyRunning,

    /// Operation refused while the producer is running
    #[error("Producer is running")]
    ProducerRunning,

    /// Invalid registration arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EventsError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        EventsError::Config(msg.into())
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        EventsError::Connection(msg.into())
    }

    /// Create a new replication slot error
    pub fn replication_slot<S: Into<String>>(msg: S) -> Self {
        EventsError::ReplicationSlot(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        EventsError::Protocol(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        EventsError::Decode(msg.into())
    }

    /// Create a new handler error
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        EventsError::Handler(msg.into())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        EventsError::InvalidArgument(msg.into())
    }

    /// Programming-contract violations fail fast and are never retried
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            EventsError::QueueClosed
                | EventsError::HolderNotInitialized(_)
                | EventsError::DistributorClosed
                | EventsError::AlreadyRunning
                | EventsError::ProducerRunning
                | EventsError::InvalidArgument(_)
        )
    }
}

/// Result type for change capture operations
pub type Result<T> = std::result::Result<T, EventsError>;
