use std::io;

use mediawire_transport::framing::PackError;
use mediawire_transport::reassembly::IngestError;

use crate::channel::ChannelKind;

/// Errors returned synchronously by [`TransportContext`](crate::TransportContext).
///
/// Malformed input and resource exhaustion on the receive path are not
/// errors; they are logged and counted in the channel stats.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{0} channel has no transport")]
    NotConfigured(ChannelKind),

    #[error("{0} channel is not started")]
    NotStarted(ChannelKind),

    #[error("{0} channel is already started")]
    AlreadyStarted(ChannelKind),

    #[error("empty payload")]
    EmptyPayload,

    #[error("payload of {len} bytes exceeds limit {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("transport send failed")]
    Transport(#[from] io::Error),

    #[error("fragment {index} rejected")]
    FragmentRejected {
        index: u8,
        #[source]
        source: Box<TransferError>,
    },

    #[error("fragment ingest refused")]
    Ingest(#[from] IngestError),

    #[error("failed to spawn {name} thread")]
    WorkerSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("transport driver failed: {0:#}")]
    Driver(anyhow::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport context is shut down")]
    ShutDown,
}

impl From<PackError> for TransferError {
    fn from(e: PackError) -> Self {
        match e {
            PackError::PayloadTooLarge { len, max } => TransferError::PayloadTooLarge { len, max },
        }
    }
}
