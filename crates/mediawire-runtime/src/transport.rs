//! Collaborator traits implemented by the byte transport underneath a
//! [`TransportContext`](crate::TransportContext).

use std::io;

use crate::channel::{ChannelKind, CodecInfo};
use crate::events::LifecycleNotifier;

/// Outbound byte path for one channel.
pub trait TransportSink: Send + Sync {
    /// Write one unit. Returns the number of bytes accepted.
    ///
    /// Must not block; a full transport should return
    /// [`io::ErrorKind::WouldBlock`].
    fn send(&self, data: &[u8], codec: CodecInfo) -> io::Result<usize>;
}

/// Connection management for one channel.
///
/// `start` receives a notifier through which the transport reports
/// `Connected` and `Disconnected`.
pub trait TransportDriver: Send + Sync {
    fn start(
        &self,
        channel: ChannelKind,
        param: u32,
        notifier: &LifecycleNotifier,
    ) -> anyhow::Result<()>;

    fn stop(&self, channel: ChannelKind) -> anyhow::Result<()>;
}

/// Reports how many bytes the transport has accepted but not yet sent.
pub trait OccupancyProbe: Send + Sync {
    /// `None` when the figure is unavailable.
    fn unsent_bytes(&self) -> Option<usize>;
}

impl<F> OccupancyProbe for F
where
    F: Fn() -> Option<usize> + Send + Sync,
{
    fn unsent_bytes(&self) -> Option<usize> {
        self()
    }
}
