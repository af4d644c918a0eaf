use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Sending half of a worker connection.
pub trait Outbound: Send + Sync {
    /// Queue one text frame. An error means the connection is gone.
    fn send_message(&self, text: &str) -> Result<(), TransportError>;

    /// Ask the transport to drop the connection. Returns immediately.
    fn disconnect(&self);
}

/// Whether two handles point at the same connection.
pub fn same_endpoint(a: &Arc<dyn Outbound>, b: &Arc<dyn Outbound>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// [`Outbound`] backed by an unbounded channel drained by a writer task.
///
/// Sending fails once the receiving end is dropped. Disconnecting cancels
/// [`ChannelOutbound::closed`], which the connection's tasks select on.
#[derive(Debug)]
pub struct ChannelOutbound {
    sender: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl ChannelOutbound {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outbound = Arc::new(Self {
            sender,
            closed: CancellationToken::new(),
        });

        (outbound, receiver)
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_disconnected(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Outbound for ChannelOutbound {
    fn send_message(&self, text: &str) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        self.sender
            .send(text.to_string())
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self) {
        self.closed.cancel();
    }
}
