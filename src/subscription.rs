use crate::error::{Result, RotelError};
use crate::types::{ConnectionStatus, StateChange};
use tokio::sync::broadcast;

/// Receiver for device state changes
pub type ChangeReceiver = EventReceiver<StateChange>;

/// Receiver for connectivity status transitions
pub type StatusReceiver = EventReceiver<ConnectionStatus>;

/// Ordered stream of session notifications
///
/// Events are delivered in the order the session produced them. A receiver
/// that falls too far behind gets a [`RotelError::ChannelError`] reporting
/// how many events it missed, then continues with the oldest retained one.
pub struct EventReceiver<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventReceiver<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with [`RotelError::ConnectionClosed`] once the session is gone.
    pub async fn recv(&mut self) -> Result<T> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => RotelError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                RotelError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without waiting
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(RotelError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(RotelError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}
