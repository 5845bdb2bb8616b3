use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::models::event::RideEvent;
use crate::ports::notify::Notifier;

/// Publishes ride events on a broadcast channel; the websocket feed and any in-process
/// push bridge subscribe to it. Nobody listening is not a failure.
#[derive(Clone)]
pub struct BroadcastNotifier {
    events_tx: broadcast::Sender<RideEvent>,
}

impl BroadcastNotifier {
    pub fn new(events_tx: broadcast::Sender<RideEvent>) -> Self {
        Self { events_tx }
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: &RideEvent) -> Result<(), NotifyError> {
        match self.events_tx.send(event.clone()) {
            Ok(receivers) => {
                debug!(ride_id = %event.ride_id, kind = ?event.kind, receivers, "ride event published");
            }
            Err(_) => debug!(ride_id = %event.ride_id, "no ride event subscribers"),
        }
        Ok(())
    }
}

/// Hands events to a background task that delivers them to `inner` in publish order.
/// Publishing never waits on the provider; a full queue drops the event.
pub struct QueuedNotifier {
    queue_tx: mpsc::Sender<RideEvent>,
}

impl QueuedNotifier {
    /// Must be called inside a tokio runtime.
    pub fn spawn(inner: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::channel::<RideEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                if let Err(err) = inner.notify(&event).await {
                    warn!(
                        ride_id = %event.ride_id,
                        kind = ?event.kind,
                        error = %err,
                        "ride notification dropped"
                    );
                }
            }
        });
        Self { queue_tx }
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn notify(&self, event: &RideEvent) -> Result<(), NotifyError> {
        self.queue_tx
            .try_send(event.clone())
            .map_err(|err| match err {
                TrySendError::Full(_) => NotifyError::Delivery("delivery queue full".to_string()),
                TrySendError::Closed(_) => {
                    NotifyError::Delivery("delivery worker stopped".to_string())
                }
            })
    }
}
