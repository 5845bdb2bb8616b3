use async_trait::async_trait;

use crate::error::NotifyError;
use crate::models::event::RideEvent;

/// Push/SMS style delivery of ride events. Fire-and-forget from the core's point of view.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &RideEvent) -> Result<(), NotifyError>;
}
