//! The seam between this crate and the outer application's subscription storage.
//!
//! The manager and cleaner mutate `Episode`/`Podcast` values in place but never own
//! where the full subscription list lives — that would reintroduce the back-reference
//! the design notes call out. Callers hand in any type implementing this trait.

use crate::model::Podcast;
use async_trait::async_trait;

#[async_trait]
pub trait SubscriptionPersister: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_all(&self, podcasts: &[Podcast]) -> Result<(), Self::Error>;
}
