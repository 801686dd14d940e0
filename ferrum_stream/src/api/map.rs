use async_trait::async_trait;

use crate::api::datum::{Datum, Message};

/// Mapper is the user-defined per-record transform behind the Map RPC.
///
/// Every call is independent: the returned messages must depend only on `datum`.
/// Returning an error, or panicking, fails that single call and nothing else.
#[async_trait]
pub trait Mapper: Send + Sync + 'static {
    async fn map(&self, datum: Datum) -> anyhow::Result<Vec<Message>>;
}
