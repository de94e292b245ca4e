//! Wallet queries.

use crate::projection::WALLETS_COLLECTION;
use book_library_core::context::{RequestContext, with_deadline};
use book_library_core::document::{DocumentStore, Filter, select_fields};
use book_library_core::error::AppError;
use std::sync::Arc;

const ENTITY: &str = "WALLET";

/// Query side of the Wallets context.
pub struct WalletQueryHandler {
    docs: Arc<dyn DocumentStore>,
}

impl WalletQueryHandler {
    /// Wire the handler to the projection store.
    #[must_use]
    pub const fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// Fetch a user's wallet (unique per `userId`).
    ///
    /// # Errors
    ///
    /// Returns `WALLET_NOT_FOUND` when the user has no wallet.
    pub async fn get_wallet_by_user(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        fields: Option<Vec<String>>,
    ) -> Result<serde_json::Value, AppError> {
        with_deadline(ctx, "GetWalletByUser", async {
            let doc = self
                .docs
                .find_one(WALLETS_COLLECTION, Filter::all().eq("userId", user_id))
                .await?
                .ok_or_else(|| AppError::not_found(ENTITY, user_id))?;
            Ok(match fields {
                Some(fields) => select_fields(&doc, &fields, "id"),
                None => doc,
            })
        })
        .await
    }
}
