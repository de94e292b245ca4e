//! Reservation queries.

use crate::projection::RESERVATIONS_COLLECTION;
use book_library_core::config::Config;
use book_library_core::context::{RequestContext, with_deadline};
use book_library_core::document::{DocumentStore, Filter, Page, PageRequest, select_fields};
use book_library_core::error::AppError;
use std::sync::Arc;

const ENTITY: &str = "RESERVATION";

/// Sort keys accepted by [`ReservationQueryHandler::list_reservations`].
const SORT_KEYS: [&str; 5] = ["reservedAt", "dueDate", "status", "createdAt", "updatedAt"];

/// Reservation search parameters.
#[derive(Clone, Debug, Default)]
pub struct ReservationListQuery {
    /// Filter by reserving user.
    pub user_id: Option<String>,
    /// Filter by reserved book.
    pub book_id: Option<String>,
    /// Filter by lifecycle status (lowercase, e.g. `"active"`).
    pub status: Option<String>,
    /// Pagination and sorting.
    pub page: PageRequest,
    /// Field allow-list for the response.
    pub fields: Option<Vec<String>>,
}

fn build_filter(query: &ReservationListQuery) -> Filter {
    let mut filter = Filter::all();
    if let Some(user_id) = &query.user_id {
        filter = filter.eq("userId", user_id.clone());
    }
    if let Some(book_id) = &query.book_id {
        filter = filter.eq("bookId", book_id.clone());
    }
    if let Some(status) = &query.status {
        filter = filter.eq("status", status.clone());
    }
    filter
}

/// Query side of the Reservations context.
pub struct ReservationQueryHandler {
    docs: Arc<dyn DocumentStore>,
    config: Config,
}

impl ReservationQueryHandler {
    /// Wire the handler to the projection store.
    #[must_use]
    pub const fn new(docs: Arc<dyn DocumentStore>, config: Config) -> Self {
        Self { docs, config }
    }

    /// Fetch one reservation by id.
    ///
    /// # Errors
    ///
    /// Returns `RESERVATION_NOT_FOUND` for unknown or deleted
    /// reservations.
    pub async fn get_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
        fields: Option<Vec<String>>,
    ) -> Result<serde_json::Value, AppError> {
        with_deadline(ctx, "GetReservation", async {
            let doc = self
                .docs
                .get(RESERVATIONS_COLLECTION, reservation_id, false)
                .await?
                .ok_or_else(|| AppError::not_found(ENTITY, reservation_id))?;
            Ok(match fields {
                Some(fields) => select_fields(&doc, &fields, "id"),
                None => doc,
            })
        })
        .await
    }

    /// Search reservations by user, book, or status.
    ///
    /// # Errors
    ///
    /// Returns `VALIDATION_ERROR` for a sort key outside the allow-list.
    pub async fn list_reservations(
        &self,
        ctx: &RequestContext,
        query: ReservationListQuery,
    ) -> Result<Page<serde_json::Value>, AppError> {
        with_deadline(ctx, "ListReservations", async {
            if let Some(sort_by) = &query.page.sort_by {
                if !SORT_KEYS.contains(&sort_by.as_str()) {
                    return Err(AppError::validation(format!(
                        "cannot sort reservations by {sort_by}"
                    )));
                }
            }

            let filter = build_filter(&query);
            let resolved = query.page.resolve(
                self.config.pagination_default_limit,
                self.config.pagination_max_limit,
            );
            let page = self
                .docs
                .find(
                    RESERVATIONS_COLLECTION,
                    filter,
                    resolved,
                    query.page.sort_by.clone(),
                    query.page.sort_order,
                    query.fields.clone(),
                )
                .await?;
            Ok(page)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builder_combines_equalities() {
        let query = ReservationListQuery {
            user_id: Some("u1".to_string()),
            status: Some("active".to_string()),
            ..ReservationListQuery::default()
        };
        assert_eq!(build_filter(&query).conditions.len(), 2);
    }
}
