//! `PostgreSQL`-backed [`EventRepository`].

use crate::error::classify_sqlx_error;
use library_events_core::event::{Event, EventType, Item, PersistedEvent};
use library_events_core::repository::{EventRepository, StoreError};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// `PostgreSQL`-based repository of library events.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE library_events (
///     library_event_id BIGSERIAL PRIMARY KEY,
///     library_event_type TEXT NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// CREATE TABLE books (
///     library_event_id BIGINT PRIMARY KEY REFERENCES library_events ON DELETE CASCADE,
///     book_id BIGINT NOT NULL,
///     book_name TEXT NOT NULL,
///     book_author TEXT NOT NULL
/// );
/// ```
///
/// # Atomicity
///
/// Every upsert runs in its own transaction: the event row and the book row
/// are committed together or not at all. Replaying an UPDATE rewrites the same
/// values, so the final state does not depend on how often it was applied.
///
/// # Example
///
/// ```no_run
/// use library_events_postgres::PostgresEventRepository;
/// use library_events_core::event::{Event, Item};
/// use library_events_core::repository::EventRepository;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let repository = PostgresEventRepository::new(pool);
///
/// let created = repository
///     .upsert(&Event::create(Item::new(123, "Kafka Using Spring Boot", "Dilip")))
///     .await?;
///
/// let loaded = repository.find_by_id(created.id).await?;
/// assert_eq!(loaded, Some(created));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    /// Create a repository using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool and wrap it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection cannot be established.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

        tracing::info!(max_connections, "Connected to PostgreSQL");

        Ok(Self::new(pool))
    }

    /// Create the `library_events` and `books` tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Other`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Other(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_in_transaction(&self, event: &Event) -> Result<PersistedEvent, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let id = if let Some(id) = event.id {
            let updated = sqlx::query(
                r"
                UPDATE library_events
                SET library_event_type = $1
                WHERE library_event_id = $2
                ",
            )
            .bind(event.event_type.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                // Dropping the transaction rolls it back
                return Err(sqlx::Error::RowNotFound);
            }
            id
        } else {
            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO library_events (library_event_type)
                VALUES ($1)
                RETURNING library_event_id
                ",
            )
            .bind(event.event_type.as_str())
            .fetch_one(&mut *tx)
            .await?;
            id
        };

        sqlx::query(
            r"
            INSERT INTO books (library_event_id, book_id, book_name, book_author)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (library_event_id) DO UPDATE
            SET book_id = EXCLUDED.book_id,
                book_name = EXCLUDED.book_name,
                book_author = EXCLUDED.book_author
            ",
        )
        .bind(id)
        .bind(event.item.item_id)
        .bind(&event.item.name)
        .bind(&event.item.author)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PersistedEvent::from_event(id, event))
    }

    fn row_to_persisted_event(row: &PgRow) -> Result<PersistedEvent, StoreError> {
        let decode = |e: sqlx::Error| StoreError::Other(format!("Failed to decode row: {e}"));

        let event_type: String = row.try_get("library_event_type").map_err(decode)?;
        let event_type = EventType::parse(&event_type).ok_or_else(|| {
            StoreError::Other(format!("Invalid library event type: {event_type}"))
        })?;

        Ok(PersistedEvent {
            id: row.try_get("library_event_id").map_err(decode)?,
            event_type,
            item: Item {
                item_id: row.try_get("book_id").map_err(decode)?,
                name: row.try_get("book_name").map_err(decode)?,
                author: row.try_get("book_author").map_err(decode)?,
            },
        })
    }
}

impl EventRepository for PostgresEventRepository {
    fn upsert<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<PersistedEvent, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let start = Instant::now();
            let operation = if event.id.is_some() { "update" } else { "insert" };

            match self.upsert_in_transaction(event).await {
                Ok(persisted) => {
                    metrics::counter!("library_events_store_upserts_total", "operation" => operation)
                        .increment(1);
                    metrics::histogram!("library_events_store_upsert_duration_seconds")
                        .record(start.elapsed().as_secs_f64());

                    tracing::debug!(
                        library_event_id = persisted.id,
                        operation,
                        "Library event upserted"
                    );
                    Ok(persisted)
                },
                Err(sqlx::Error::RowNotFound) => match event.id {
                    Some(id) => Err(StoreError::NotFound(id)),
                    None => Err(StoreError::Other("Insert returned no row".to_string())),
                },
                Err(e) => {
                    let error = classify_sqlx_error(&e);
                    metrics::counter!("library_events_store_errors_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(operation, error = %error, "Library event upsert failed");
                    Err(error)
                },
            }
        })
    }

    fn find_by_id(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PersistedEvent>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT e.library_event_id, e.library_event_type,
                       b.book_id, b.book_name, b.book_author
                FROM library_events e
                JOIN books b ON b.library_event_id = e.library_event_id
                WHERE e.library_event_id = $1
                ",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

            row.as_ref().map(Self::row_to_persisted_event).transpose()
        })
    }
}
