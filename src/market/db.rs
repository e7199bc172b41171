use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::MarketError;

use super::models::*;

/// Async-safe handle to the marketplace database.
///
/// Wraps `MarketDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MarketDb>>,
}

impl DbHandle {
    pub fn new(db: MarketDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MarketDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| MarketError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, MarketDb>> {
        self.inner
            .lock()
            .map_err(|_| MarketError::LockPoisoned.into())
    }
}

/// Filters for `MarketDb::list_requests`. `None` means "any".
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub kind: Option<RequestKind>,
    pub status: Option<RequestStatus>,
    pub customer_id: Option<i64>,
}

pub struct MarketDb {
    pub(super) conn: Connection,
}

const USER_COLUMNS: &str = "id, name, email, role, created_at";

const REQUEST_COLUMNS: &str = "id, customer_id, kind, title, description, category, address, \
     budget_cents, material, quantity, unit, status, selected_application_id, created_at, updated_at";

const APPLICATION_COLUMNS: &str =
    "id, request_id, provider_id, amount_cents, message, status, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, application_id, payer_id, base_cents, rate_bps, tier, \
     amount_cents, status, reference, created_at, paid_at";

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, message, request_id, application_id, is_read, created_at";

impl MarketDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE,
                    role TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    customer_id INTEGER NOT NULL REFERENCES users(id),
                    kind TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    category TEXT NOT NULL DEFAULT '',
                    address TEXT NOT NULL DEFAULT '',
                    budget_cents INTEGER,
                    material TEXT,
                    quantity REAL,
                    unit TEXT,
                    status TEXT NOT NULL DEFAULT 'open',
                    selected_application_id INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS applications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                    provider_id INTEGER NOT NULL REFERENCES users(id),
                    amount_cents INTEGER NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'applied',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(request_id, provider_id)
                );

                CREATE TABLE IF NOT EXISTS payments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    payer_id INTEGER NOT NULL REFERENCES users(id),
                    base_cents INTEGER NOT NULL,
                    rate_bps INTEGER NOT NULL,
                    tier INTEGER NOT NULL,
                    amount_cents INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    reference TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    paid_at TEXT
                );

                CREATE TABLE IF NOT EXISTS chat_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    sender_id INTEGER NOT NULL REFERENCES users(id),
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    message TEXT NOT NULL,
                    request_id INTEGER,
                    application_id INTEGER,
                    is_read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_requests_customer ON requests(customer_id);
                CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(kind, status);
                CREATE INDEX IF NOT EXISTS idx_applications_request ON applications(request_id);
                CREATE INDEX IF NOT EXISTS idx_applications_provider ON applications(provider_id);
                CREATE INDEX IF NOT EXISTS idx_payments_application ON payments(application_id);
                CREATE INDEX IF NOT EXISTS idx_chat_application ON chat_messages(application_id);
                CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, is_read);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, name: &str, email: &str, role: Role) -> Result<User> {
        let name = name.trim();
        let email = email.trim().to_lowercase();
        if name.is_empty() {
            return Err(MarketError::validation("name must not be empty").into());
        }
        if !email.contains('@') {
            return Err(MarketError::validation(format!("invalid email '{}'", email)).into());
        }

        let taken: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .context("Failed to check email")?;
        if taken {
            return Err(
                MarketError::validation(format!("email '{}' is already registered", email)).into(),
            );
        }

        self.conn
            .execute(
                "INSERT INTO users (name, email, role) VALUES (?1, ?2, ?3)",
                params![name, email, role.as_str()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.require_user(id)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], read_user_row)
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn require_user(&self, id: i64) -> Result<User> {
        self.get_user(id)?
            .ok_or_else(|| MarketError::not_found("User", id).into())
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let sql = format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map([], read_user_row)
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    // ── Requests ──────────────────────────────────────────────────────

    pub fn create_request(&self, customer_id: i64, req: &NewRequest) -> Result<MarketRequest> {
        let customer = self.require_user(customer_id)?;
        if customer.role != Role::Customer {
            return Err(MarketError::forbidden("only customers can create requests").into());
        }
        if req.title.trim().is_empty() {
            return Err(MarketError::validation("title must not be empty").into());
        }
        if req.budget_cents.is_some_and(|b| b < 0) {
            return Err(MarketError::validation("budget must not be negative").into());
        }

        let (material, quantity, unit) = match req.kind {
            RequestKind::Material => {
                let material = req
                    .material
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| MarketError::validation("material requests need a material"))?;
                let quantity = req
                    .quantity
                    .filter(|q| q.is_finite() && *q > 0.0)
                    .ok_or_else(|| {
                        MarketError::validation("material requests need a positive quantity")
                    })?;
                let unit = req
                    .unit
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| MarketError::validation("material requests need a unit"))?;
                (Some(material.to_string()), Some(quantity), Some(unit.to_string()))
            }
            RequestKind::Service => (None, None, None),
        };

        self.conn
            .execute(
                "INSERT INTO requests (customer_id, kind, title, description, category, address, budget_cents, material, quantity, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    customer_id,
                    req.kind.as_str(),
                    req.title.trim(),
                    req.description,
                    req.category,
                    req.address,
                    req.budget_cents,
                    material,
                    quantity,
                    unit,
                ],
            )
            .context("Failed to insert request")?;
        let id = self.conn.last_insert_rowid();
        self.require_request(id)
    }

    pub fn get_request(&self, id: i64) -> Result<Option<MarketRequest>> {
        let sql = format!("SELECT {} FROM requests WHERE id = ?1", REQUEST_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], read_request_row)
            .optional()
            .context("Failed to query request")?;
        row.map(RequestRow::into_request).transpose()
    }

    pub fn require_request(&self, id: i64) -> Result<MarketRequest> {
        self.get_request(id)?
            .ok_or_else(|| MarketError::not_found("Request", id).into())
    }

    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<MarketRequest>> {
        let sql = format!(
            "SELECT {} FROM requests
             WHERE (?1 IS NULL OR kind = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR customer_id = ?3)
             ORDER BY id DESC",
            REQUEST_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_requests")?;
        let rows = stmt
            .query_map(
                params![
                    filter.kind.map(|k| k.as_str()),
                    filter.status.map(|s| s.as_str()),
                    filter.customer_id,
                ],
                read_request_row,
            )
            .context("Failed to query requests")?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row.context("Failed to read request row")?.into_request()?);
        }
        Ok(requests)
    }

    /// Edit the free-text fields of a request. Only the owner may edit, and
    /// only while the request still accepts applications.
    pub fn update_request(
        &self,
        id: i64,
        actor_id: i64,
        title: Option<&str>,
        description: Option<&str>,
        budget_cents: Option<i64>,
    ) -> Result<MarketRequest> {
        let request = self.require_request(id)?;
        if request.customer_id != actor_id {
            return Err(MarketError::forbidden("only the owner can edit a request").into());
        }
        if !request.status.accepts_applications() {
            return Err(MarketError::validation(format!(
                "request is {} and can no longer be edited",
                request.status
            ))
            .into());
        }
        if title.is_some_and(|t| t.trim().is_empty()) {
            return Err(MarketError::validation("title must not be empty").into());
        }
        if budget_cents.is_some_and(|b| b < 0) {
            return Err(MarketError::validation("budget must not be negative").into());
        }

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(t) = title {
            tx.execute(
                "UPDATE requests SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![t.trim(), id],
            )
            .context("Failed to update request title")?;
        }
        if let Some(d) = description {
            tx.execute(
                "UPDATE requests SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![d, id],
            )
            .context("Failed to update request description")?;
        }
        if let Some(b) = budget_cents {
            tx.execute(
                "UPDATE requests SET budget_cents = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![b, id],
            )
            .context("Failed to update request budget")?;
        }
        tx.commit().context("Failed to commit request update")?;
        self.require_request(id)
    }

    pub(super) fn set_request_status(&self, id: i64, status: RequestStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE requests SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update request status")?;
        Ok(())
    }

    pub(super) fn set_selected_application(
        &self,
        id: i64,
        application_id: Option<i64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE requests SET selected_application_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![application_id, id],
            )
            .context("Failed to update selected application")?;
        Ok(())
    }

    /// Request detail with applications projected for `viewer`: the owner
    /// and admins see every bid, a provider sees only their own.
    pub fn get_request_detail(&self, id: i64, viewer: &User) -> Result<RequestDetail> {
        let request = self.require_request(id)?;
        let all = self.list_applications_for_request(id)?;
        let application_count = all.len();

        let applications = if viewer.role == Role::Admin || viewer.id == request.customer_id {
            all
        } else if viewer.role.is_provider() {
            all.into_iter()
                .filter(|a| a.application.provider_id == viewer.id)
                .collect()
        } else {
            Vec::new()
        };

        Ok(RequestDetail {
            request,
            applications,
            application_count,
        })
    }

    // ── Applications ──────────────────────────────────────────────────

    pub fn get_application(&self, id: i64) -> Result<Option<Application>> {
        let sql = format!(
            "SELECT {} FROM applications WHERE id = ?1",
            APPLICATION_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id], read_application_row)
            .optional()
            .context("Failed to query application")?;
        row.map(ApplicationRow::into_application).transpose()
    }

    pub fn require_application(&self, id: i64) -> Result<Application> {
        self.get_application(id)?
            .ok_or_else(|| MarketError::not_found("Application", id).into())
    }

    pub fn list_applications_for_request(
        &self,
        request_id: i64,
    ) -> Result<Vec<ApplicationWithProvider>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.id, a.request_id, a.provider_id, a.amount_cents, a.message, a.status, a.created_at, a.updated_at, u.name
                 FROM applications a JOIN users u ON u.id = a.provider_id
                 WHERE a.request_id = ?1 ORDER BY a.id",
            )
            .context("Failed to prepare list_applications_for_request")?;
        let rows = stmt
            .query_map(params![request_id], |row| {
                Ok((read_application_row(row)?, row.get::<_, String>(8)?))
            })
            .context("Failed to query applications")?;
        let mut applications = Vec::new();
        for row in rows {
            let (r, provider_name) = row.context("Failed to read application row")?;
            applications.push(ApplicationWithProvider {
                application: r.into_application()?,
                provider_name,
            });
        }
        Ok(applications)
    }

    pub fn list_applications_for_provider(&self, provider_id: i64) -> Result<Vec<Application>> {
        let sql = format!(
            "SELECT {} FROM applications WHERE provider_id = ?1 ORDER BY id DESC",
            APPLICATION_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_applications_for_provider")?;
        let rows = stmt
            .query_map(params![provider_id], read_application_row)
            .context("Failed to query applications")?;
        let mut applications = Vec::new();
        for row in rows {
            applications.push(row.context("Failed to read application row")?.into_application()?);
        }
        Ok(applications)
    }

    pub(super) fn insert_application(
        &self,
        request_id: i64,
        provider_id: i64,
        amount_cents: i64,
        message: &str,
    ) -> Result<Application> {
        self.conn
            .execute(
                "INSERT INTO applications (request_id, provider_id, amount_cents, message) VALUES (?1, ?2, ?3, ?4)",
                params![request_id, provider_id, amount_cents, message],
            )
            .context("Failed to insert application")?;
        let id = self.conn.last_insert_rowid();
        self.require_application(id)
    }

    pub(super) fn set_application_status(&self, id: i64, status: ApplicationStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE applications SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update application status")?;
        Ok(())
    }

    // ── Payments ──────────────────────────────────────────────────────

    pub fn get_payment(&self, id: i64) -> Result<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], read_payment_row)
            .optional()
            .context("Failed to query payment")?;
        row.map(PaymentRow::into_payment).transpose()
    }

    pub fn require_payment(&self, id: i64) -> Result<Payment> {
        self.get_payment(id)?
            .ok_or_else(|| MarketError::not_found("Payment", id).into())
    }

    pub fn list_payments_for_user(&self, user_id: i64) -> Result<Vec<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE payer_id = ?1 ORDER BY id DESC",
            PAYMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_payments_for_user")?;
        let rows = stmt
            .query_map(params![user_id], read_payment_row)
            .context("Failed to query payments")?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row.context("Failed to read payment row")?.into_payment()?);
        }
        Ok(payments)
    }

    pub(super) fn insert_payment(
        &self,
        application_id: i64,
        payer_id: i64,
        breakdown: &super::commission::CommissionBreakdown,
    ) -> Result<Payment> {
        self.conn
            .execute(
                "INSERT INTO payments (application_id, payer_id, base_cents, rate_bps, tier, amount_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    application_id,
                    payer_id,
                    breakdown.base_cents,
                    breakdown.rate_bps,
                    breakdown.tier as i64,
                    breakdown.fee_cents,
                ],
            )
            .context("Failed to insert payment")?;
        let id = self.conn.last_insert_rowid();
        self.require_payment(id)
    }

    pub(super) fn mark_payment_paid(&self, id: i64, reference: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE payments SET status = 'paid', reference = ?1, paid_at = datetime('now') WHERE id = ?2",
                params![reference, id],
            )
            .context("Failed to mark payment paid")?;
        Ok(())
    }

    pub(super) fn cancel_pending_payments(&self, application_id: i64) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "UPDATE payments SET status = 'cancelled' WHERE application_id = ?1 AND status = 'pending'",
                params![application_id],
            )
            .context("Failed to cancel pending payments")?;
        Ok(count)
    }

    // ── Chat ──────────────────────────────────────────────────────────

    pub(super) fn insert_chat_message(
        &self,
        application_id: i64,
        sender_id: i64,
        body: &str,
    ) -> Result<ChatMessage> {
        self.conn
            .execute(
                "INSERT INTO chat_messages (application_id, sender_id, body) VALUES (?1, ?2, ?3)",
                params![application_id, sender_id, body],
            )
            .context("Failed to insert chat message")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, application_id, sender_id, body, created_at FROM chat_messages WHERE id = ?1",
                params![id],
                read_chat_row,
            )
            .context("Chat message not found after insert")
    }

    pub(super) fn chat_messages(&self, application_id: i64) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, application_id, sender_id, body, created_at
                 FROM chat_messages WHERE application_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare chat_messages")?;
        let rows = stmt
            .query_map(params![application_id], read_chat_row)
            .context("Failed to query chat messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read chat row")?);
        }
        Ok(messages)
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn create_notification(
        &self,
        user_id: i64,
        kind: NotificationKind,
        message: &str,
        request_id: Option<i64>,
        application_id: Option<i64>,
    ) -> Result<Notification> {
        self.conn
            .execute(
                "INSERT INTO notifications (user_id, kind, message, request_id, application_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, kind.as_str(), message, request_id, application_id],
            )
            .context("Failed to insert notification")?;
        let id = self.conn.last_insert_rowid();
        let sql = format!(
            "SELECT {} FROM notifications WHERE id = ?1",
            NOTIFICATION_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id], read_notification_row)
            .context("Notification not found after insert")?
            .into_notification()
    }

    pub fn list_notifications(&self, user_id: i64, unread_only: bool) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications
             WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
             ORDER BY id DESC",
            NOTIFICATION_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_notifications")?;
        let rows = stmt
            .query_map(params![user_id, unread_only], read_notification_row)
            .context("Failed to query notifications")?;
        let mut notifications = Vec::new();
        for row in rows {
            let row = row.context("Failed to read notification row")?;
            notifications.push(row.into_notification()?);
        }
        Ok(notifications)
    }

    /// Mark one of `user_id`'s notifications read. Someone else's
    /// notification is reported as not found.
    pub fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to mark notification read")?;
        if count == 0 {
            return Err(MarketError::not_found("Notification", id).into());
        }
        Ok(())
    }

    pub fn mark_all_notifications_read(&self, user_id: i64) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                params![user_id],
            )
            .context("Failed to mark notifications read")?;
        Ok(count)
    }

    // ── Stats ─────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<MarketStats> {
        let users: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")?;
        let requests_by_status = self.count_by_status("requests")?;
        let applications_by_status = self.count_by_status("applications")?;
        let (commission_collected_cents, commission_pending_cents): (i64, i64) = self
            .conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'paid' THEN amount_cents END), 0),
                    COALESCE(SUM(CASE WHEN status = 'pending' THEN amount_cents END), 0)
                 FROM payments",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to sum payments")?;

        Ok(MarketStats {
            users,
            requests_by_status,
            applications_by_status,
            commission_collected_cents,
            commission_pending_cents,
        })
    }

    fn count_by_status(&self, table: &'static str) -> Result<Vec<StatusCount>> {
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status ORDER BY status",
            table
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare status count")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StatusCount {
                    status: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .context("Failed to count statuses")?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row.context("Failed to read status count")?);
        }
        Ok(counts)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

struct UserRow {
    id: i64,
    name: String,
    email: String,
    role: String,
    created_at: String,
}

fn read_user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            name: self.name,
            email: self.email,
            role: Role::from_str(&self.role).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
        })
    }
}

struct RequestRow {
    id: i64,
    customer_id: i64,
    kind: String,
    title: String,
    description: String,
    category: String,
    address: String,
    budget_cents: Option<i64>,
    material: Option<String>,
    quantity: Option<f64>,
    unit: Option<String>,
    status: String,
    selected_application_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

fn read_request_row(row: &Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        category: row.get(5)?,
        address: row.get(6)?,
        budget_cents: row.get(7)?,
        material: row.get(8)?,
        quantity: row.get(9)?,
        unit: row.get(10)?,
        status: row.get(11)?,
        selected_application_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl RequestRow {
    fn into_request(self) -> Result<MarketRequest> {
        Ok(MarketRequest {
            id: self.id,
            customer_id: self.customer_id,
            kind: RequestKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?,
            title: self.title,
            description: self.description,
            category: self.category,
            address: self.address,
            budget_cents: self.budget_cents,
            material: self.material,
            quantity: self.quantity,
            unit: self.unit,
            status: RequestStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            selected_application_id: self.selected_application_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ApplicationRow {
    id: i64,
    request_id: i64,
    provider_id: i64,
    amount_cents: i64,
    message: String,
    status: String,
    created_at: String,
    updated_at: String,
}

fn read_application_row(row: &Row<'_>) -> rusqlite::Result<ApplicationRow> {
    Ok(ApplicationRow {
        id: row.get(0)?,
        request_id: row.get(1)?,
        provider_id: row.get(2)?,
        amount_cents: row.get(3)?,
        message: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl ApplicationRow {
    fn into_application(self) -> Result<Application> {
        Ok(Application {
            id: self.id,
            request_id: self.request_id,
            provider_id: self.provider_id,
            amount_cents: self.amount_cents,
            message: self.message,
            status: ApplicationStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct PaymentRow {
    id: i64,
    application_id: i64,
    payer_id: i64,
    base_cents: i64,
    rate_bps: u32,
    tier: i64,
    amount_cents: i64,
    status: String,
    reference: Option<String>,
    created_at: String,
    paid_at: Option<String>,
}

fn read_payment_row(row: &Row<'_>) -> rusqlite::Result<PaymentRow> {
    Ok(PaymentRow {
        id: row.get(0)?,
        application_id: row.get(1)?,
        payer_id: row.get(2)?,
        base_cents: row.get(3)?,
        rate_bps: row.get(4)?,
        tier: row.get(5)?,
        amount_cents: row.get(6)?,
        status: row.get(7)?,
        reference: row.get(8)?,
        created_at: row.get(9)?,
        paid_at: row.get(10)?,
    })
}

impl PaymentRow {
    fn into_payment(self) -> Result<Payment> {
        Ok(Payment {
            id: self.id,
            application_id: self.application_id,
            payer_id: self.payer_id,
            base_cents: self.base_cents,
            rate_bps: self.rate_bps,
            tier: usize::try_from(self.tier).context("Negative commission tier")?,
            amount_cents: self.amount_cents,
            status: PaymentStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            reference: self.reference,
            created_at: self.created_at,
            paid_at: self.paid_at,
        })
    }
}

fn read_chat_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        application_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
    })
}

struct NotificationRow {
    id: i64,
    user_id: i64,
    kind: String,
    message: String,
    request_id: Option<i64>,
    application_id: Option<i64>,
    read: bool,
    created_at: String,
}

fn read_notification_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        message: row.get(3)?,
        request_id: row.get(4)?,
        application_id: row.get(5)?,
        read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl NotificationRow {
    fn into_notification(self) -> Result<Notification> {
        Ok(Notification {
            id: self.id,
            user_id: self.user_id,
            kind: NotificationKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?,
            message: self.message,
            request_id: self.request_id,
            application_id: self.application_id,
            read: self.read,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn service_request(title: &str) -> NewRequest {
        NewRequest {
            kind: RequestKind::Service,
            title: title.to_string(),
            description: "Kitchen sink leaks".to_string(),
            category: "plumbing".to_string(),
            address: "12 Elm St".to_string(),
            budget_cents: Some(80_000),
            material: None,
            quantity: None,
            unit: None,
        }
    }

    pub(crate) fn material_request(title: &str) -> NewRequest {
        NewRequest {
            kind: RequestKind::Material,
            title: title.to_string(),
            description: String::new(),
            category: "masonry".to_string(),
            address: "12 Elm St".to_string(),
            budget_cents: None,
            material: Some("Portland cement".to_string()),
            quantity: Some(40.0),
            unit: Some("bag".to_string()),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let tables: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for expected in [
            "applications",
            "chat_messages",
            "notifications",
            "payments",
            "requests",
            "users",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
        // Migrations are idempotent
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_file_backed_database_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("market.db");
        {
            let db = MarketDb::new(&path)?;
            db.create_user("Ana", "ana@example.com", Role::Customer)?;
        }
        let db = MarketDb::new(&path)?;
        assert_eq!(db.list_users()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_create_user_normalizes_email() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let user = db.create_user("  Ana ", " Ana@Example.com ", Role::Customer)?;
        assert_eq!(user.name, "Ana");
        assert_eq!(user.email, "ana@example.com");
        assert_eq!(user.role, Role::Customer);
        Ok(())
    }

    #[test]
    fn test_duplicate_email_rejected() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let err = db
            .create_user("Other Ana", "ANA@example.com", Role::Contractor)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarketError>(),
            Some(MarketError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_get_missing_user() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        assert!(db.get_user(99)?.is_none());
        let err = db.require_user(99).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarketError>(),
            Some(MarketError::NotFound { entity: "User", id: 99 })
        ));
        Ok(())
    }

    #[test]
    fn test_create_service_request() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let customer = db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let request = db.create_request(customer.id, &service_request("Fix sink"))?;
        assert_eq!(request.kind, RequestKind::Service);
        assert_eq!(request.status, RequestStatus::Open);
        assert_eq!(request.budget_cents, Some(80_000));
        assert!(request.material.is_none());
        assert!(request.selected_application_id.is_none());
        Ok(())
    }

    #[test]
    fn test_material_request_requires_material_fields() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let customer = db.create_user("Ana", "ana@example.com", Role::Customer)?;

        let mut incomplete = material_request("Cement");
        incomplete.quantity = Some(0.0);
        assert!(db.create_request(customer.id, &incomplete).is_err());

        let request = db.create_request(customer.id, &material_request("Cement"))?;
        assert_eq!(request.material.as_deref(), Some("Portland cement"));
        assert_eq!(request.quantity, Some(40.0));
        assert_eq!(request.unit.as_deref(), Some("bag"));
        Ok(())
    }

    #[test]
    fn test_only_customers_create_requests() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let contractor = db.create_user("Bo", "bo@example.com", Role::Contractor)?;
        let err = db
            .create_request(contractor.id, &service_request("Fix sink"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarketError>(),
            Some(MarketError::Forbidden(_))
        ));
        Ok(())
    }

    #[test]
    fn test_list_requests_filters() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let ana = db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let cy = db.create_user("Cy", "cy@example.com", Role::Customer)?;
        db.create_request(ana.id, &service_request("Fix sink"))?;
        db.create_request(ana.id, &material_request("Cement"))?;
        db.create_request(cy.id, &service_request("Paint fence"))?;

        assert_eq!(db.list_requests(&RequestFilter::default())?.len(), 3);

        let services = db.list_requests(&RequestFilter {
            kind: Some(RequestKind::Service),
            ..Default::default()
        })?;
        assert_eq!(services.len(), 2);

        let anas = db.list_requests(&RequestFilter {
            customer_id: Some(ana.id),
            ..Default::default()
        })?;
        assert_eq!(anas.len(), 2);
        // Newest first
        assert_eq!(anas[0].title, "Cement");

        let closed = db.list_requests(&RequestFilter {
            status: Some(RequestStatus::Closed),
            ..Default::default()
        })?;
        assert!(closed.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_request_fields() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let ana = db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let request = db.create_request(ana.id, &service_request("Fix sink"))?;

        let updated =
            db.update_request(request.id, ana.id, Some("Fix both sinks"), None, Some(120_000))?;
        assert_eq!(updated.title, "Fix both sinks");
        assert_eq!(updated.description, "Kitchen sink leaks");
        assert_eq!(updated.budget_cents, Some(120_000));
        Ok(())
    }

    #[test]
    fn test_update_request_rejects_non_owner_and_closed() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let ana = db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let cy = db.create_user("Cy", "cy@example.com", Role::Customer)?;
        let request = db.create_request(ana.id, &service_request("Fix sink"))?;

        assert!(db.update_request(request.id, cy.id, Some("Mine now"), None, None).is_err());

        db.set_request_status(request.id, RequestStatus::Closed)?;
        let err = db
            .update_request(request.id, ana.id, Some("Too late"), None, None)
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
        Ok(())
    }

    #[test]
    fn test_notifications_read_flow() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let ana = db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let bo = db.create_user("Bo", "bo@example.com", Role::Contractor)?;
        let n1 = db.create_notification(
            ana.id,
            NotificationKind::ApplicationReceived,
            "New bid",
            None,
            None,
        )?;
        db.create_notification(ana.id, NotificationKind::NewMessage, "Hello", None, None)?;
        assert!(!n1.read);

        assert_eq!(db.list_notifications(ana.id, true)?.len(), 2);
        db.mark_notification_read(n1.id, ana.id)?;
        assert_eq!(db.list_notifications(ana.id, true)?.len(), 1);
        assert_eq!(db.list_notifications(ana.id, false)?.len(), 2);

        // Cannot touch someone else's notification
        assert!(db.mark_notification_read(n1.id, bo.id).is_err());

        assert_eq!(db.mark_all_notifications_read(ana.id)?, 1);
        assert!(db.list_notifications(ana.id, true)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_stats_on_empty_database() -> Result<()> {
        let db = MarketDb::new_in_memory()?;
        let stats = db.get_stats()?;
        assert_eq!(stats.users, 0);
        assert!(stats.requests_by_status.is_empty());
        assert_eq!(stats.commission_collected_cents, 0);
        assert_eq!(stats.commission_pending_cents, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(MarketDb::new_in_memory()?);
        let user = handle
            .call(|db| db.create_user("Ana", "ana@example.com", Role::Customer))
            .await?;
        let fetched = handle.call(move |db| db.require_user(user.id)).await?;
        assert_eq!(fetched.email, "ana@example.com");
        Ok(())
    }
}
