//! Transactional bidding operations.
//!
//! Each operation loads the rows it touches, checks the actor and the
//! status edges from `workflow`, then writes every status change and
//! notification inside one SQLite transaction. The returned
//! [`BiddingOutcome`] carries the fresh rows so the HTTP layer can push
//! them to connected clients.

use anyhow::{Context, Result};
use tracing::info;

use crate::errors::MarketError;

use super::commission::CommissionSchedule;
use super::db::MarketDb;
use super::models::*;
use super::workflow::{
    ensure_application_transition, ensure_request_transition, request_status_after_release,
};

#[derive(Debug, Clone)]
pub struct BiddingOutcome {
    pub request: MarketRequest,
    pub previous_status: RequestStatus,
    /// The application the operation acted on, if any.
    pub application: Option<Application>,
    pub payment: Option<Payment>,
    /// Other applications rejected as a side effect (approval or close).
    pub rejected: Vec<Application>,
    pub notifications: Vec<Notification>,
}

impl BiddingOutcome {
    pub fn request_status_changed(&self) -> bool {
        self.previous_status != self.request.status
    }
}

impl MarketDb {
    pub fn submit_application(
        &self,
        request_id: i64,
        provider_id: i64,
        amount_cents: i64,
        message: &str,
    ) -> Result<BiddingOutcome> {
        let provider = self.require_user(provider_id)?;
        let request = self.require_request(request_id)?;

        let expected = request.kind.provider_role();
        if provider.role != expected {
            return Err(MarketError::forbidden(format!(
                "{} requests only accept applications from a {}",
                request.kind, expected
            ))
            .into());
        }
        if !request.status.accepts_applications() {
            return Err(MarketError::InvalidTransition {
                entity: "request",
                from: request.status.as_str().to_string(),
                to: RequestStatus::Applied.as_str().to_string(),
            }
            .into());
        }
        if amount_cents <= 0 {
            return Err(MarketError::validation("bid amount must be positive").into());
        }
        let already: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM applications WHERE request_id = ?1 AND provider_id = ?2",
                rusqlite::params![request_id, provider_id],
                |row| row.get(0),
            )
            .context("Failed to check existing application")?;
        if already {
            return Err(MarketError::DuplicateApplication {
                request_id,
                provider_id,
            }
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let application = self.insert_application(request_id, provider_id, amount_cents, message)?;
        if request.status == RequestStatus::Open {
            self.set_request_status(request_id, RequestStatus::Applied)?;
        }
        let notification = self.create_notification(
            request.customer_id,
            NotificationKind::ApplicationReceived,
            &format!(
                "{} bid {} on \"{}\"",
                provider.name,
                format_cents(amount_cents),
                request.title
            ),
            Some(request_id),
            Some(application.id),
        )?;
        tx.commit().context("Failed to commit application")?;

        info!(
            request_id,
            application_id = application.id,
            provider_id,
            amount_cents,
            "application submitted"
        );

        Ok(BiddingOutcome {
            request: self.require_request(request_id)?,
            previous_status: request.status,
            application: Some(application),
            payment: None,
            rejected: Vec::new(),
            notifications: vec![notification],
        })
    }

    /// The request owner picks one application.
    pub fn select_application(&self, application_id: i64, actor_id: i64) -> Result<BiddingOutcome> {
        let application = self.require_application(application_id)?;
        let request = self.require_request(application.request_id)?;
        if request.customer_id != actor_id {
            return Err(MarketError::forbidden("only the request owner can select a bid").into());
        }
        ensure_application_transition(application.status, ApplicationStatus::Selected)?;
        ensure_request_transition(request.status, RequestStatus::Selected)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.set_application_status(application_id, ApplicationStatus::Selected)?;
        self.set_request_status(request.id, RequestStatus::Selected)?;
        self.set_selected_application(request.id, Some(application_id))?;
        let notification = self.create_notification(
            application.provider_id,
            NotificationKind::ApplicationSelected,
            &format!(
                "Your bid on \"{}\" was selected. Confirm to proceed.",
                request.title
            ),
            Some(request.id),
            Some(application_id),
        )?;
        tx.commit().context("Failed to commit selection")?;

        info!(request_id = request.id, application_id, "application selected");
        self.outcome(request, application_id, None, Vec::new(), vec![notification])
    }

    /// The selected provider accepts the job. The commission is quoted on
    /// the bid amount and a pending payment is opened.
    pub fn confirm_selection(
        &self,
        application_id: i64,
        actor_id: i64,
        schedule: &CommissionSchedule,
    ) -> Result<BiddingOutcome> {
        let application = self.require_application(application_id)?;
        let request = self.require_request(application.request_id)?;
        if application.provider_id != actor_id {
            return Err(MarketError::forbidden("only the selected provider can confirm").into());
        }
        ensure_application_transition(application.status, ApplicationStatus::PendingCommission)?;
        ensure_request_transition(request.status, RequestStatus::PendingCommission)?;
        let breakdown = schedule.quote(application.amount_cents)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.set_application_status(application_id, ApplicationStatus::PendingCommission)?;
        self.set_request_status(request.id, RequestStatus::PendingCommission)?;
        let payment = self.insert_payment(application_id, actor_id, &breakdown)?;
        let due = self.create_notification(
            actor_id,
            NotificationKind::CommissionDue,
            &format!(
                "Commission of {} is due for \"{}\"",
                format_cents(breakdown.fee_cents),
                request.title
            ),
            Some(request.id),
            Some(application_id),
        )?;
        let confirmed = self.create_notification(
            request.customer_id,
            NotificationKind::SelectionConfirmed,
            &format!("The provider confirmed \"{}\"", request.title),
            Some(request.id),
            Some(application_id),
        )?;
        tx.commit().context("Failed to commit confirmation")?;

        info!(
            request_id = request.id,
            application_id,
            payment_id = payment.id,
            fee_cents = breakdown.fee_cents,
            tier = breakdown.tier,
            "selection confirmed, commission pending"
        );
        self.outcome(
            request,
            application_id,
            Some(payment.id),
            Vec::new(),
            vec![due, confirmed],
        )
    }

    /// The selected provider turns the job down.
    pub fn decline_selection(&self, application_id: i64, actor_id: i64) -> Result<BiddingOutcome> {
        let application = self.require_application(application_id)?;
        let request = self.require_request(application.request_id)?;
        if application.provider_id != actor_id {
            return Err(MarketError::forbidden("only the selected provider can decline").into());
        }
        if !application.status.holds_selection() {
            return Err(MarketError::InvalidTransition {
                entity: "application",
                from: application.status.as_str().to_string(),
                to: ApplicationStatus::Rejected.as_str().to_string(),
            }
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.set_application_status(application_id, ApplicationStatus::Rejected)?;
        self.cancel_pending_payments(application_id)?;
        self.release_selection(&request, application_id)?;
        let notification = self.create_notification(
            request.customer_id,
            NotificationKind::SelectionDeclined,
            &format!("The selected provider declined \"{}\"", request.title),
            Some(request.id),
            Some(application_id),
        )?;
        tx.commit().context("Failed to commit decline")?;

        info!(request_id = request.id, application_id, "selection declined");
        self.outcome(request, application_id, None, Vec::new(), vec![notification])
    }

    /// The request owner (or an admin) turns an application down.
    pub fn reject_application(&self, application_id: i64, actor_id: i64) -> Result<BiddingOutcome> {
        let actor = self.require_user(actor_id)?;
        let application = self.require_application(application_id)?;
        let request = self.require_request(application.request_id)?;
        if request.customer_id != actor.id && actor.role != Role::Admin {
            return Err(MarketError::forbidden("only the request owner can reject a bid").into());
        }
        ensure_application_transition(application.status, ApplicationStatus::Rejected)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.set_application_status(application_id, ApplicationStatus::Rejected)?;
        self.cancel_pending_payments(application_id)?;
        if application.status.holds_selection() {
            self.release_selection(&request, application_id)?;
        } else {
            self.reopen_if_unbid(&request)?;
        }
        let notification = self.create_notification(
            application.provider_id,
            NotificationKind::ApplicationRejected,
            &format!("Your bid on \"{}\" was rejected", request.title),
            Some(request.id),
            Some(application_id),
        )?;
        tx.commit().context("Failed to commit rejection")?;

        info!(request_id = request.id, application_id, actor_id, "application rejected");
        self.outcome(request, application_id, None, Vec::new(), vec![notification])
    }

    /// The provider pulls a bid that has not been selected yet.
    pub fn withdraw_application(
        &self,
        application_id: i64,
        actor_id: i64,
    ) -> Result<BiddingOutcome> {
        let application = self.require_application(application_id)?;
        let request = self.require_request(application.request_id)?;
        if application.provider_id != actor_id {
            return Err(MarketError::forbidden("only the applicant can withdraw a bid").into());
        }
        ensure_application_transition(application.status, ApplicationStatus::Withdrawn)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.set_application_status(application_id, ApplicationStatus::Withdrawn)?;
        self.reopen_if_unbid(&request)?;
        let notification = self.create_notification(
            request.customer_id,
            NotificationKind::ApplicationWithdrawn,
            &format!("A bid on \"{}\" was withdrawn", request.title),
            Some(request.id),
            Some(application_id),
        )?;
        tx.commit().context("Failed to commit withdrawal")?;

        info!(request_id = request.id, application_id, "application withdrawn");
        self.outcome(request, application_id, None, Vec::new(), vec![notification])
    }

    /// Settle the commission. Approves the application and rejects every
    /// other live bid on the request.
    pub fn pay_commission(&self, payment_id: i64, actor_id: i64) -> Result<BiddingOutcome> {
        let payment = self.require_payment(payment_id)?;
        if payment.payer_id != actor_id {
            return Err(MarketError::forbidden("only the payer can settle this payment").into());
        }
        if payment.status != PaymentStatus::Pending {
            return Err(MarketError::InvalidTransition {
                entity: "payment",
                from: payment.status.as_str().to_string(),
                to: PaymentStatus::Paid.as_str().to_string(),
            }
            .into());
        }
        let application = self.require_application(payment.application_id)?;
        let request = self.require_request(application.request_id)?;
        ensure_application_transition(application.status, ApplicationStatus::Approved)?;
        ensure_request_transition(request.status, RequestStatus::Approved)?;

        let reference = payment_reference();
        let competitors: Vec<Application> = self
            .list_applications_for_request(request.id)?
            .into_iter()
            .map(|a| a.application)
            .filter(|a| a.id != application.id && a.status.is_live())
            .collect();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.mark_payment_paid(payment_id, &reference)?;
        self.set_application_status(application.id, ApplicationStatus::Approved)?;
        self.set_request_status(request.id, RequestStatus::Approved)?;

        let mut notifications = Vec::new();
        notifications.push(self.create_notification(
            application.provider_id,
            NotificationKind::ApplicationApproved,
            &format!(
                "Commission received ({}). You are approved for \"{}\"",
                reference, request.title
            ),
            Some(request.id),
            Some(application.id),
        )?);
        notifications.push(self.create_notification(
            request.customer_id,
            NotificationKind::CommissionPaid,
            &format!("\"{}\" is approved and ready to start", request.title),
            Some(request.id),
            Some(application.id),
        )?);
        let mut rejected = Vec::new();
        for other in competitors {
            self.set_application_status(other.id, ApplicationStatus::Rejected)?;
            self.cancel_pending_payments(other.id)?;
            notifications.push(self.create_notification(
                other.provider_id,
                NotificationKind::ApplicationRejected,
                &format!("Another provider was chosen for \"{}\"", request.title),
                Some(request.id),
                Some(other.id),
            )?);
            rejected.push(self.require_application(other.id)?);
        }
        tx.commit().context("Failed to commit payment")?;

        info!(
            request_id = request.id,
            application_id = application.id,
            payment_id,
            reference = %reference,
            rejected = rejected.len(),
            "commission paid, application approved"
        );
        self.outcome(request, application.id, Some(payment_id), rejected, notifications)
    }

    /// Close a request. Live bids are rejected; an approved bid stays
    /// approved, which makes this the completion step for approved work.
    pub fn close_request(&self, request_id: i64, actor_id: i64) -> Result<BiddingOutcome> {
        let actor = self.require_user(actor_id)?;
        let request = self.require_request(request_id)?;
        if request.customer_id != actor.id && actor.role != Role::Admin {
            return Err(MarketError::forbidden("only the request owner can close it").into());
        }
        ensure_request_transition(request.status, RequestStatus::Closed)?;

        let applications = self.list_applications_for_request(request_id)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut notifications = Vec::new();
        let mut rejected = Vec::new();
        for entry in applications {
            let app = entry.application;
            let affected = app.status.is_live() || app.status == ApplicationStatus::Approved;
            if app.status.is_live() {
                self.set_application_status(app.id, ApplicationStatus::Rejected)?;
                self.cancel_pending_payments(app.id)?;
                rejected.push(self.require_application(app.id)?);
            }
            if affected {
                notifications.push(self.create_notification(
                    app.provider_id,
                    NotificationKind::RequestClosed,
                    &format!("\"{}\" was closed", request.title),
                    Some(request_id),
                    Some(app.id),
                )?);
            }
        }
        self.set_request_status(request_id, RequestStatus::Closed)?;
        tx.commit().context("Failed to commit close")?;

        info!(request_id, actor_id, rejected = rejected.len(), "request closed");
        Ok(BiddingOutcome {
            request: self.require_request(request_id)?,
            previous_status: request.status,
            application: None,
            payment: None,
            rejected,
            notifications,
        })
    }

    // ── Helpers ───────────────────────────────────────────────────────

    /// Free the request's selection slot after `released_id` stops being
    /// a candidate.
    fn release_selection(&self, request: &MarketRequest, released_id: i64) -> Result<()> {
        let remaining: Vec<ApplicationStatus> = self
            .list_applications_for_request(request.id)?
            .into_iter()
            .filter(|a| a.application.id != released_id)
            .map(|a| a.application.status)
            .collect();
        let next = request_status_after_release(&remaining);
        ensure_request_transition(request.status, next)?;
        self.set_request_status(request.id, next)?;
        self.set_selected_application(request.id, None)?;
        Ok(())
    }

    /// An `applied` request with no applied bids left goes back to `open`.
    fn reopen_if_unbid(&self, request: &MarketRequest) -> Result<()> {
        if request.status != RequestStatus::Applied {
            return Ok(());
        }
        let still_bid = self
            .list_applications_for_request(request.id)?
            .iter()
            .any(|a| a.application.status == ApplicationStatus::Applied);
        if !still_bid {
            self.set_request_status(request.id, RequestStatus::Open)?;
        }
        Ok(())
    }

    fn outcome(
        &self,
        before: MarketRequest,
        application_id: i64,
        payment_id: Option<i64>,
        rejected: Vec<Application>,
        notifications: Vec<Notification>,
    ) -> Result<BiddingOutcome> {
        let payment = match payment_id {
            Some(id) => Some(self.require_payment(id)?),
            None => None,
        };
        Ok(BiddingOutcome {
            request: self.require_request(before.id)?,
            previous_status: before.status,
            application: Some(self.require_application(application_id)?),
            payment,
            rejected,
            notifications,
        })
    }
}

/// Human-readable reference for a settled commission, e.g. `HB-20261019-1A2B3C4D`.
fn payment_reference() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "HB-{}-{}",
        chrono::Utc::now().format("%Y%m%d"),
        id[..8].to_uppercase()
    )
}

/// Format cents as a decimal amount, e.g. `1234` -> `12.34`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::db::tests::{material_request, service_request};

    struct Fixture {
        db: MarketDb,
        customer: User,
        bo: User,
        cy: User,
        request: MarketRequest,
    }

    fn fixture() -> Result<Fixture> {
        let db = MarketDb::new_in_memory()?;
        let customer = db.create_user("Ana", "ana@example.com", Role::Customer)?;
        let bo = db.create_user("Bo Builders", "bo@example.com", Role::Contractor)?;
        let cy = db.create_user("Cy Repairs", "cy@example.com", Role::Contractor)?;
        let request = db.create_request(customer.id, &service_request("Fix sink"))?;
        Ok(Fixture {
            db,
            customer,
            bo,
            cy,
            request,
        })
    }

    impl Fixture {
        fn bid(&self, provider: &User, amount_cents: i64) -> Result<Application> {
            let outcome = self
                .db
                .submit_application(self.request.id, provider.id, amount_cents, "")?;
            Ok(outcome.application.expect("submitted application"))
        }
    }

    fn market_err(err: &anyhow::Error) -> &MarketError {
        err.downcast_ref::<MarketError>()
            .unwrap_or_else(|| panic!("expected MarketError, got {:?}", err))
    }

    #[test]
    fn test_first_application_moves_request_to_applied() -> Result<()> {
        let f = fixture()?;
        let outcome = f.db.submit_application(f.request.id, f.bo.id, 75_000, "Can start Monday")?;
        assert_eq!(outcome.previous_status, RequestStatus::Open);
        assert_eq!(outcome.request.status, RequestStatus::Applied);
        assert!(outcome.request_status_changed());
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].user_id, f.customer.id);
        assert!(outcome.notifications[0].message.contains("750.00"));

        let second = f.db.submit_application(f.request.id, f.cy.id, 70_000, "")?;
        assert!(!second.request_status_changed());
        Ok(())
    }

    #[test]
    fn test_application_role_must_match_kind() -> Result<()> {
        let f = fixture()?;
        let distributor = f.db.create_user("Dee Supply", "dee@example.com", Role::Distributor)?;
        let err = f
            .db
            .submit_application(f.request.id, distributor.id, 10_000, "")
            .unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Forbidden(_)));

        let material = f.db.create_request(f.customer.id, &material_request("Cement"))?;
        let outcome = f.db.submit_application(material.id, distributor.id, 10_000, "")?;
        assert_eq!(outcome.request.status, RequestStatus::Applied);

        let err = f.db.submit_application(material.id, f.bo.id, 10_000, "").unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Forbidden(_)));
        Ok(())
    }

    #[test]
    fn test_duplicate_and_non_positive_bids_rejected() -> Result<()> {
        let f = fixture()?;
        let err = f.db.submit_application(f.request.id, f.bo.id, 0, "").unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Validation(_)));

        f.db.submit_application(f.request.id, f.bo.id, 50_000, "")?;
        let err = f.db.submit_application(f.request.id, f.bo.id, 45_000, "").unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::DuplicateApplication { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_full_lifecycle_to_approval() -> Result<()> {
        let f = fixture()?;
        let schedule = CommissionSchedule::default();
        let bo_app = f.bid(&f.bo, 300_000)?;
        let cy_app = f.bid(&f.cy, 320_000)?;

        let selected = f.db.select_application(bo_app.id, f.customer.id)?;
        assert_eq!(selected.request.status, RequestStatus::Selected);
        assert_eq!(selected.request.selected_application_id, Some(bo_app.id));
        assert_eq!(
            selected.application.as_ref().unwrap().status,
            ApplicationStatus::Selected
        );

        let confirmed = f.db.confirm_selection(bo_app.id, f.bo.id, &schedule)?;
        assert_eq!(confirmed.request.status, RequestStatus::PendingCommission);
        let payment = confirmed.payment.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.base_cents, 300_000);
        assert_eq!(payment.rate_bps, 800);
        assert_eq!(payment.amount_cents, 24_000);
        assert_eq!(confirmed.notifications.len(), 2);

        let paid = f.db.pay_commission(payment.id, f.bo.id)?;
        assert_eq!(paid.request.status, RequestStatus::Approved);
        assert_eq!(
            paid.application.as_ref().unwrap().status,
            ApplicationStatus::Approved
        );
        let settled = paid.payment.unwrap();
        assert_eq!(settled.status, PaymentStatus::Paid);
        assert!(settled.reference.as_deref().unwrap().starts_with("HB-"));
        assert!(settled.paid_at.is_some());

        assert_eq!(paid.rejected.len(), 1);
        assert_eq!(paid.rejected[0].id, cy_app.id);
        assert_eq!(paid.rejected[0].status, ApplicationStatus::Rejected);
        // provider approved, customer informed, competitor rejected
        assert_eq!(paid.notifications.len(), 3);

        let closed = f.db.close_request(f.request.id, f.customer.id)?;
        assert_eq!(closed.request.status, RequestStatus::Closed);
        assert!(closed.rejected.is_empty());
        assert_eq!(
            f.db.require_application(bo_app.id)?.status,
            ApplicationStatus::Approved
        );
        Ok(())
    }

    #[test]
    fn test_only_one_selection_at_a_time() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        let b = f.bid(&f.cy, 12_000)?;
        f.db.select_application(a.id, f.customer.id)?;
        let err = f.db.select_application(b.id, f.customer.id).unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::InvalidTransition { entity: "request", .. }
        ));
        Ok(())
    }

    #[test]
    fn test_only_owner_selects() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        let err = f.db.select_application(a.id, f.bo.id).unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Forbidden(_)));
        Ok(())
    }

    #[test]
    fn test_decline_falls_back_to_applied_when_other_bids_remain() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        f.db.submit_application(f.request.id, f.cy.id, 12_000, "")?;
        f.db.select_application(a.id, f.customer.id)?;

        let declined = f.db.decline_selection(a.id, f.bo.id)?;
        assert_eq!(declined.request.status, RequestStatus::Applied);
        assert!(declined.request.selected_application_id.is_none());
        assert_eq!(
            declined.application.unwrap().status,
            ApplicationStatus::Rejected
        );
        Ok(())
    }

    #[test]
    fn test_decline_after_confirm_cancels_payment_and_reopens() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        f.db.select_application(a.id, f.customer.id)?;
        let payment = f
            .db
            .confirm_selection(a.id, f.bo.id, &CommissionSchedule::default())?
            .payment
            .unwrap();

        let declined = f.db.decline_selection(a.id, f.bo.id)?;
        assert_eq!(declined.request.status, RequestStatus::Open);
        assert_eq!(
            f.db.require_payment(payment.id)?.status,
            PaymentStatus::Cancelled
        );

        let err = f.db.pay_commission(payment.id, f.bo.id).unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::InvalidTransition { entity: "payment", .. }
        ));
        Ok(())
    }

    #[test]
    fn test_decline_requires_selection() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        let err = f.db.decline_selection(a.id, f.bo.id).unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::InvalidTransition { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_reject_unselected_bid_reopens_when_last() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        let rejected = f.db.reject_application(a.id, f.customer.id)?;
        assert_eq!(rejected.request.status, RequestStatus::Open);
        assert_eq!(rejected.notifications[0].user_id, f.bo.id);
        assert_eq!(
            rejected.notifications[0].kind,
            NotificationKind::ApplicationRejected
        );
        Ok(())
    }

    #[test]
    fn test_admin_may_reject_but_strangers_may_not() -> Result<()> {
        let f = fixture()?;
        let admin = f.db.create_user("Root", "root@example.com", Role::Admin)?;
        let a = f.bid(&f.bo, 10_000)?;
        let b = f.bid(&f.cy, 10_000)?;

        let err = f.db.reject_application(a.id, f.cy.id).unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Forbidden(_)));

        let outcome = f.db.reject_application(a.id, admin.id)?;
        // b is still applied, so the request stays applied
        assert_eq!(outcome.request.status, RequestStatus::Applied);
        assert_eq!(f.db.require_application(b.id)?.status, ApplicationStatus::Applied);
        Ok(())
    }

    #[test]
    fn test_reject_pending_releases_selection() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        f.db.submit_application(f.request.id, f.cy.id, 11_000, "")?;
        f.db.select_application(a.id, f.customer.id)?;
        let payment = f
            .db
            .confirm_selection(a.id, f.bo.id, &CommissionSchedule::default())?
            .payment
            .unwrap();

        let outcome = f.db.reject_application(a.id, f.customer.id)?;
        assert_eq!(outcome.request.status, RequestStatus::Applied);
        assert!(outcome.request.selected_application_id.is_none());
        assert_eq!(
            f.db.require_payment(payment.id)?.status,
            PaymentStatus::Cancelled
        );
        Ok(())
    }

    #[test]
    fn test_withdraw_only_while_applied() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        let withdrawn = f.db.withdraw_application(a.id, f.bo.id)?;
        assert_eq!(withdrawn.request.status, RequestStatus::Open);
        assert_eq!(
            withdrawn.application.unwrap().status,
            ApplicationStatus::Withdrawn
        );

        let b = f.bid(&f.cy, 10_000)?;
        f.db.select_application(b.id, f.customer.id)?;
        let err = f.db.withdraw_application(b.id, f.cy.id).unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::InvalidTransition { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_only_payer_settles_commission() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        f.db.select_application(a.id, f.customer.id)?;
        let payment = f
            .db
            .confirm_selection(a.id, f.bo.id, &CommissionSchedule::default())?
            .payment
            .unwrap();
        let err = f.db.pay_commission(payment.id, f.customer.id).unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Forbidden(_)));
        Ok(())
    }

    #[test]
    fn test_confirm_requires_selection_and_provider() -> Result<()> {
        let f = fixture()?;
        let schedule = CommissionSchedule::default();
        let a = f.bid(&f.bo, 10_000)?;
        let err = f.db.confirm_selection(a.id, f.bo.id, &schedule).unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::InvalidTransition { .. }
        ));

        f.db.select_application(a.id, f.customer.id)?;
        let err = f.db.confirm_selection(a.id, f.cy.id, &schedule).unwrap_err();
        assert!(matches!(market_err(&err), MarketError::Forbidden(_)));
        Ok(())
    }

    #[test]
    fn test_close_rejects_live_bids_and_cancels_payments() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 10_000)?;
        f.db.submit_application(f.request.id, f.cy.id, 11_000, "")?;
        f.db.select_application(a.id, f.customer.id)?;
        let payment = f
            .db
            .confirm_selection(a.id, f.bo.id, &CommissionSchedule::default())?
            .payment
            .unwrap();

        let closed = f.db.close_request(f.request.id, f.customer.id)?;
        assert_eq!(closed.request.status, RequestStatus::Closed);
        assert_eq!(closed.rejected.len(), 2);
        assert_eq!(closed.notifications.len(), 2);
        assert_eq!(
            f.db.require_payment(payment.id)?.status,
            PaymentStatus::Cancelled
        );

        // Closed is terminal
        let err = f.db.close_request(f.request.id, f.customer.id).unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::InvalidTransition { .. }
        ));
        let err = f.db.submit_application(f.request.id, f.bo.id, 1, "").unwrap_err();
        assert!(matches!(
            market_err(&err),
            MarketError::DuplicateApplication { .. } | MarketError::InvalidTransition { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_stats_after_payment() -> Result<()> {
        let f = fixture()?;
        let a = f.bid(&f.bo, 50_000)?;
        f.db.select_application(a.id, f.customer.id)?;
        let payment = f
            .db
            .confirm_selection(a.id, f.bo.id, &CommissionSchedule::default())?
            .payment
            .unwrap();
        assert_eq!(f.db.get_stats()?.commission_pending_cents, 5_000);

        f.db.pay_commission(payment.id, f.bo.id)?;
        let stats = f.db.get_stats()?;
        assert_eq!(stats.users, 3);
        assert_eq!(stats.commission_collected_cents, 5_000);
        assert_eq!(stats.commission_pending_cents, 0);
        assert!(
            stats
                .requests_by_status
                .iter()
                .any(|c| c.status == "approved" && c.count == 1)
        );
        Ok(())
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(123_456), "1234.56");
        assert_eq!(format_cents(-250), "-2.50");
    }
}
