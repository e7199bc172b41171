//! Status transition rules for requests and applications.
//!
//! Everything here is pure: the persistence layer asks these functions
//! before writing a new status, so the same edges hold for every caller.
//!
//! ```text
//! request:      open ⇄ applied ⇄ selected → pending_commission → approved → closed
//!                 (any non-closed state may be closed by the owner)
//! application:  applied → selected → pending_commission → approved
//!                  │          │               │
//!                  ├→ withdrawn └──────────────┴→ rejected
//!                  └→ rejected
//! ```

use crate::errors::MarketError;

use super::models::{ApplicationStatus, RequestStatus};

impl RequestStatus {
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Open, Applied | Closed)
                | (Applied, Open | Selected | Closed)
                | (Selected, PendingCommission | Applied | Open | Closed)
                | (PendingCommission, Approved | Applied | Open | Closed)
                | (Approved, Closed)
        )
    }

    pub fn accepts_applications(&self) -> bool {
        matches!(self, Self::Open | Self::Applied)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl ApplicationStatus {
    pub fn can_transition_to(&self, next: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        matches!(
            (self, next),
            (Applied, Selected | Rejected | Withdrawn)
                | (Selected, PendingCommission | Rejected)
                | (PendingCommission, Approved | Rejected)
        )
    }

    /// Still in the running for the request.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Applied | Self::Selected | Self::PendingCommission)
    }

    /// Holds the request's single selection slot.
    pub fn holds_selection(&self) -> bool {
        matches!(self, Self::Selected | Self::PendingCommission)
    }
}

pub fn ensure_request_transition(
    from: RequestStatus,
    to: RequestStatus,
) -> Result<(), MarketError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(MarketError::InvalidTransition {
            entity: "request",
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

pub fn ensure_application_transition(
    from: ApplicationStatus,
    to: ApplicationStatus,
) -> Result<(), MarketError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(MarketError::InvalidTransition {
            entity: "application",
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// Where a request lands once its selected or pending application is
/// released. `remaining` holds the statuses of the request's other
/// applications.
pub fn request_status_after_release(remaining: &[ApplicationStatus]) -> RequestStatus {
    if remaining.iter().any(|s| *s == ApplicationStatus::Applied) {
        RequestStatus::Applied
    } else {
        RequestStatus::Open
    }
}
