use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Contractor,
    Distributor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Contractor => "contractor",
            Self::Distributor => "distributor",
            Self::Admin => "admin",
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Contractor | Self::Distributor)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "contractor" => Ok(Self::Contractor),
            "distributor" => Ok(Self::Distributor),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: String,
}

/// What the customer is asking for. Service requests are bid on by
/// contractors, material requests by distributors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Service,
    Material,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Material => "material",
        }
    }

    /// The only role allowed to apply to a request of this kind.
    pub fn provider_role(&self) -> Role {
        match self {
            Self::Service => Role::Contractor,
            Self::Material => Role::Distributor,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(Self::Service),
            "material" => Ok(Self::Material),
            _ => Err(format!("Invalid request kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Applied,
    Selected,
    PendingCommission,
    Approved,
    Closed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Applied => "applied",
            Self::Selected => "selected",
            Self::PendingCommission => "pending_commission",
            Self::Approved => "approved",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "applied" => Ok(Self::Applied),
            "selected" => Ok(Self::Selected),
            "pending_commission" => Ok(Self::PendingCommission),
            "approved" => Ok(Self::Approved),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Applied,
    Selected,
    PendingCommission,
    Approved,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Selected => "selected",
            Self::PendingCommission => "pending_commission",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(Self::Applied),
            "selected" => Ok(Self::Selected),
            "pending_commission" => Ok(Self::PendingCommission),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "withdrawn" => Ok(Self::Withdrawn),
            _ => Err(format!("Invalid application status: {}", s)),
        }
    }
}

/// A customer's service or material request.
///
/// `material`, `quantity` and `unit` are only populated for
/// [`RequestKind::Material`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRequest {
    pub id: i64,
    pub customer_id: i64,
    pub kind: RequestKind,
    pub title: String,
    pub description: String,
    pub category: String,
    pub address: String,
    pub budget_cents: Option<i64>,
    pub material: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub status: RequestStatus,
    pub selected_application_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for a new request, validated by `MarketDb::create_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub kind: RequestKind,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub address: String,
    pub budget_cents: Option<i64>,
    pub material: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
}

/// A provider's bid on a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub request_id: i64,
    pub provider_id: i64,
    pub amount_cents: i64,
    pub message: String,
    pub status: ApplicationStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}

/// Commission owed by a provider once they confirm a selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub application_id: i64,
    pub payer_id: i64,
    pub base_cents: i64,
    pub rate_bps: u32,
    pub tier: usize,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub created_at: String,
    pub paid_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub application_id: i64,
    pub sender_id: i64,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApplicationReceived,
    ApplicationSelected,
    SelectionConfirmed,
    SelectionDeclined,
    CommissionDue,
    CommissionPaid,
    ApplicationApproved,
    ApplicationRejected,
    ApplicationWithdrawn,
    RequestClosed,
    NewMessage,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationReceived => "application_received",
            Self::ApplicationSelected => "application_selected",
            Self::SelectionConfirmed => "selection_confirmed",
            Self::SelectionDeclined => "selection_declined",
            Self::CommissionDue => "commission_due",
            Self::CommissionPaid => "commission_paid",
            Self::ApplicationApproved => "application_approved",
            Self::ApplicationRejected => "application_rejected",
            Self::ApplicationWithdrawn => "application_withdrawn",
            Self::RequestClosed => "request_closed",
            Self::NewMessage => "new_message",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application_received" => Ok(Self::ApplicationReceived),
            "application_selected" => Ok(Self::ApplicationSelected),
            "selection_confirmed" => Ok(Self::SelectionConfirmed),
            "selection_declined" => Ok(Self::SelectionDeclined),
            "commission_due" => Ok(Self::CommissionDue),
            "commission_paid" => Ok(Self::CommissionPaid),
            "application_approved" => Ok(Self::ApplicationApproved),
            "application_rejected" => Ok(Self::ApplicationRejected),
            "application_withdrawn" => Ok(Self::ApplicationWithdrawn),
            "request_closed" => Ok(Self::RequestClosed),
            "new_message" => Ok(Self::NewMessage),
            _ => Err(format!("Invalid notification kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub kind: NotificationKind,
    pub message: String,
    pub request_id: Option<i64>,
    pub application_id: Option<i64>,
    pub read: bool,
    pub created_at: String,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationWithProvider {
    #[serde(flatten)]
    pub application: Application,
    pub provider_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDetail {
    pub request: MarketRequest,
    pub applications: Vec<ApplicationWithProvider>,
    pub application_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// Admin dashboard figures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketStats {
    pub users: i64,
    pub requests_by_status: Vec<StatusCount>,
    pub applications_by_status: Vec<StatusCount>,
    pub commission_collected_cents: i64,
    pub commission_pending_cents: i64,
}
