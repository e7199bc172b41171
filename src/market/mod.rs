//! Marketplace back-end: requests, bids, commissions, chat.
//!
//! ## Overview
//!
//! Customers post service or material requests. Contractors bid on service
//! requests and distributors on material requests. The customer selects one
//! bid, the provider confirms it, pays the platform commission, and the job
//! is approved. Every change is persisted to SQLite and pushed to connected
//! WebSocket clients.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (handlers, AppState, Actor)        │
//! └──────────┘ WebSocket│         │                                        │
//!      ^                │         │ DbHandle::call()                       │
//!      │                │         v                                        │
//!      │                │  bidding.rs / chat.rs  (transactional ops)       │
//!      │                │         │            │                           │
//!      │                │         │ workflow   │ commission::quote()       │
//!      │                │         v            v                           │
//!      │                │  db.rs  (MarketDb, SQLite)                       │
//!      │                │         │                                        │
//!      │                │         │ BiddingOutcome                         │
//!      │                │         v                                        │
//!      └─────────────── │  ws.rs  (WsMessage, Audience, broadcast)         │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                           |
//! |--------------|----------------------------------------------------------|
//! | `models`     | Shared types: `MarketRequest`, `Application`, `Payment`  |
//! | `workflow`   | Allowed status edges for requests and applications       |
//! | `commission` | `CommissionSchedule` tiers and fee quotes                |
//!
//! ## Typical Request Flow (provider confirms a selection)
//!
//! 1. `POST /api/applications/{id}/confirm` → `api::confirm_selection()`
//! 2. The `Actor` extractor resolves the caller from `x-user-id`.
//! 3. `MarketDb::confirm_selection()` checks the caller is the selected
//!    provider, validates both status edges, quotes the commission, and in
//!    one transaction moves the bid and request to `pending_commission`,
//!    opens a pending payment and stores two notifications.
//! 4. `ws::broadcast_outcome()` pushes the public status change to every
//!    socket and the payment and notifications to the two parties only.

pub mod api;
pub mod bidding;
pub mod chat;
pub mod commission;
pub mod db;
pub mod models;
pub mod server;
pub mod workflow;
pub mod ws;
