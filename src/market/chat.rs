//! Per-application chat threads between a customer and a provider.

use anyhow::{Context, Result};
use tracing::debug;

use crate::errors::MarketError;

use super::db::MarketDb;
use super::models::*;

const MAX_BODY_CHARS: usize = 4_000;

/// A stored message plus what the API needs to fan it out.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub message: ChatMessage,
    pub notification: Notification,
    /// Customer and provider of the thread.
    pub participants: [i64; 2],
}

impl MarketDb {
    pub fn create_chat_message(
        &self,
        application_id: i64,
        sender_id: i64,
        body: &str,
    ) -> Result<PostedMessage> {
        let sender = self.require_user(sender_id)?;
        let (application, request) = self.chat_thread(application_id)?;
        let participants = [request.customer_id, application.provider_id];
        if !participants.contains(&sender.id) {
            return Err(MarketError::forbidden(
                "only the customer and the provider can post in this thread",
            )
            .into());
        }

        let body = body.trim();
        if body.is_empty() {
            return Err(MarketError::validation("message body must not be empty").into());
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(MarketError::validation(format!(
                "message body exceeds {} characters",
                MAX_BODY_CHARS
            ))
            .into());
        }

        let recipient = if sender.id == request.customer_id {
            application.provider_id
        } else {
            request.customer_id
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let message = self.insert_chat_message(application_id, sender.id, body)?;
        let notification = self.create_notification(
            recipient,
            NotificationKind::NewMessage,
            &format!("New message from {} about \"{}\"", sender.name, request.title),
            Some(request.id),
            Some(application_id),
        )?;
        tx.commit().context("Failed to commit chat message")?;

        debug!(application_id, sender_id, message_id = message.id, "chat message stored");
        Ok(PostedMessage {
            message,
            notification,
            participants,
        })
    }

    /// Thread history, oldest first. Participants and admins only.
    pub fn list_chat_messages(
        &self,
        application_id: i64,
        viewer: &User,
    ) -> Result<Vec<ChatMessage>> {
        let (application, request) = self.chat_thread(application_id)?;
        let allowed = viewer.role == Role::Admin
            || viewer.id == request.customer_id
            || viewer.id == application.provider_id;
        if !allowed {
            return Err(MarketError::forbidden("not a participant in this thread").into());
        }
        self.chat_messages(application_id)
    }

    fn chat_thread(&self, application_id: i64) -> Result<(Application, MarketRequest)> {
        let application = self.require_application(application_id)?;
        let request = self.require_request(application.request_id)?;
        Ok((application, request))
    }
}
