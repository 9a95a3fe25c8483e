//! Event handlers: one per client event type, selected by [`dispatch`].
//!
//! Handlers never touch hub state directly. They ask the hub to change it,
//! reply to the sender through its [`Outbox`], and hand fan-out messages to
//! the hub for delivery.

use chrono::Utc;
use serde_json::json;

use super::events::{
    CursorBroadcastPayload, CursorUpdatePayload, EventType, FormEditPayload, JoinFormPayload,
    JoinFormResponsePayload, LeaveFormPayload, LeaveFormResponsePayload, Message, User,
    UserJoinedPayload,
};
use super::hub::HubHandle;
use super::session::Outbox;
use crate::bus::{BusEvent, BusEventType, EventBus};
use crate::error::CollabError;

/// Everything a handler may use while processing one message.
pub struct HandlerContext<'a> {
    pub hub: &'a HubHandle,
    pub bus: &'a dyn EventBus,
    pub outbox: &'a Outbox,
    pub client_id: &'a str,
    pub user: &'a User,
    pub service_name: &'a str,
}

impl HandlerContext<'_> {
    fn publish(&self, event_type: &str, form_id: &str, data: serde_json::Value) {
        self.bus.publish(BusEvent::new(
            event_type,
            form_id,
            self.user.id.clone(),
            data,
            self.service_name,
        ));
    }

    /// The form the sender is currently editing, checked against `form_id`.
    fn require_room(&self, form_id: &str) -> Result<(), CollabError> {
        match self.hub.client_room(self.client_id) {
            Some(current) if current == form_id => Ok(()),
            _ => Err(CollabError::NotInRoom(form_id.to_string())),
        }
    }
}

/// Route a decoded client message to its handler.
pub async fn dispatch(ctx: &HandlerContext<'_>, message: &Message) -> Result<(), CollabError> {
    match message.event_type {
        EventType::JoinForm => join_form(ctx, message).await,
        EventType::LeaveForm => leave_form(ctx, message).await,
        EventType::CursorUpdate => cursor_update(ctx, message).await,
        EventType::QuestionCreate => {
            relay_edit(ctx, message, BusEventType::QUESTION_CREATED).await
        }
        EventType::QuestionUpdate => {
            relay_edit(ctx, message, BusEventType::QUESTION_UPDATED).await
        }
        EventType::QuestionDelete => {
            relay_edit(ctx, message, BusEventType::QUESTION_DELETED).await
        }
        EventType::FormUpdate => relay_edit(ctx, message, BusEventType::FORM_UPDATED).await,
        EventType::FormDelete => form_delete(ctx, message).await,
        other => Err(CollabError::UnknownEvent(other.to_string())),
    }
}

fn require(value: &str, field: &str) -> Result<(), CollabError> {
    if value.trim().is_empty() {
        return Err(CollabError::InvalidPayload(format!("{field} is required")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

async fn join_form(ctx: &HandlerContext<'_>, message: &Message) -> Result<(), CollabError> {
    let JoinFormPayload { form_id } = message.payload_as()?;
    require(&form_id, "formId")?;

    let outcome = ctx.hub.join(ctx.client_id, &form_id).await?;

    ctx.outbox.send(
        Message::new(
            EventType::JoinFormResponse,
            JoinFormResponsePayload {
                form_id: form_id.clone(),
                user_id: ctx.user.id.clone(),
                success: true,
                room_users: outcome.room.users(),
                cursors: outcome.room.cursors(),
                timestamp: Utc::now(),
            },
        )
        .in_room(&form_id),
    );

    if outcome.newly_present {
        let user = outcome
            .room
            .user(&ctx.user.id)
            .cloned()
            .unwrap_or_else(|| ctx.user.clone());
        let joined = Message::new(
            EventType::UserJoined,
            UserJoinedPayload {
                form_id: form_id.clone(),
                user: user.clone(),
            },
        )
        .in_room(&form_id);
        ctx.hub.broadcast_except(joined, ctx.client_id).await?;
        ctx.publish(
            BusEventType::USER_JOINED,
            &form_id,
            json!({ "formId": form_id, "user": user }),
        );
    }
    Ok(())
}

async fn leave_form(ctx: &HandlerContext<'_>, message: &Message) -> Result<(), CollabError> {
    let payload: LeaveFormPayload = if message.payload.is_null() {
        LeaveFormPayload::default()
    } else {
        message.payload_as()?
    };
    let requested = payload
        .form_id
        .or_else(|| message.form_id.clone())
        .filter(|f| !f.trim().is_empty());

    let departure = ctx.hub.leave(ctx.client_id, requested.as_deref()).await?;

    ctx.outbox.send(Message::new(
        EventType::LeaveFormResponse,
        LeaveFormResponsePayload {
            form_id: departure.form_id.clone(),
            user_id: ctx.user.id.clone(),
            success: true,
            timestamp: Utc::now(),
        },
    ));

    if departure.presence_ended {
        ctx.hub
            .broadcast(Message::user_left(&departure.form_id, &ctx.user.id))
            .await?;
        ctx.publish(
            BusEventType::USER_LEFT,
            &departure.form_id,
            json!({ "formId": departure.form_id, "userId": ctx.user.id }),
        );
    }
    Ok(())
}

async fn cursor_update(ctx: &HandlerContext<'_>, message: &Message) -> Result<(), CollabError> {
    let CursorUpdatePayload {
        form_id,
        position,
        color,
    } = message.payload_as()?;
    require(&form_id, "formId")?;

    let (cursor, user) = ctx
        .hub
        .update_cursor(ctx.client_id, &form_id, position, color)
        .await?;

    let relay = Message::new(
        EventType::CursorUpdate,
        CursorBroadcastPayload {
            form_id: form_id.clone(),
            user_id: cursor.user_id,
            position: cursor.position,
            color: cursor.color,
            user,
        },
    )
    .for_user(&ctx.user.id)
    .in_room(&form_id);
    ctx.hub.broadcast_except(relay, ctx.client_id).await
}

// ---------------------------------------------------------------------------
// Structural edits
// ---------------------------------------------------------------------------

/// Validate an edit and build the copy relayed to the room.
fn authorize_edit(
    ctx: &HandlerContext<'_>,
    message: &Message,
) -> Result<(String, Message), CollabError> {
    let edit: FormEditPayload = message.payload_as()?;
    require(&edit.form_id, "formId")?;
    match message.event_type {
        EventType::QuestionUpdate | EventType::QuestionDelete => {
            require(edit.question_id.as_deref().unwrap_or_default(), "questionId")?;
        }
        EventType::QuestionCreate if edit.question.is_none() => {
            return Err(CollabError::InvalidPayload("question is required".into()));
        }
        _ => {}
    }

    ctx.require_room(&edit.form_id)?;
    if !ctx.user.can_edit() {
        return Err(CollabError::Forbidden(format!(
            "{} requires edit permission on form {}",
            message.event_type, edit.form_id
        )));
    }

    let relay = Message::new(message.event_type, message.payload.clone())
        .for_user(&ctx.user.id)
        .in_room(&edit.form_id);
    Ok((edit.form_id, relay))
}

async fn relay_edit(
    ctx: &HandlerContext<'_>,
    message: &Message,
    bus_type: &str,
) -> Result<(), CollabError> {
    let (form_id, relay) = authorize_edit(ctx, message)?;
    ctx.hub.broadcast_except(relay, ctx.client_id).await?;
    ctx.publish(bus_type, &form_id, message.payload.clone());
    Ok(())
}

/// Relay the deletion to everyone in the room, then close it.
async fn form_delete(ctx: &HandlerContext<'_>, message: &Message) -> Result<(), CollabError> {
    let (form_id, relay) = authorize_edit(ctx, message)?;
    ctx.hub.close_room(&form_id, relay).await?;
    ctx.publish(BusEventType::FORM_DELETED, &form_id, message.payload.clone());
    Ok(())
}
