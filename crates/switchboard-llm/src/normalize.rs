//! Provider-specific reshaping of a message history into a legal request.
//!
//! Normalization is pure and runs before any network activity, so a
//! rejected history never costs a request.

use switchboard_types::{GatewayError, Result};

use crate::{Message, Role};

/// A history ready to be sent. `system` is only populated for providers that
/// carry the system prompt outside the message list.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

/// Role-ordering rules of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageShape {
    /// Any non-empty sequence is accepted unchanged.
    Passthrough,
    /// Must open with `user`/`system` (leading turns are trimmed) and end with `user`.
    LeadingUser,
    /// System prompt lifted out; strict `user, assistant, ..., user` alternation.
    StrictAlternation,
}

impl MessageShape {
    pub fn normalize(self, messages: &[Message]) -> Result<Normalized> {
        if messages.is_empty() {
            return Err(GatewayError::validation("message is required"));
        }
        match self {
            MessageShape::Passthrough => Ok(Normalized {
                system: None,
                messages: messages.to_vec(),
            }),
            MessageShape::LeadingUser => leading_user(messages),
            MessageShape::StrictAlternation => strict_alternation(messages),
        }
    }
}

fn ends_with_user(messages: &[Message]) -> bool {
    messages.last().is_some_and(Message::is_user)
}

fn leading_user(messages: &[Message]) -> Result<Normalized> {
    if !ends_with_user(messages) {
        return Err(GatewayError::validation("last message role not user"));
    }
    // Terminates at the trailing user message at the latest.
    let start = messages
        .iter()
        .position(|m| matches!(m.role, Role::User | Role::System))
        .unwrap_or(messages.len() - 1);
    if start > 0 {
        tracing::debug!(dropped = start, "trimmed leading non-user messages");
    }
    Ok(Normalized {
        system: None,
        messages: messages[start..].to_vec(),
    })
}

fn strict_alternation(messages: &[Message]) -> Result<Normalized> {
    // 1. Lift system messages out; the last one wins.
    let mut system = None;
    let mut turns: Vec<&Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == Role::System {
            system = Some(msg);
        } else {
            turns.push(msg);
        }
    }

    // 2. The conversation must end on a user turn.
    if !turns.last().is_some_and(|m| m.is_user()) {
        return Err(GatewayError::validation("last message role not user"));
    }

    // 3. Walk backwards keeping one message per side, alternating.
    let mut rebuilt: Vec<Message> = Vec::with_capacity(turns.len());
    let mut expect_user = true;
    for msg in turns.iter().rev() {
        if msg.is_user() == expect_user {
            rebuilt.push((*msg).clone());
            expect_user = !expect_user;
        }
    }
    rebuilt.reverse();

    // 4. Must open with a user turn.
    if rebuilt.first().is_some_and(|m| !m.is_user()) {
        rebuilt.remove(0);
    }

    // 5. Odd length, user last.
    if rebuilt.is_empty() || rebuilt.len() % 2 != 1 {
        return Err(GatewayError::validation("messages length not odd"));
    }
    if !ends_with_user(&rebuilt) {
        return Err(GatewayError::validation("last message role not user"));
    }

    Ok(Normalized {
        system: system
            .and_then(|m| m.content.clone())
            .filter(|s| !s.is_empty()),
        messages: rebuilt,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content_str()).collect()
    }

    #[test]
    fn empty_history_is_rejected_by_every_shape() {
        for shape in [
            MessageShape::Passthrough,
            MessageShape::LeadingUser,
            MessageShape::StrictAlternation,
        ] {
            let err = shape.normalize(&[]).unwrap_err();
            assert!(matches!(err, GatewayError::ValidationError(_)));
        }
    }

    #[test]
    fn passthrough_keeps_everything() {
        let history = vec![Message::assistant("a"), Message::assistant("b")];
        let out = MessageShape::Passthrough.normalize(&history).unwrap();
        assert_eq!(out.messages, history);
        assert!(out.system.is_none());
    }

    #[test]
    fn leading_user_drops_leading_assistant() {
        let history = vec![
            Message::assistant("a1"),
            Message::user("u1"),
            Message::assistant("a2"),
            Message::user("u2"),
        ];
        let out = MessageShape::LeadingUser.normalize(&history).unwrap();
        assert_eq!(roles(&out.messages), vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(contents(&out.messages), vec!["u1", "a2", "u2"]);
    }

    #[test]
    fn leading_user_keeps_leading_system() {
        let history = vec![
            Message::function("f", "{}"),
            Message::system("be brief"),
            Message::user("hi"),
        ];
        let out = MessageShape::LeadingUser.normalize(&history).unwrap();
        assert_eq!(roles(&out.messages), vec![Role::System, Role::User]);
    }

    #[test]
    fn leading_user_rejects_trailing_assistant() {
        let history = vec![Message::user("u"), Message::assistant("a")];
        let err = MessageShape::LeadingUser.normalize(&history).unwrap_err();
        assert!(err.to_string().contains("last message role not user"));
    }

    #[test]
    fn alternation_collapses_consecutive_users() {
        let history = vec![
            Message::user("u1"),
            Message::user("u2"),
            Message::assistant("a1"),
            Message::user("u3"),
        ];
        let out = MessageShape::StrictAlternation.normalize(&history).unwrap();
        assert_eq!(roles(&out.messages), vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(contents(&out.messages), vec!["u2", "a1", "u3"]);
        assert_eq!(out.messages.len() % 2, 1);
    }

    #[test]
    fn alternation_drops_leading_assistant() {
        let history = vec![Message::assistant("a"), Message::user("u")];
        let out = MessageShape::StrictAlternation.normalize(&history).unwrap();
        assert_eq!(contents(&out.messages), vec!["u"]);
    }

    #[test]
    fn alternation_lifts_last_system_prompt() {
        let history = vec![
            Message::system("first"),
            Message::user("u1"),
            Message::system("second"),
            Message::assistant("a1"),
            Message::user("u2"),
        ];
        let out = MessageShape::StrictAlternation.normalize(&history).unwrap();
        assert_eq!(out.system.as_deref(), Some("second"));
        assert!(out.messages.iter().all(|m| m.role != Role::System));
        assert_eq!(contents(&out.messages), vec!["u1", "a1", "u2"]);
    }

    #[test]
    fn alternation_treats_function_as_assistant_side() {
        let history = vec![
            Message::user("u1"),
            Message::assistant("a1"),
            Message::function("f", "r"),
            Message::user("u2"),
        ];
        let out = MessageShape::StrictAlternation.normalize(&history).unwrap();
        assert_eq!(roles(&out.messages), vec![Role::User, Role::Function, Role::User]);
    }

    #[test]
    fn alternation_rejects_system_only_and_trailing_assistant() {
        let err = MessageShape::StrictAlternation
            .normalize(&[Message::system("s")])
            .unwrap_err();
        assert!(matches!(err, GatewayError::ValidationError(_)));

        let err = MessageShape::StrictAlternation
            .normalize(&[Message::user("u"), Message::assistant("a")])
            .unwrap_err();
        assert!(err.to_string().contains("last message role not user"));
    }

    #[test]
    fn empty_system_prompt_is_not_carried() {
        let history = vec![Message::system(""), Message::user("u")];
        let out = MessageShape::StrictAlternation.normalize(&history).unwrap();
        assert!(out.system.is_none());
    }

    #[test]
    fn normalization_is_idempotent() {
        let history = vec![
            Message::assistant("a0"),
            Message::user("u1"),
            Message::user("u2"),
            Message::assistant("a1"),
            Message::assistant("a2"),
            Message::user("u3"),
        ];
        for shape in [
            MessageShape::Passthrough,
            MessageShape::LeadingUser,
            MessageShape::StrictAlternation,
        ] {
            let once = shape.normalize(&history).unwrap();
            let twice = shape.normalize(&once.messages).unwrap();
            assert_eq!(once.messages, twice.messages, "{shape:?} not idempotent");
        }
    }
}
