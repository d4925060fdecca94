//! Chat ⇄ responses transcript projection.
//!
//! The two representations are isomorphic on the saved-state subset:
//! projecting `items → messages` over a state produced by
//! `messages_to_items` yields the original transcript.

use gambit_domain::{Message, Role, ToolCall};
use gambit_providers::{parse_arguments, ResponseContentPart, ResponseItem};

fn role_from_str(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Project a responses-item transcript to normalized chat messages.
///
/// `function_call` items attach to the assistant message that precedes
/// them (the shape `messages_to_items` emits); a call with no preceding
/// assistant message opens a fresh one.
pub fn items_to_messages(items: &[ResponseItem]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    // Whether the trailing assistant message may still accept calls.
    let mut attachable = false;

    for item in items {
        match item {
            ResponseItem::Message { role, content } => {
                let text: String = content.iter().map(ResponseContentPart::text).collect();
                let role = role_from_str(role);
                messages.push(Message {
                    role,
                    content: text,
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    name: None,
                });
                attachable = role == Role::Assistant;
            }
            ResponseItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let call = ToolCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: parse_arguments(arguments),
                };
                match messages.last_mut() {
                    Some(last) if attachable && last.role == Role::Assistant => {
                        last.tool_calls.push(call);
                    }
                    _ => {
                        messages.push(Message::assistant_tool_calls("", vec![call]));
                        attachable = true;
                    }
                }
            }
            ResponseItem::FunctionCallOutput { call_id, output } => {
                messages.push(Message {
                    role: Role::Tool,
                    content: output.clone(),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(call_id.clone()),
                    name: None,
                });
                attachable = false;
            }
        }
    }

    messages
}

/// Project normalized chat messages to a responses-item transcript.
pub fn messages_to_items(messages: &[Message]) -> Vec<ResponseItem> {
    let mut items: Vec<ResponseItem> = Vec::new();

    for message in messages {
        match message.role {
            Role::System | Role::User => {
                items.push(ResponseItem::Message {
                    role: role_to_str(message.role).into(),
                    content: vec![ResponseContentPart::InputText {
                        text: message.content.clone(),
                    }],
                });
            }
            Role::Assistant => {
                if !message.content.is_empty() || message.tool_calls.is_empty() {
                    items.push(ResponseItem::Message {
                        role: "assistant".into(),
                        content: vec![ResponseContentPart::OutputText {
                            text: message.content.clone(),
                        }],
                    });
                }
                for call in &message.tool_calls {
                    items.push(ResponseItem::FunctionCall {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    });
                }
            }
            Role::Tool => {
                items.push(ResponseItem::FunctionCallOutput {
                    call_id: message.tool_call_id.clone().unwrap_or_default(),
                    output: message.content.clone(),
                });
            }
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_transcript() {
        let original = vec![
            Message::system("be helpful"),
            Message::user("count to two"),
            Message::assistant_tool_calls(
                "counting",
                vec![ToolCall {
                    call_id: "call-1".into(),
                    name: "count".into(),
                    arguments: json!({"to": 2}),
                }],
            ),
            // responses items do not carry the tool name, so the chat side
            // of the round trip leaves it unset too
            Message {
                role: Role::Tool,
                content: "{\"status\":200}".into(),
                tool_calls: Vec::new(),
                tool_call_id: Some("call-1".into()),
                name: None,
            },
            Message::assistant("one, two"),
        ];

        let items = messages_to_items(&original);
        let projected = items_to_messages(&items);
        assert_eq!(projected, original);
    }

    #[test]
    fn bare_function_call_opens_assistant_message() {
        let items = vec![ResponseItem::FunctionCall {
            call_id: "call-9".into(),
            name: "go".into(),
            arguments: "{}".into(),
        }];
        let messages = items_to_messages(&items);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].tool_calls[0].name, "go");
    }

    #[test]
    fn calls_do_not_attach_across_tool_output() {
        let items = vec![
            ResponseItem::Message {
                role: "assistant".into(),
                content: vec![ResponseContentPart::OutputText { text: "a".into() }],
            },
            ResponseItem::FunctionCallOutput {
                call_id: "call-1".into(),
                output: "done".into(),
            },
            ResponseItem::FunctionCall {
                call_id: "call-2".into(),
                name: "next".into(),
                arguments: "{}".into(),
            },
        ];
        let messages = items_to_messages(&items);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].tool_calls.is_empty());
        assert_eq!(messages[2].tool_calls.len(), 1);
    }

    #[test]
    fn assistant_without_content_emits_only_calls() {
        let messages = vec![Message::assistant_tool_calls(
            "",
            vec![ToolCall {
                call_id: "call-1".into(),
                name: "go".into(),
                arguments: json!({}),
            }],
        )];
        let items = messages_to_items(&messages);
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], ResponseItem::FunctionCall { .. }));
    }
}
