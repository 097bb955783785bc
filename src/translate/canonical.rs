//! Protocol-neutral conversation model.
//!
//! Client translators parse into [`CanonicalMessage`]s, apply the structural
//! rules the backend enforces, then lower the result to backend [`Content`].

use super::gemini_types::{Content, FunctionCall, FunctionResponse, Part};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Backend role name. System turns travel as user turns.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Role::Assistant => "model",
            Role::User | Role::System => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text(String),
    Thought {
        text: String,
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
        signature: Option<String>,
    },
    /// `response` is the object handed to the backend as the function's result.
    ToolResult {
        id: String,
        name: String,
        response: Value,
    },
}

impl Block {
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Block::ToolCall { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Block::ToolResult { .. })
    }

    fn into_part(self) -> Part {
        match self {
            Block::Text(text) => Part::text(text),
            Block::Thought { text, signature } => Part {
                text: Some(text),
                thought: Some(true),
                thought_signature: signature,
                ..Default::default()
            },
            Block::ToolCall {
                id,
                name,
                args,
                signature,
            } => Part {
                thought_signature: signature,
                function_call: Some(FunctionCall {
                    name,
                    args,
                    id: Some(id).filter(|id| !id.is_empty()),
                }),
                ..Default::default()
            },
            Block::ToolResult { id, name, response } => Part {
                function_response: Some(FunctionResponse {
                    id: Some(id).filter(|id| !id.is_empty()),
                    name,
                    response,
                }),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl CanonicalMessage {
    pub fn new(role: Role, blocks: Vec<Block>) -> Self {
        Self { role, blocks }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Block::Text(text.into())])
    }
}

/// Enforce the backend's turn structure:
/// assistant turns put every text/thought block ahead of every tool call, and
/// user turns never mix tool results with other content.
///
/// Blocks keep their relative order within each group and nothing is dropped.
pub fn normalize(messages: Vec<CanonicalMessage>) -> Vec<CanonicalMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::Assistant => out.push(order_assistant_blocks(message)),
            Role::User => out.extend(split_tool_results(message)),
            Role::System => out.push(message),
        }
    }
    out
}

fn order_assistant_blocks(message: CanonicalMessage) -> CanonicalMessage {
    let (calls, rest): (Vec<Block>, Vec<Block>) =
        message.blocks.into_iter().partition(Block::is_tool_call);
    let mut blocks = rest;
    blocks.extend(calls);
    CanonicalMessage::new(message.role, blocks)
}

fn split_tool_results(message: CanonicalMessage) -> Vec<CanonicalMessage> {
    let (results, rest): (Vec<Block>, Vec<Block>) =
        message.blocks.into_iter().partition(Block::is_tool_result);
    if results.is_empty() || rest.is_empty() {
        let blocks = if results.is_empty() { rest } else { results };
        return vec![CanonicalMessage::new(message.role, blocks)];
    }
    vec![
        CanonicalMessage::new(message.role, results),
        CanonicalMessage::new(message.role, rest),
    ]
}

/// Lower canonical messages to backend contents.
/// Empty text blocks are dropped, then messages left without blocks are skipped.
pub fn to_contents(messages: Vec<CanonicalMessage>) -> Vec<Content> {
    messages
        .into_iter()
        .map(|mut m| {
            m.blocks.retain(|b| !matches!(b, Block::Text(t) if t.is_empty()));
            m
        })
        .filter(|m| !m.blocks.is_empty())
        .map(|m| Content {
            role: m.role.backend_name().to_string(),
            parts: m.blocks.into_iter().map(Block::into_part).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str) -> Block {
        Block::ToolCall {
            id: format!("{}-0000abcd", name),
            name: name.to_string(),
            args: json!({}),
            signature: None,
        }
    }

    fn result(name: &str) -> Block {
        Block::ToolResult {
            id: format!("{}-0000abcd", name),
            name: name.to_string(),
            response: json!({"result": "ok"}),
        }
    }

    fn text(t: &str) -> Block {
        Block::Text(t.to_string())
    }

    #[test]
    fn test_assistant_text_moves_ahead_of_tool_calls() {
        let msg = CanonicalMessage::new(Role::Assistant, vec![text("a"), call("f"), text("b")]);
        let out = normalize(vec![msg]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].blocks, vec![text("a"), text("b"), call("f")]);
    }

    #[test]
    fn test_assistant_order_is_stable() {
        let thought = Block::Thought {
            text: "hmm".to_string(),
            signature: None,
        };
        let msg = CanonicalMessage::new(
            Role::Assistant,
            vec![call("f"), thought.clone(), call("g"), text("done")],
        );
        let out = normalize(vec![msg]);
        assert_eq!(out[0].blocks, vec![thought, text("done"), call("f"), call("g")]);
    }

    #[test]
    fn test_mixed_user_turn_splits_results_first() {
        for blocks in [
            vec![text("x"), result("f"), text("y"), result("g")],
            vec![result("f"), text("x"), result("g"), text("y")],
            vec![text("x"), text("y"), result("f"), result("g")],
        ] {
            let out = normalize(vec![CanonicalMessage::new(Role::User, blocks)]);
            assert_eq!(out.len(), 2);
            assert_eq!(out[0].blocks, vec![result("f"), result("g")]);
            assert_eq!(out[1].blocks, vec![text("x"), text("y")]);
            assert!(out.iter().all(|m| m.role == Role::User));
        }
    }

    #[test]
    fn test_homogeneous_user_turns_untouched() {
        let only_results = CanonicalMessage::new(Role::User, vec![result("f"), result("g")]);
        let only_text = CanonicalMessage::text(Role::User, "hello");
        let out = normalize(vec![only_results.clone(), only_text.clone()]);
        assert_eq!(out, vec![only_results, only_text]);
    }

    #[test]
    fn test_to_contents_maps_roles_and_parts() {
        let contents = to_contents(vec![
            CanonicalMessage::text(Role::System, "[System]: be brief"),
            CanonicalMessage::new(Role::Assistant, vec![text("calling"), call("f")]),
            CanonicalMessage::new(Role::User, vec![]),
            CanonicalMessage::new(Role::User, vec![result("f")]),
        ]);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "model");
        let fc = contents[1].parts[1].function_call.as_ref().unwrap();
        assert_eq!(fc.name, "f");
        assert_eq!(fc.id.as_deref(), Some("f-0000abcd"));
        let fr = contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(fr.response, json!({"result": "ok"}));
    }

    #[test]
    fn test_to_contents_drops_empty_text() {
        let contents = to_contents(vec![
            CanonicalMessage::text(Role::User, ""),
            CanonicalMessage::new(Role::Assistant, vec![text(""), call("f")]),
            CanonicalMessage::text(Role::User, "next"),
        ]);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role, "model");
        assert_eq!(contents[0].parts.len(), 1);
        assert!(contents[0].parts[0].function_call.is_some());
        assert_eq!(contents[1].parts[0].text.as_deref(), Some("next"));
    }
}
