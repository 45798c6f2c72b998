use crate::relay::{
    Choice, Inbound, Message, MessageContent, RelayResponse, ToolCall, OBJECT_CHAT_COMPLETION,
};
use std::collections::HashMap;

pub mod anthropic;
pub mod openai_chat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundType {
    OpenAiChat,
    OpenAiResponse,
    Anthropic,
}

impl InboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundType::OpenAiChat => "openai_chat",
            InboundType::OpenAiResponse => "openai_response",
            InboundType::Anthropic => "anthropic",
        }
    }
}

/// Returns a fresh adapter instance per call. Adapters carry per-request
/// accumulator state and must never be shared across requests. `None` means
/// the dialect has no registered implementation.
pub fn get_inbound(kind: InboundType) -> Option<Box<dyn Inbound>> {
    match kind {
        InboundType::OpenAiChat => Some(Box::new(openai_chat::ChatInbound::new())),
        InboundType::Anthropic => Some(Box::new(anthropic::MessagesInbound::new())),
        InboundType::OpenAiResponse => None,
    }
}

/// Per-choice running state folded out of streaming chunks, shared by every
/// inbound adapter. Tool calls merge by tool-call index: argument fragments
/// concatenate, name/id/type overwrite when a chunk carries a non-empty value.
#[derive(Default)]
pub(crate) struct StreamAccumulator {
    response: Option<RelayResponse>,
    content: HashMap<u32, String>,
    tool_calls: HashMap<u32, Vec<ToolCall>>,
    reasoning: HashMap<u32, String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored response wholesale (non-streaming path).
    pub fn store(&mut self, response: &RelayResponse) {
        self.response = Some(response.clone());
    }

    pub fn fold(&mut self, chunk: &RelayResponse) {
        let response = self.response.get_or_insert_with(|| RelayResponse {
            id: chunk.id.clone(),
            object: OBJECT_CHAT_COMPLETION.to_string(),
            created: chunk.created,
            model: chunk.model.clone(),
            system_fingerprint: chunk.system_fingerprint.clone(),
            service_tier: chunk.service_tier.clone(),
            ..Default::default()
        });

        if !chunk.model.is_empty() {
            response.model = chunk.model.clone();
        }
        if chunk.usage.is_some() {
            response.usage = chunk.usage.clone();
        }
        if chunk.error.is_some() {
            response.error = chunk.error.clone();
        }

        for choice in &chunk.choices {
            if let Some(delta) = &choice.delta {
                let text = delta.content_text();
                if !text.is_empty() {
                    self.content.entry(choice.index).or_default().push_str(&text);
                }
                if let Some(reasoning) = &delta.reasoning_content {
                    self.reasoning
                        .entry(choice.index)
                        .or_default()
                        .push_str(reasoning);
                }
                if !delta.tool_calls.is_empty() {
                    merge_tool_calls(
                        self.tool_calls.entry(choice.index).or_default(),
                        &delta.tool_calls,
                    );
                }
            }

            if let Some(reason) = &choice.finish_reason {
                ensure_choice(&mut response.choices, choice.index);
                response.choices[choice.index as usize].finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn assemble(&self) -> RelayResponse {
        let Some(stored) = &self.response else {
            return RelayResponse {
                object: OBJECT_CHAT_COMPLETION.to_string(),
                created: chrono::Utc::now().timestamp(),
                ..Default::default()
            };
        };

        // Nothing folded means the stored response came in whole
        // (non-streaming); hand it back as-is.
        if self.content.is_empty() && self.tool_calls.is_empty() && self.reasoning.is_empty() {
            return stored.clone();
        }

        let mut result = RelayResponse {
            id: stored.id.clone(),
            object: OBJECT_CHAT_COMPLETION.to_string(),
            created: stored.created,
            model: stored.model.clone(),
            system_fingerprint: stored.system_fingerprint.clone(),
            service_tier: stored.service_tier.clone(),
            usage: stored.usage.clone(),
            error: stored.error.clone(),
            ..Default::default()
        };

        let mut max_index: Option<u32> = None;
        for idx in self
            .content
            .keys()
            .chain(self.tool_calls.keys())
            .chain(self.reasoning.keys())
        {
            max_index = Some(max_index.map_or(*idx, |m| m.max(*idx)));
        }
        if !stored.choices.is_empty() {
            let last = (stored.choices.len() - 1) as u32;
            max_index = Some(max_index.map_or(last, |m| m.max(last)));
        }

        if let Some(max_index) = max_index {
            for i in 0..=max_index {
                let mut message = Message {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text(
                        self.content.get(&i).cloned().unwrap_or_default(),
                    )),
                    tool_calls: self.tool_calls.get(&i).cloned().unwrap_or_default(),
                    ..Default::default()
                };
                if let Some(reasoning) = self.reasoning.get(&i) {
                    if !reasoning.is_empty() {
                        message.reasoning_content = Some(reasoning.clone());
                    }
                }
                result.choices.push(Choice {
                    index: i,
                    message: Some(message),
                    finish_reason: stored
                        .choices
                        .get(i as usize)
                        .and_then(|c| c.finish_reason.clone()),
                    ..Default::default()
                });
            }
        }

        if result.choices.is_empty() && !stored.choices.is_empty() {
            result.choices = stored.choices.clone();
        }

        result
    }
}

fn merge_tool_calls(existing: &mut Vec<ToolCall>, incoming: &[ToolCall]) {
    for call in incoming {
        if let Some(found) = existing.iter_mut().find(|c| c.index == call.index) {
            found.function.arguments.push_str(&call.function.arguments);
            if !call.function.name.is_empty() {
                found.function.name = call.function.name.clone();
            }
            if !call.id.is_empty() {
                found.id = call.id.clone();
            }
            if !call.kind.is_empty() {
                found.kind = call.kind.clone();
            }
        } else {
            existing.push(call.clone());
        }
    }
}

fn ensure_choice(choices: &mut Vec<Choice>, index: u32) {
    while choices.len() <= index as usize {
        choices.push(Choice {
            index: choices.len() as u32,
            ..Default::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::FunctionCall;

    fn delta_chunk(index: u32, delta: Message) -> RelayResponse {
        RelayResponse {
            choices: vec![Choice {
                index,
                delta: Some(delta),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn accumulator_concatenates_text_and_reasoning() {
        let mut acc = StreamAccumulator::new();
        acc.fold(&delta_chunk(
            0,
            Message {
                content: Some(MessageContent::Text("Hel".to_string())),
                ..Default::default()
            },
        ));
        acc.fold(&delta_chunk(
            0,
            Message {
                content: Some(MessageContent::Text("lo".to_string())),
                reasoning_content: Some("because".to_string()),
                ..Default::default()
            },
        ));

        let resp = acc.assemble();
        let message = resp.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content_text(), "Hello");
        assert_eq!(message.reasoning_content.as_deref(), Some("because"));
    }

    #[test]
    fn accumulator_merges_tool_call_fragments_by_index() {
        let mut acc = StreamAccumulator::new();
        acc.fold(&delta_chunk(
            0,
            Message {
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    kind: "function".to_string(),
                    index: 0,
                    function: FunctionCall {
                        name: "lookup".to_string(),
                        arguments: "{\"q\":".to_string(),
                    },
                }],
                ..Default::default()
            },
        ));
        acc.fold(&delta_chunk(
            0,
            Message {
                tool_calls: vec![ToolCall {
                    index: 0,
                    function: FunctionCall {
                        arguments: "\"rust\"}".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
        ));

        let resp = acc.assemble();
        let calls = &resp.choices[0].message.as_ref().unwrap().tool_calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"rust\"}");
        assert!(serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).is_ok());
    }

    #[test]
    fn accumulator_builds_one_choice_per_observed_index() {
        let mut acc = StreamAccumulator::new();
        acc.fold(&delta_chunk(
            2,
            Message {
                content: Some(MessageContent::Text("c".to_string())),
                ..Default::default()
            },
        ));
        let resp = acc.assemble();
        assert_eq!(resp.choices.len(), 3);
        assert_eq!(resp.choices[2].message.as_ref().unwrap().content_text(), "c");
    }

    #[test]
    fn factory_returns_fresh_instances() {
        assert!(get_inbound(InboundType::OpenAiChat).is_some());
        assert!(get_inbound(InboundType::Anthropic).is_some());
        assert!(get_inbound(InboundType::OpenAiResponse).is_none());
    }
}
