//! SSE stream parser for the Messages API.
//!
//! The streaming format sends `event:` and `data:` lines in standard SSE
//! framing. This module parses those lines into typed [`StreamEvent`]
//! values and accumulates them into a final [`LlmReply`].

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::llm::types::{LlmReply, ToolCall};

/// Events emitted during SSE streaming.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream has started.
    MessageStart,
    /// A new content block has started (`text` or `tool_use`).
    ContentBlockStart {
        index: u32,
        content_type: String,
        id: Option<String>,
        name: Option<String>,
    },
    /// An incremental delta within a content block.
    ContentBlockDelta { index: u32, delta: StreamDelta },
    /// A content block has finished streaming.
    ContentBlockStop { index: u32 },
    /// The overall message is complete.
    MessageDelta { stop_reason: Option<String> },
    /// The stream has fully terminated.
    MessageStop,
    /// A keepalive (no payload).
    Ping,
}

/// Incremental delta within a streaming content block.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text.
    TextDelta(String),
    /// A chunk of JSON for a tool-use input.
    InputJsonDelta(String),
}

/// Parses raw SSE lines into [`StreamEvent`] values.
///
/// Accumulates partial state across calls because SSE events span multiple
/// lines (`event:` followed by `data:`).
#[derive(Debug, Default)]
pub struct SseParser {
    current_event_type: Option<String>,
}

impl SseParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns `Some(event)` when a complete event has been parsed, `None`
    /// for comment lines, blank lines, or `event:` prefix lines.
    pub fn parse_line(&mut self, line: &str) -> EngineResult<Option<StreamEvent>> {
        let line = line.trim_end();

        if line.starts_with(':') || line.is_empty() {
            return Ok(None);
        }

        if let Some(event_type) = line.strip_prefix("event: ") {
            self.current_event_type = Some(event_type.to_owned());
            return Ok(None);
        }

        if let Some(data) = line.strip_prefix("data: ") {
            let event_type = self
                .current_event_type
                .take()
                .unwrap_or_else(|| "unknown".into());
            return parse_event(&event_type, data);
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        Ok(None)
    }
}

fn parse_event(event_type: &str, data: &str) -> EngineResult<Option<StreamEvent>> {
    match event_type {
        "message_start" => Ok(Some(StreamEvent::MessageStart)),

        "content_block_start" => {
            let v = parse_json(data)?;
            let block = &v["content_block"];
            Ok(Some(StreamEvent::ContentBlockStart {
                index: v["index"].as_u64().unwrap_or(0) as u32,
                content_type: json_string(block, "type"),
                id: block["id"].as_str().map(String::from),
                name: block["name"].as_str().map(String::from),
            }))
        }

        "content_block_delta" => {
            let v = parse_json(data)?;
            let delta_obj = &v["delta"];
            let delta = match json_string(delta_obj, "type").as_str() {
                "text_delta" => StreamDelta::TextDelta(json_string(delta_obj, "text")),
                "input_json_delta" => {
                    StreamDelta::InputJsonDelta(json_string(delta_obj, "partial_json"))
                }
                other => {
                    tracing::warn!(delta_type = other, "unknown delta type");
                    return Ok(None);
                }
            };
            Ok(Some(StreamEvent::ContentBlockDelta {
                index: v["index"].as_u64().unwrap_or(0) as u32,
                delta,
            }))
        }

        "content_block_stop" => {
            let v = parse_json(data)?;
            Ok(Some(StreamEvent::ContentBlockStop {
                index: v["index"].as_u64().unwrap_or(0) as u32,
            }))
        }

        "message_delta" => {
            let v = parse_json(data)?;
            Ok(Some(StreamEvent::MessageDelta {
                stop_reason: v["delta"]["stop_reason"].as_str().map(String::from),
            }))
        }

        "message_stop" => Ok(Some(StreamEvent::MessageStop)),

        "ping" => Ok(Some(StreamEvent::Ping)),

        _ => {
            if data.trim() == "[DONE]" {
                Ok(Some(StreamEvent::MessageStop))
            } else {
                tracing::trace!(event_type, "ignoring unknown SSE event type");
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stream accumulator
// ---------------------------------------------------------------------------

/// In-progress tool call being assembled from streaming deltas.
#[derive(Debug)]
struct ToolCallBuilder {
    index: u32,
    id: String,
    name: String,
    input_json: String,
}

/// Accumulates fragments from streaming events into a complete reply.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    tool_calls: Vec<ToolCallBuilder>,
}

impl StreamAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event, invoking `on_text` for each text delta.
    pub fn apply(&mut self, event: &StreamEvent, on_text: &mut (dyn for<'a> FnMut(&'a str) + Send)) {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_type,
                id,
                name,
            } if content_type == "tool_use" => {
                self.tool_calls.push(ToolCallBuilder {
                    index: *index,
                    id: id.clone().unwrap_or_default(),
                    name: name.clone().unwrap_or_default(),
                    input_json: String::new(),
                });
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                StreamDelta::TextDelta(text) => {
                    self.text.push_str(text);
                    on_text(text);
                }
                StreamDelta::InputJsonDelta(fragment) => {
                    if let Some(builder) =
                        self.tool_calls.iter_mut().find(|b| b.index == *index)
                    {
                        builder.input_json.push_str(fragment);
                    }
                }
            },
            _ => {}
        }
    }

    /// The text accumulated so far.
    pub fn accumulated_text(&self) -> &str {
        &self.text
    }

    /// Finish the stream and produce the aggregated reply.
    pub fn into_reply(self) -> EngineResult<LlmReply> {
        if self.tool_calls.is_empty() {
            return Ok(LlmReply::Text(self.text));
        }

        let calls = self
            .tool_calls
            .into_iter()
            .map(|builder| {
                let arguments: Value = if builder.input_json.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&builder.input_json).map_err(|e| {
                        EngineError::LlmParseFailed {
                            reason: format!(
                                "invalid tool input JSON for `{}`: {e}",
                                builder.name
                            ),
                        }
                    })?
                };
                Ok(ToolCall {
                    id: builder.id,
                    name: builder.name,
                    arguments,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(LlmReply::ToolCalls {
            partial_text: self.text,
            calls,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_json(data: &str) -> EngineResult<Value> {
    serde_json::from_str(data).map_err(|e| EngineError::LlmParseFailed {
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}

fn json_string(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseParser, lines: &[&str]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = parser.parse_line(line).unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn text_stream_accumulates() {
        let mut parser = SseParser::new();
        let events = feed(
            &mut parser,
            &[
                "event: message_start",
                r#"data: {"type":"message_start","message":{"id":"msg_01"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":", world"}}"#,
                "event: message_stop",
                "data: {}",
            ],
        );

        let mut accumulator = StreamAccumulator::new();
        let mut deltas = Vec::new();
        for event in &events {
            accumulator.apply(event, &mut |t| deltas.push(t.to_owned()));
        }

        assert_eq!(deltas, vec!["Hello", ", world"]);
        match accumulator.into_reply().unwrap() {
            LlmReply::Text(text) => assert_eq!(text, "Hello, world"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn tool_call_assembled_from_json_deltas() {
        let mut parser = SseParser::new();
        let events = feed(
            &mut parser,
            &[
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"call_1","name":"web_search"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                "event: message_stop",
                "data: {}",
            ],
        );

        let mut accumulator = StreamAccumulator::new();
        for event in &events {
            accumulator.apply(event, &mut |_| {});
        }

        match accumulator.into_reply().unwrap() {
            LlmReply::ToolCalls { calls, .. } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "call_1");
                assert_eq!(calls[0].name, "web_search");
                assert_eq!(calls[0].arguments["query"], "rust");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn empty_tool_input_defaults_to_object() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.apply(
            &StreamEvent::ContentBlockStart {
                index: 0,
                content_type: "tool_use".to_owned(),
                id: Some("call_1".to_owned()),
                name: Some("list_files".to_owned()),
            },
            &mut |_| {},
        );

        match accumulator.into_reply().unwrap() {
            LlmReply::ToolCalls { calls, .. } => {
                assert!(calls[0].arguments.as_object().unwrap().is_empty());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.parse_line("").unwrap().is_none());
        assert!(parser.parse_line(": keepalive").unwrap().is_none());
    }
}
