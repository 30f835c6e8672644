//! Tool-request directives embedded in model output.
//!
//! A model asks for a capability by writing a block like
//!
//! ```text
//! <<<[TOOL_REQUEST]>>>
//! tool_name:「始」HelloWorld「末」,
//! name:「始」Alice「末」
//! <<<[END_TOOL_REQUEST]>>>
//! ```
//!
//! Every `key:「始」value「末」` pair becomes a string argument; `tool_name`
//! names the capability. Values may span lines.

use conclave_core::tool::{ToolCall, ToolDefinition};
use regex_lite::Regex;
use std::sync::LazyLock;

pub const START_MARKER: &str = "<<<[TOOL_REQUEST]>>>";
pub const END_MARKER: &str = "<<<[END_TOOL_REQUEST]>>>";
pub const TOOL_NAME_KEY: &str = "tool_name";

/// A complete block that could not be turned into a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedDirective {
    pub raw: String,
    pub reason: String,
}

/// The result of scanning one model reply.
#[derive(Debug, Clone, Default)]
pub struct ParsedDirectives {
    /// The reply with every complete block removed
    pub visible: String,
    /// Calls in the order they appear
    pub calls: Vec<ToolCall>,
    pub malformed: Vec<MalformedDirective>,
}

impl ParsedDirectives {
    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }
}

static ARGUMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)([A-Za-z_][A-Za-z0-9_\-]*)\s*:\s*「始」(.*?)「末」").expect("valid argument pattern")
});

static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid blank-line pattern"));

/// Split `text` into visible prose and tool calls.
///
/// An unterminated block is left in the visible text untouched.
pub fn parse(text: &str) -> ParsedDirectives {
    let mut parsed = ParsedDirectives::default();
    let mut visible = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(START_MARKER) {
        let body_start = start + START_MARKER.len();
        let Some(body_len) = rest[body_start..].find(END_MARKER) else {
            break;
        };

        visible.push_str(&rest[..start]);
        let body = &rest[body_start..body_start + body_len];
        match parse_block(body) {
            Ok(call) => parsed.calls.push(call),
            Err(reason) => parsed.malformed.push(MalformedDirective {
                raw: body.trim().to_string(),
                reason,
            }),
        }
        rest = &rest[body_start + body_len + END_MARKER.len()..];
    }
    visible.push_str(rest);

    parsed.visible = BLANK_RUN.replace_all(&visible, "\n\n").trim().to_string();
    parsed
}

fn parse_block(body: &str) -> Result<ToolCall, String> {
    let mut tool_name = None;
    let mut arguments = serde_json::Map::new();

    for captures in ARGUMENT.captures_iter(body) {
        let (Some(key), Some(value)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let value = value.as_str().trim();
        if key.as_str().eq_ignore_ascii_case(TOOL_NAME_KEY) {
            tool_name = Some(value.to_string());
        } else {
            arguments.insert(
                key.as_str().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    match tool_name {
        Some(name) if !name.is_empty() => Ok(ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name,
            arguments: serde_json::Value::Object(arguments),
        }),
        Some(_) => Err("tool_name is empty".into()),
        None => Err(format!("missing {TOOL_NAME_KEY}:「始」...「末」")),
    }
}

/// Render a call the way a model is expected to write it.
pub fn render(tool_name: &str, arguments: &[(&str, &str)]) -> String {
    let mut out = format!("{START_MARKER}\n{TOOL_NAME_KEY}:「始」{tool_name}「末」");
    for (key, value) in arguments {
        out.push_str(&format!(",\n{key}:「始」{value}「末」"));
    }
    out.push('\n');
    out.push_str(END_MARKER);
    out
}

/// Prompt text telling a model which tools exist and how to ask for them.
///
/// Returns an empty string when there is nothing to advertise.
pub fn usage_guide(definitions: &[ToolDefinition]) -> String {
    if definitions.is_empty() {
        return String::new();
    }

    let mut out = String::from("You can use the following tools:\n");
    for def in definitions {
        out.push_str(&format!("- {}: {}\n", def.name, def.description));
        if let Some(props) = def.parameters.get("properties").and_then(|p| p.as_object()) {
            let names: Vec<&str> = props.keys().map(String::as_str).collect();
            if !names.is_empty() {
                out.push_str(&format!("  arguments: {}\n", names.join(", ")));
            }
        }
    }
    out.push_str(&format!(
        "\nTo call a tool, write a block like this anywhere in your reply:\n{}\n\
         You may include several blocks. Their results are returned to you before you continue.",
        render("ToolName", &[("argument", "value")])
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_has_no_calls() {
        let parsed = parse("  Just an answer.  ");
        assert_eq!(parsed.visible, "Just an answer.");
        assert!(!parsed.has_calls());
        assert!(parsed.malformed.is_empty());
    }

    #[test]
    fn single_block_is_extracted() {
        let text = "Let me greet her.\n<<<[TOOL_REQUEST]>>>\ntool_name:「始」HelloWorld「末」,\nname:「始」Alice「末」\n<<<[END_TOOL_REQUEST]>>>\n";
        let parsed = parse(text);
        assert_eq!(parsed.visible, "Let me greet her.");
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "HelloWorld");
        assert_eq!(parsed.calls[0].arguments["name"], "Alice");
        assert!(parsed.calls[0].id.starts_with("call_"));
    }

    #[test]
    fn multiple_blocks_keep_order() {
        let text = format!(
            "{}\nand\n{}",
            render("first", &[("n", "1")]),
            render("second", &[])
        );
        let parsed = parse(&text);
        let names: Vec<&str> = parsed.calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(parsed.visible, "and");
        assert_ne!(parsed.calls[0].id, parsed.calls[1].id);
    }

    #[test]
    fn values_may_span_lines() {
        let text = "<<<[TOOL_REQUEST]>>>\ntool_name:「始」Write「末」,\ncontent:「始」line one\nline two「末」\n<<<[END_TOOL_REQUEST]>>>";
        let parsed = parse(text);
        assert_eq!(parsed.calls[0].arguments["content"], "line one\nline two");
    }

    #[test]
    fn block_without_tool_name_is_malformed() {
        let text = "Hmm.\n<<<[TOOL_REQUEST]>>>\nname:「始」Alice「末」\n<<<[END_TOOL_REQUEST]>>>";
        let parsed = parse(text);
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.malformed.len(), 1);
        assert!(parsed.malformed[0].reason.contains("tool_name"));
        assert_eq!(parsed.visible, "Hmm.");
    }

    #[test]
    fn unterminated_block_stays_visible() {
        let text = "Starting <<<[TOOL_REQUEST]>>> tool_name:「始」X「末」";
        let parsed = parse(text);
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.visible, text);
    }

    #[test]
    fn removed_blocks_do_not_leave_gaps() {
        let text = format!("Before.\n\n{}\n\nAfter.", render("t", &[]));
        assert_eq!(parse(&text).visible, "Before.\n\nAfter.");
    }

    #[test]
    fn render_round_trips() {
        let parsed = parse(&render("HelloWorld", &[("command", "echo"), ("message", "hi")]));
        assert_eq!(parsed.calls[0].name, "HelloWorld");
        assert_eq!(parsed.calls[0].arguments["command"], "echo");
        assert_eq!(parsed.calls[0].arguments["message"], "hi");
    }

    #[test]
    fn usage_guide_lists_tools_and_syntax() {
        let defs = vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo text".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } }
            }),
        }];
        let guide = usage_guide(&defs);
        assert!(guide.contains("- echo: Echo text"));
        assert!(guide.contains("arguments: text"));
        assert!(guide.contains(START_MARKER));
        assert!(guide.contains(END_MARKER));
        assert!(usage_guide(&[]).is_empty());
    }
}
