//! Proxy meta-tool
//!
//! One built-in tool exposing `list`/`info`/`call` over tools, resources,
//! and prompts. Validation is strict and happens before any dispatch; the
//! result is a typed envelope: an embedded JSON resource carrying the data,
//! with the proxy annotations (`proxyAction`, `proxyType`, `proxyPath`,
//! `dataType`, `many`, `contentType`) in the structured-content envelope
//! declared by the tool's output schema.

use std::sync::Arc;

use rmcp::model::{CallToolResult, Content, ResourceContents, Tool};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::BackendReply;
use crate::mount::{CapabilityKind, MountEngine};
use crate::{Error, Result};

/// Name of the proxy tool on the aggregator surface.
pub const PROXY_TOOL: &str = "proxy";

/// Proxy operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    /// Enumerate capabilities of one kind.
    List,
    /// Metadata for a single capability.
    Info,
    /// Invoke a capability.
    Call,
}

impl ProxyAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Info => "info",
            Self::Call => "call",
        }
    }
}

/// A validated proxy request.
#[derive(Debug)]
pub struct ProxyRequest {
    /// Operation to perform.
    pub action: ProxyAction,
    /// Capability kind addressed.
    pub kind: CapabilityKind,
    /// Aggregated name or URI; present iff action is info/call.
    pub path: Option<String>,
    /// Call arguments; present only for call.
    pub args: Option<Map<String, Value>>,
}

impl ProxyRequest {
    /// Strict parameter validation: missing, forbidden, out-of-range, or
    /// unknown parameters fail before dispatch.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first offending parameter.
    pub fn parse(params: Option<Map<String, Value>>) -> Result<Self> {
        let params = params.unwrap_or_default();

        for key in params.keys() {
            if !matches!(key.as_str(), "action" | "type" | "path" | "args") {
                return Err(Error::Validation(format!("unknown proxy parameter {key:?}")));
            }
        }

        let action = match params.get("action").and_then(Value::as_str) {
            Some("list") => ProxyAction::List,
            Some("info") => ProxyAction::Info,
            Some("call") => ProxyAction::Call,
            Some(other) => {
                return Err(Error::Validation(format!("invalid action {other:?}")));
            }
            None => return Err(Error::Validation("missing required parameter 'action'".into())),
        };

        let kind = match params.get("type").and_then(Value::as_str) {
            Some("tool") => CapabilityKind::Tool,
            Some("resource") => CapabilityKind::Resource,
            Some("prompt") => CapabilityKind::Prompt,
            Some(other) => {
                return Err(Error::Validation(format!("invalid type {other:?}")));
            }
            None => return Err(Error::Validation("missing required parameter 'type'".into())),
        };

        let path = match (action, params.get("path")) {
            (ProxyAction::List, Some(_)) => {
                return Err(Error::Validation("'path' is forbidden for action 'list'".into()));
            }
            (ProxyAction::List, None) => None,
            (_, Some(Value::String(p))) if !p.is_empty() => Some(p.clone()),
            (_, _) => {
                return Err(Error::Validation(format!(
                    "'path' is required for action {:?}",
                    action.as_str()
                )));
            }
        };

        let args = match (action, params.get("args")) {
            (ProxyAction::Call, Some(Value::Object(map))) => Some(map.clone()),
            (ProxyAction::Call, Some(_)) => {
                return Err(Error::Validation("'args' must be an object".into()));
            }
            (ProxyAction::Call, None) => None,
            (_, Some(_)) => {
                return Err(Error::Validation("'args' is allowed only for action 'call'".into()));
            }
            (_, None) => None,
        };

        Ok(Self {
            action,
            kind,
            path,
            args,
        })
    }
}

/// Handle one proxy invocation.
///
/// # Errors
///
/// Validation errors, unknown capabilities, and backend failures surface as
/// MCP errors; backend call errors are not rewrapped beyond annotation.
pub async fn handle(
    engine: &MountEngine,
    params: Option<Map<String, Value>>,
    cancel: CancellationToken,
) -> Result<CallToolResult> {
    let request = ProxyRequest::parse(params)?;
    match request.action {
        ProxyAction::List => list(engine, request.kind),
        ProxyAction::Info => info(engine, request.kind, &request.path.unwrap_or_default()),
        ProxyAction::Call => {
            call(
                engine,
                request.kind,
                &request.path.unwrap_or_default(),
                request.args,
                cancel,
            )
            .await
        }
    }
}

fn list(engine: &MountEngine, kind: CapabilityKind) -> Result<CallToolResult> {
    let index = engine.index();
    let data: Vec<Value> = match kind {
        CapabilityKind::Tool => index
            .tools
            .values()
            .map(|(_, t)| serde_json::to_value(t))
            .collect::<std::result::Result<_, _>>()?,
        CapabilityKind::Resource => {
            let mut out: Vec<Value> = index
                .resources
                .values()
                .map(|(_, r)| serde_json::to_value(r))
                .collect::<std::result::Result<_, _>>()?;
            for (_, t) in index.resource_templates.values() {
                out.push(serde_json::to_value(t)?);
            }
            out
        }
        CapabilityKind::Prompt => index
            .prompts
            .values()
            .map(|(_, p)| serde_json::to_value(p))
            .collect::<std::result::Result<_, _>>()?,
    };

    let annotations = proxy_annotations(ProxyAction::List, kind, None, None);
    Ok(envelope(
        &format!("proxy://{}/list", kind.as_str()),
        &Value::Array(data),
        annotations,
    ))
}

fn info(engine: &MountEngine, kind: CapabilityKind, path: &str) -> Result<CallToolResult> {
    let index = engine.index();
    let data: Value = match kind {
        CapabilityKind::Tool => index
            .tools
            .get(path)
            .map(|(_, t)| serde_json::to_value(t))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("tool {path:?}")))?,
        CapabilityKind::Resource => index
            .resources
            .get(path)
            .map(|(_, r)| serde_json::to_value(r))
            .or_else(|| {
                index
                    .resource_templates
                    .get(path)
                    .map(|(_, t)| serde_json::to_value(t))
            })
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("resource {path:?}")))?,
        CapabilityKind::Prompt => index
            .prompts
            .get(path)
            .map(|(_, p)| serde_json::to_value(p))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("prompt {path:?}")))?,
    };

    let annotations = proxy_annotations(ProxyAction::Info, kind, Some(path), None);
    Ok(envelope(
        &format!("proxy://{}/info/{path}", kind.as_str()),
        &data,
        annotations,
    ))
}

async fn call(
    engine: &MountEngine,
    kind: CapabilityKind,
    path: &str,
    args: Option<Map<String, Value>>,
    cancel: CancellationToken,
) -> Result<CallToolResult> {
    let reply = engine.call(kind, path, args, cancel).await?;

    match reply {
        BackendReply::Tool(mut result) => {
            // Backend content passes through verbatim; only the envelope is
            // added.
            let annotations = proxy_annotations(ProxyAction::Call, kind, Some(path), None);
            result.structured_content =
                Some(merge_annotations(result.structured_content.take(), annotations));
            Ok(result)
        }
        BackendReply::Resource(result) => {
            let mut content = Vec::new();
            let mut content_type: Option<String> = None;

            for item in result.contents {
                match objectify(item) {
                    Objectified::Json {
                        contents,
                        original_mime,
                    } => {
                        content_type.get_or_insert(original_mime);
                        content.push(Content::resource(contents));
                    }
                    Objectified::Passthrough(contents) => {
                        content.push(Content::resource(contents));
                    }
                }
            }

            let annotations =
                proxy_annotations(ProxyAction::Call, kind, Some(path), content_type.as_deref());
            Ok(CallToolResult {
                content,
                structured_content: Some(annotations),
                is_error: Some(false),
                meta: None,
            })
        }
        BackendReply::Prompt(result) => {
            let annotations = proxy_annotations(ProxyAction::Call, kind, Some(path), None);
            Ok(envelope(
                &format!("proxy://prompt/{path}"),
                &serde_json::to_value(&result)?,
                annotations,
            ))
        }
        BackendReply::Ack => Err(Error::Protocol(
            "unexpected subscription ack in response to a call".to_string(),
        )),
    }
}

/// Result of the objectification pass over one resource content item.
enum Objectified {
    /// Text that parsed as JSON: canonically re-encoded, original MIME kept.
    Json {
        contents: ResourceContents,
        original_mime: String,
    },
    /// Binary or non-JSON text: unchanged.
    Passthrough(ResourceContents),
}

/// Canonical JSON re-encoding of a text resource that parses as JSON. The
/// original URI is preserved; binary payloads pass through unchanged.
fn objectify(contents: ResourceContents) -> Objectified {
    match contents {
        ResourceContents::TextResourceContents {
            uri,
            mime_type,
            text,
            meta,
        } => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => {
                let original_mime = mime_type.unwrap_or_else(|| "text/plain".to_string());
                let canonical = parsed.to_string();
                Objectified::Json {
                    contents: ResourceContents::TextResourceContents {
                        uri,
                        mime_type: Some("application/json".to_string()),
                        text: canonical,
                        meta,
                    },
                    original_mime,
                }
            }
            Err(_) => Objectified::Passthrough(ResourceContents::TextResourceContents {
                uri,
                mime_type,
                text,
                meta,
            }),
        },
        blob @ ResourceContents::BlobResourceContents { .. } => Objectified::Passthrough(blob),
    }
}

/// The annotation envelope carried in structured content.
fn proxy_annotations(
    action: ProxyAction,
    kind: CapabilityKind,
    path: Option<&str>,
    content_type: Option<&str>,
) -> Value {
    let mut map = Map::new();
    map.insert("proxyAction".into(), json!(action.as_str()));
    map.insert("proxyType".into(), json!(kind.as_str()));
    if let Some(path) = path {
        map.insert("proxyPath".into(), json!(path));
    }
    if action != ProxyAction::Call {
        map.insert("dataType".into(), json!(data_type(kind)));
        map.insert("many".into(), json!(action == ProxyAction::List));
    }
    if let Some(ct) = content_type {
        map.insert("contentType".into(), json!(ct));
    }
    Value::Object(map)
}

/// Implementation-free type tag for list/info envelopes.
fn data_type(kind: CapabilityKind) -> &'static str {
    match kind {
        CapabilityKind::Tool => "Tool",
        CapabilityKind::Resource => "Resource|ResourceTemplate",
        CapabilityKind::Prompt => "Prompt",
    }
}

/// Overlay the proxy annotations onto whatever structured content the
/// backend returned; backend keys win on conflict.
fn merge_annotations(existing: Option<Value>, annotations: Value) -> Value {
    match (existing, annotations) {
        (Some(Value::Object(backend)), Value::Object(mut ours)) => {
            for (k, v) in backend {
                ours.insert(k, v);
            }
            Value::Object(ours)
        }
        (Some(other), _) => other,
        (None, ours) => ours,
    }
}

/// One-element embedded-JSON-resource result.
fn envelope(uri: &str, data: &Value, annotations: Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::resource(ResourceContents::TextResourceContents {
            uri: uri.to_string(),
            mime_type: Some("application/json".to_string()),
            text: data.to_string(),
            meta: None,
        })],
        structured_content: Some(annotations),
        is_error: Some(false),
        meta: None,
    }
}

/// The proxy tool definition published on the aggregator surface.
#[must_use]
pub fn tool_definition() -> Tool {
    let schema = json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["list", "info", "call"],
                "description": "Operation to perform"
            },
            "type": {
                "type": "string",
                "enum": ["tool", "resource", "prompt"],
                "description": "Capability kind to address"
            },
            "path": {
                "type": "string",
                "description": "Aggregated name or URI (required for info/call, forbidden for list)"
            },
            "args": {
                "type": "object",
                "description": "Arguments for call"
            }
        },
        "required": ["action", "type"],
        "additionalProperties": false
    });

    let Value::Object(schema) = schema else {
        unreachable!("schema literal is an object");
    };
    Tool::new(
        PROXY_TOOL,
        "List, inspect, and invoke aggregated tools, resources, and prompts \
         through a single typed surface.",
        Arc::new(schema),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(value: Value) -> Option<Map<String, Value>> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    #[test]
    fn parse_accepts_minimal_list() {
        let req = ProxyRequest::parse(params(json!({"action": "list", "type": "tool"}))).unwrap();
        assert_eq!(req.action, ProxyAction::List);
        assert_eq!(req.kind, CapabilityKind::Tool);
        assert!(req.path.is_none());
        assert!(req.args.is_none());
    }

    #[test]
    fn parse_rejects_missing_required_parameters() {
        assert!(ProxyRequest::parse(params(json!({"type": "tool"}))).is_err());
        assert!(ProxyRequest::parse(params(json!({"action": "list"}))).is_err());
        assert!(ProxyRequest::parse(None).is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_values() {
        assert!(ProxyRequest::parse(params(json!({"action": "delete", "type": "tool"}))).is_err());
        assert!(ProxyRequest::parse(params(json!({"action": "list", "type": "widget"}))).is_err());
    }

    #[test]
    fn parse_rejects_path_for_list_and_requires_it_for_info_and_call() {
        assert!(ProxyRequest::parse(params(
            json!({"action": "list", "type": "tool", "path": "x"})
        ))
        .is_err());
        assert!(ProxyRequest::parse(params(json!({"action": "info", "type": "tool"}))).is_err());
        assert!(ProxyRequest::parse(params(json!({"action": "call", "type": "tool"}))).is_err());

        let ok = ProxyRequest::parse(params(
            json!({"action": "info", "type": "tool", "path": "calc_add"}),
        ))
        .unwrap();
        assert_eq!(ok.path.as_deref(), Some("calc_add"));
    }

    #[test]
    fn parse_rejects_args_outside_call() {
        assert!(ProxyRequest::parse(params(
            json!({"action": "list", "type": "tool", "args": {}})
        ))
        .is_err());
        assert!(ProxyRequest::parse(params(
            json!({"action": "call", "type": "tool", "path": "t", "args": 3})
        ))
        .is_err());

        let ok = ProxyRequest::parse(params(
            json!({"action": "call", "type": "tool", "path": "t", "args": {"a": 2}}),
        ))
        .unwrap();
        assert_eq!(ok.args.unwrap()["a"], json!(2));
    }

    #[test]
    fn parse_rejects_unknown_parameters() {
        assert!(ProxyRequest::parse(params(
            json!({"action": "list", "type": "tool", "extra": true})
        ))
        .is_err());
    }

    // -------------------------------------------------------------------------
    // Annotations
    // -------------------------------------------------------------------------

    #[test]
    fn list_annotations_carry_type_tag_and_many() {
        let a = proxy_annotations(ProxyAction::List, CapabilityKind::Tool, None, None);
        assert_eq!(a["proxyAction"], "list");
        assert_eq!(a["proxyType"], "tool");
        assert_eq!(a["dataType"], "Tool");
        assert_eq!(a["many"], true);
        assert!(a.get("proxyPath").is_none());
    }

    #[test]
    fn info_annotations_carry_path_and_single_cardinality() {
        let a = proxy_annotations(
            ProxyAction::Info,
            CapabilityKind::Resource,
            Some("file:///x"),
            None,
        );
        assert_eq!(a["proxyPath"], "file:///x");
        assert_eq!(a["dataType"], "Resource|ResourceTemplate");
        assert_eq!(a["many"], false);
    }

    #[test]
    fn call_annotations_skip_data_type() {
        let a = proxy_annotations(ProxyAction::Call, CapabilityKind::Tool, Some("t"), None);
        assert_eq!(a["proxyAction"], "call");
        assert!(a.get("dataType").is_none());
        assert!(a.get("many").is_none());
    }

    #[test]
    fn merge_annotations_lets_backend_keys_win() {
        let merged = merge_annotations(
            Some(json!({"result": 5, "proxyAction": "backend"})),
            json!({"proxyAction": "call", "proxyType": "tool"}),
        );
        assert_eq!(merged["result"], 5);
        assert_eq!(merged["proxyAction"], "backend");
        assert_eq!(merged["proxyType"], "tool");
    }

    // -------------------------------------------------------------------------
    // Objectification
    // -------------------------------------------------------------------------

    fn text_contents(uri: &str, mime: Option<&str>, text: &str) -> ResourceContents {
        ResourceContents::TextResourceContents {
            uri: uri.to_string(),
            mime_type: mime.map(String::from),
            text: text.to_string(),
            meta: None,
        }
    }

    #[test]
    fn objectify_reencodes_json_text_and_preserves_original_mime() {
        let original = text_contents("cfg://a", Some("text/x-config"), "{\"a\":  1}");
        match objectify(original) {
            Objectified::Json {
                contents:
                    ResourceContents::TextResourceContents {
                        uri,
                        mime_type,
                        text,
                        ..
                    },
                original_mime,
            } => {
                assert_eq!(uri, "cfg://a");
                assert_eq!(mime_type.as_deref(), Some("application/json"));
                assert_eq!(text, r#"{"a":1}"#);
                assert_eq!(original_mime, "text/x-config");
            }
            _ => panic!("expected objectified JSON"),
        }
    }

    #[test]
    fn objectify_passes_non_json_text_through() {
        let original = text_contents("file:///notes.txt", Some("text/plain"), "just words");
        assert!(matches!(
            objectify(original),
            Objectified::Passthrough(ResourceContents::TextResourceContents { ref text, .. })
                if text == "just words"
        ));
    }

    #[test]
    fn objectify_passes_blobs_through() {
        let blob = ResourceContents::BlobResourceContents {
            uri: "file:///img.png".into(),
            mime_type: Some("image/png".into()),
            blob: "aGVsbG8=".into(),
            meta: None,
        };
        assert!(matches!(objectify(blob), Objectified::Passthrough(_)));
    }

    // -------------------------------------------------------------------------
    // Envelope
    // -------------------------------------------------------------------------

    #[test]
    fn envelope_is_single_embedded_json_resource() {
        let result = envelope(
            "proxy://tool/list",
            &json!([{"name": "calc_add"}]),
            proxy_annotations(ProxyAction::List, CapabilityKind::Tool, None, None),
        );

        assert_eq!(result.content.len(), 1);
        assert_eq!(result.is_error, Some(false));

        let structured = result.structured_content.unwrap();
        assert_eq!(structured["proxyAction"], "list");
        assert_eq!(structured["many"], true);
    }

    #[test]
    fn tool_definition_is_strict() {
        let tool = tool_definition();
        assert_eq!(tool.name, PROXY_TOOL);
        let schema = serde_json::to_value(tool.input_schema.as_ref()).unwrap();
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["action", "type"]));
    }
}
