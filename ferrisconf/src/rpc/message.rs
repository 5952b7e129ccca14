//! Envelope-level NETCONF message handling.
//!
//! Only the parts of a message the session layer needs are looked at: the
//! `<hello>` capability list, the `message-id` of replies, `<rpc-error>`
//! fields, the `<data>` payload and whether a message is a notification.
//! Payloads are never interpreted. Elements are matched by local name, so
//! prefixed and default-namespace documents read the same.

use indexmap::IndexMap;
use log::trace;
use roxmltree::{Document, Node};

use crate::data::NETCONF_BASE_NS;
use crate::error::{DocumentedError, ErrorSeverity, ErrorTag, ErrorType};

/// Base 1.0 capability.
pub const BASE_1_0: &str = "urn:ietf:params:netconf:base:1.0";

/// Base 1.1 capability (chunked framing).
pub const BASE_1_1: &str = "urn:ietf:params:netconf:base:1.1";

/// Wrap an operation in an `<rpc>` envelope.
pub fn rpc_envelope(message_id: &str, operation: &str) -> String {
    format!(
        "<rpc message-id=\"{}\" xmlns=\"{}\">{}</rpc>",
        escape(message_id),
        NETCONF_BASE_NS,
        operation
    )
}

/// Build the client `<hello>`.
pub fn client_hello(capabilities: &[&str]) -> String {
    let mut hello = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><hello xmlns=\"{}\"><capabilities>",
        NETCONF_BASE_NS
    );
    for capability in capabilities {
        hello.push_str("<capability>");
        hello.push_str(&escape(capability));
        hello.push_str("</capability>");
    }
    hello.push_str("</capabilities></hello>");
    hello
}

/// Escape text for use in element content or a quoted attribute.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Capabilities and session id from a server `<hello>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub capabilities: Vec<String>,
    pub session_id: Option<u64>,
}

/// Parse a server `<hello>`. Returns `None` if it advertises no capabilities.
pub fn parse_hello(message: &str) -> Option<ServerHello> {
    let doc = parse(message)?;
    let hello = doc.root_element();
    if !is_named(hello, "hello") {
        return None;
    }

    let capabilities: Vec<String> = hello
        .descendants()
        .filter(|n| is_named(*n, "capability"))
        .map(|n| text_of(n).trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if capabilities.is_empty() {
        return None;
    }
    let session_id = child(hello, "session-id").and_then(|n| text_of(n).trim().parse().ok());
    Some(ServerHello {
        capabilities,
        session_id,
    })
}

/// The `message-id` attribute of an `<rpc-reply>`.
pub fn reply_message_id(message: &str) -> Option<String> {
    let doc = parse(message)?;
    let root = doc.root_element();
    if !is_named(root, "rpc-reply") {
        return None;
    }
    root.attribute("message-id").map(str::to_string)
}

/// Whether the message is a `<notification>`.
pub fn is_notification(message: &str) -> bool {
    parse(message).is_some_and(|doc| is_named(doc.root_element(), "notification"))
}

/// Whether the reply is a bare `<ok/>`.
pub fn is_ok(message: &str) -> bool {
    parse(message).is_some_and(|doc| child(doc.root_element(), "ok").is_some())
}

/// Contents of the reply `<data>` element as raw XML.
///
/// `Some("")` for an empty `<data/>`, `None` if there is no data element.
pub fn data_content(message: &str) -> Option<String> {
    let doc = parse(message)?;
    let data = child(doc.root_element(), "data")?;
    Some(inner_xml(message, data).trim().to_string())
}

/// Character content of the reply `<data>` element, entities decoded.
///
/// This is how `<get-schema>` returns model text.
pub fn data_text(message: &str) -> Option<String> {
    let doc = parse(message)?;
    child(doc.root_element(), "data").map(text_of)
}

/// All `<rpc-error>` entries of a reply, in document order.
pub fn rpc_errors(message: &str) -> Vec<DocumentedError> {
    let Some(doc) = parse(message) else {
        return Vec::new();
    };
    doc.root_element()
        .children()
        .filter(|n| is_named(*n, "rpc-error"))
        .map(parse_rpc_error)
        .collect()
}

fn parse_rpc_error(error: Node<'_, '_>) -> DocumentedError {
    let field = |name: &str| child(error, name).map(|n| text_of(n).trim().to_string());

    let error_type = field("error-type")
        .and_then(|t| ErrorType::parse(&t))
        .unwrap_or(ErrorType::Application);
    let tag = field("error-tag")
        .and_then(|t| ErrorTag::parse(&t))
        .unwrap_or(ErrorTag::OperationFailed);
    let severity = field("error-severity")
        .and_then(|s| ErrorSeverity::parse(&s))
        .unwrap_or(ErrorSeverity::Error);
    let message = field("error-message").unwrap_or_default();

    let mut info = IndexMap::new();
    if let Some(error_info) = child(error, "error-info") {
        for entry in error_info.children().filter(Node::is_element) {
            info.insert(
                entry.tag_name().name().to_string(),
                text_of(entry).trim().to_string(),
            );
        }
    }

    DocumentedError {
        error_type,
        tag,
        severity,
        message,
        info,
    }
}

fn parse(message: &str) -> Option<Document<'_>> {
    match Document::parse(message) {
        Ok(doc) => Some(doc),
        Err(e) => {
            trace!("Unparseable message ({}): {}", e, message);
            None
        }
    }
}

fn is_named(node: Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| is_named(*n, name))
}

/// Concatenated text of every descendant text node.
fn text_of(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(Node::is_text)
        .filter_map(|n| n.text())
        .collect()
}

fn inner_xml<'m>(message: &'m str, node: Node<'_, '_>) -> &'m str {
    match (node.first_child(), node.last_child()) {
        (Some(first), Some(last)) => &message[first.range().start..last.range().end],
        _ => "",
    }
}
