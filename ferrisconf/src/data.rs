//! Datastore addressing and payload types shared by RPCs and the cluster proxy.

use std::fmt;

/// Namespace of the NETCONF base protocol.
pub const NETCONF_BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Logical datastore selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datastore {
    /// Intended configuration (`<get-config>` / `<edit-config>`).
    Configuration,
    /// Configuration plus state data (`<get>`).
    Operational,
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datastore::Configuration => f.write_str("CONFIGURATION"),
            Datastore::Operational => f.write_str("OPERATIONAL"),
        }
    }
}

/// `nc:operation` attribute values used on `<edit-config>` content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOperation {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
}

impl EditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditOperation::Merge => "merge",
            EditOperation::Replace => "replace",
            EditOperation::Create => "create",
            EditOperation::Delete => "delete",
            EditOperation::Remove => "remove",
        }
    }
}

/// One element step of a [`DataPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub name: String,
    pub namespace: Option<String>,
}

impl PathSegment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    fn open_tag(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("<{} xmlns=\"{}\">", self.name, escape_attr(ns)),
            None => format!("<{}>", self.name),
        }
    }

    fn close_tag(&self) -> String {
        format!("</{}>", self.name)
    }
}

/// Absolute path to a node in a device datastore.
///
/// The empty path addresses the whole datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DataPath {
    segments: Vec<PathSegment>,
}

impl DataPath {
    /// The datastore root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from segments.
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Append a child step.
    pub fn child(mut self, segment: PathSegment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render the path as a subtree filter selecting the addressed node.
    ///
    /// Returns `None` for the root path, meaning "no filter".
    pub fn to_subtree_filter(&self) -> Option<String> {
        let (last, ancestors) = self.segments.split_last()?;
        let leaf = match &last.namespace {
            Some(ns) => format!("<{} xmlns=\"{}\"/>", last.name, escape_attr(ns)),
            None => format!("<{}/>", last.name),
        };
        Some(wrap_in(ancestors, leaf))
    }

    /// Render `<config>` content that applies `operation` to the addressed node.
    ///
    /// `node` supplies the element for non-delete operations; for deletes the
    /// element is generated from the last path step.
    pub fn to_edit_content(&self, operation: EditOperation, node: Option<&DataNode>) -> String {
        let ancestors = match self.segments.split_last() {
            Some((_, ancestors)) => ancestors,
            None => &[],
        };
        let target = match (node, self.segments.last()) {
            (Some(node), _) => node.to_xml_with_operation(Some(operation)),
            (None, Some(last)) => DataNode::new(last.name.clone(), last.namespace.clone(), "")
                .to_xml_with_operation(Some(operation)),
            (None, None) => String::new(),
        };
        format!("<config>{}</config>", wrap_in(ancestors, target))
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment.name)?;
        }
        Ok(())
    }
}

fn wrap_in(ancestors: &[PathSegment], inner: String) -> String {
    let mut out = String::new();
    for segment in ancestors {
        out.push_str(&segment.open_tag());
    }
    out.push_str(&inner);
    for segment in ancestors.iter().rev() {
        out.push_str(&segment.close_tag());
    }
    out
}

/// A data tree node: a root element identity plus its serialized children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub name: String,
    pub namespace: Option<String>,
    /// Inner XML of the element.
    pub body: String,
}

impl DataNode {
    pub fn new(
        name: impl Into<String>,
        namespace: Option<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace,
            body: body.into(),
        }
    }

    /// Serialize the node as an XML element.
    pub fn to_xml(&self) -> String {
        self.to_xml_with_operation(None)
    }

    fn to_xml_with_operation(&self, operation: Option<EditOperation>) -> String {
        let mut open = format!("<{}", self.name);
        if let Some(ns) = &self.namespace {
            open.push_str(&format!(" xmlns=\"{}\"", escape_attr(ns)));
        }
        if let Some(op) = operation {
            open.push_str(&format!(
                " xmlns:nc=\"{}\" nc:operation=\"{}\"",
                NETCONF_BASE_NS,
                op.as_str()
            ));
        }
        if self.body.is_empty() {
            format!("{}/>", open)
        } else {
            format!("{}>{}</{}>", open, self.body, self.name)
        }
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interfaces_path() -> DataPath {
        DataPath::root()
            .child(PathSegment::with_namespace(
                "interfaces",
                "urn:ietf:params:xml:ns:yang:ietf-interfaces",
            ))
            .child(PathSegment::new("interface"))
    }

    #[test]
    fn test_root_has_no_filter() {
        assert_eq!(DataPath::root().to_subtree_filter(), None);
        assert_eq!(DataPath::root().to_string(), "/");
    }

    #[test]
    fn test_subtree_filter() {
        let filter = interfaces_path().to_subtree_filter().unwrap();
        assert_eq!(
            filter,
            "<interfaces xmlns=\"urn:ietf:params:xml:ns:yang:ietf-interfaces\"><interface/></interfaces>"
        );
        assert_eq!(interfaces_path().to_string(), "/interfaces/interface");
    }

    #[test]
    fn test_merge_content_wraps_node_in_ancestors() {
        let node = DataNode::new("interface", None, "<name>eth0</name>");
        let content = interfaces_path().to_edit_content(EditOperation::Merge, Some(&node));
        assert!(content.starts_with("<config><interfaces "));
        assert!(content.contains("nc:operation=\"merge\"><name>eth0</name></interface>"));
        assert!(content.ends_with("</interfaces></config>"));
    }

    #[test]
    fn test_delete_content_generates_element() {
        let content = interfaces_path().to_edit_content(EditOperation::Delete, None);
        assert!(content.contains("<interface xmlns:nc="));
        assert!(content.contains("nc:operation=\"delete\"/>"));
    }
}
