//! Workflow Data Model
//!
//! The generic node tree documents are parsed into, and the job definition
//! built from it.
//!
//! # Example YAML Format
//!
//! ```yaml
//! element: workflow
//! attributes:
//!   name: nightly
//!   start: main
//! children:
//!   - element: function
//!     attributes: { name: main }
//!     children:
//!       - element: loop
//!         attributes: { var: i, from: 1, to: 3 }
//!         children:
//!           - element: script
//!             text: "total = i * 2"
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::action::function::FunctionAction;
use crate::action::Action;

/// One element of a parsed document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// Element name, used to pick a factory
    pub element: String,

    /// Attribute values; expressions stay unevaluated text
    #[serde(
        default,
        alias = "attrs",
        deserialize_with = "scalar_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attributes: BTreeMap<String, String>,

    /// Text body, e.g. script source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Child elements in document order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,

    /// Line of the element in its document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Accepts any YAML scalar as an attribute value.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => {
                    return Err(de::Error::custom(format!(
                        "attribute '{}' must be a scalar value",
                        name
                    )))
                }
            };
            Ok((name, text))
        })
        .collect()
}

impl Node {
    pub fn new(element: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Attribute value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Children with the given element name.
    pub fn children_named<'a>(&'a self, element: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.element == element)
    }
}

/// Everything needed to start a job.
#[derive(Debug, Clone, Default)]
pub struct JobDefinition {
    /// Display name of the job
    pub name: String,
    /// Identifier of the defining document
    pub document: String,
    /// Machine the document came from
    pub machine: String,
    /// Function table, by name
    pub functions: BTreeMap<String, Arc<FunctionAction>>,
    /// Function called after the prologue, if any
    pub start_function: Option<String>,
    /// Argument expression passed to the start function
    pub start_args: Option<String>,
    /// Top-level actions run before the start function
    pub prologue: Vec<Arc<dyn Action>>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A job whose whole tree is a single action.
    pub fn from_action(name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self::new(name).with_action(action)
    }

    pub fn with_action(mut self, action: Arc<dyn Action>) -> Self {
        self.prologue.push(action);
        self
    }

    pub fn with_function(mut self, function: Arc<FunctionAction>) -> Self {
        self.functions.insert(function.name().to_string(), function);
        self
    }

    pub fn with_start(mut self, function: impl Into<String>, args: Option<String>) -> Self {
        self.start_function = Some(function.into());
        self.start_args = args;
        self
    }

    pub fn with_document(mut self, document: impl Into<String>, machine: impl Into<String>) -> Self {
        self.document = document.into();
        self.machine = machine.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = Node::new("loop")
            .attr("var", "i")
            .child(Node::new("nop"))
            .at_line(4);
        assert_eq!(node.get("var"), Some("i"));
        assert_eq!(node.get("missing"), None);
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.line, Some(4));
    }

    #[test]
    fn test_node_from_yaml_with_scalars() {
        let yaml = r#"
element: loop
attrs:
  var: i
  from: 1
  to: 2.5
  flag: true
children:
  - element: script
    text: "x = i"
"#;
        let node: Node = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.get("from"), Some("1"));
        assert_eq!(node.get("to"), Some("2.5"));
        assert_eq!(node.get("flag"), Some("true"));
        assert_eq!(node.children[0].text.as_deref(), Some("x = i"));
    }

    #[test]
    fn test_node_rejects_nested_attribute() {
        let yaml = "element: loop\nattributes:\n  var: [1, 2]\n";
        let result: Result<Node, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_children_named() {
        let node = Node::new("try")
            .child(Node::new("nop"))
            .child(Node::new("catch"))
            .child(Node::new("catch"));
        assert_eq!(node.children_named("catch").count(), 2);
    }

    #[test]
    fn test_definition_builder() {
        let def = JobDefinition::new("job").with_start("main", Some("[1]".into()));
        assert_eq!(def.start_function.as_deref(), Some("main"));
        assert_eq!(def.start_args.as_deref(), Some("[1]"));
        assert!(def.prologue.is_empty());
    }
}
