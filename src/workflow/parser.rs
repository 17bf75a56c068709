//! Workflow Parser
//!
//! Loads workflow documents from YAML and builds job definitions from them.
//!
//! A document is a [`Node`] tree whose root element is `workflow`:
//! - `function` children become entries of the function table,
//! - every other child is a top-level action, run in order before the
//!   start function.

use std::error::Error;
use std::fs;
use std::sync::Arc;

use log::{debug, info};

use super::model::{JobDefinition, Node};
use super::validator::{Arity, NodeShape, ParseError, ParseErrorKind};
use crate::action::factory::ParseContext;
use crate::action::function::FunctionAction;

/// Root element of every workflow document.
pub const WORKFLOW_ELEMENT: &str = "workflow";

fn workflow_shape() -> NodeShape {
    NodeShape::new(WORKFLOW_ELEMENT)
        .optional(&["name", "start", "args"])
        .children(Arity::AtLeast(0))
}

/// Parses a document tree from YAML text.
pub fn parse_document(yaml: &str) -> Result<Node, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}

/// Loads a document tree from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use actiontree::workflow::parser::load_document;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_document("nightly.yaml")?;
///     println!("Root element <{}>", document.element);
///     Ok(())
/// }
/// ```
pub fn load_document(path: &str) -> Result<Node, Box<dyn Error>> {
    info!("Loading workflow from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let document = parse_document(&yaml_content)
        .map_err(|e| format!("Failed to parse workflow YAML: {}. Check the file format.", e))?;

    info!(
        "Parsed <{}> with {} top-level elements",
        document.element,
        document.children.len()
    );
    Ok(document)
}

/// Builds a job definition from a `workflow` document.
///
/// Every action is validated and built here, so a definition that comes
/// back can no longer fail structurally at run time.
pub fn build_definition(document: &Node, ctx: &ParseContext<'_>) -> Result<JobDefinition, ParseError> {
    if document.element != WORKFLOW_ELEMENT {
        return Err(ctx.error(document, ParseErrorKind::NotAWorkflow));
    }
    workflow_shape().check(document, &ctx.location(document))?;

    let name = document.get("name").unwrap_or(ctx.document());
    let mut definition = JobDefinition::new(name).with_document(ctx.document(), ctx.machine());

    for child in &document.children {
        if child.element == "function" {
            let function = FunctionAction::parse(child, ctx)?;
            if definition.functions.contains_key(function.name()) {
                return Err(ctx.error(
                    child,
                    ParseErrorKind::DuplicateFunction(function.name().to_string()),
                ));
            }
            definition = definition.with_function(Arc::new(function));
        } else {
            definition = definition.with_action(ctx.build(child)?);
        }
    }

    if let Some(start) = document.get("start") {
        definition = definition.with_start(start, document.get("args").map(str::to_string));
    }

    debug!(
        "Built definition '{}': {} functions, {} top-level actions",
        definition.name,
        definition.functions.len(),
        definition.prologue.len()
    );
    Ok(definition)
}

/// Grammar of the document structure itself.
pub fn document_grammar() -> String {
    format!("{}\n{}", workflow_shape().grammar(), FunctionAction::grammar())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::factory::FactoryRegistry;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const NIGHTLY: &str = r#"
element: workflow
attributes:
  name: nightly
  start: main
  args: "[1, 2]"
children:
  - element: script
    text: "total = 0"
  - element: function
    attributes: { name: main }
    children:
      - element: iterate
        attributes: { var: n, in: ARGS }
        children:
          - element: script
            text: "total = total + n"
  - element: function
    attributes: { name: helper }
    children:
      - element: nop
"#;

    fn build(document: &Node) -> Result<JobDefinition, ParseError> {
        let registry = FactoryRegistry::with_builtins();
        let ctx = ParseContext::new(&registry, "nightly.yaml", "host1");
        build_definition(document, &ctx)
    }

    #[test]
    fn test_build_definition() {
        let document = parse_document(NIGHTLY).unwrap();
        let definition = build(&document).unwrap();

        assert_eq!(definition.name, "nightly");
        assert_eq!(definition.document, "nightly.yaml");
        assert_eq!(definition.machine, "host1");
        assert_eq!(definition.prologue.len(), 1);
        assert_eq!(
            definition.functions.keys().collect::<Vec<_>>(),
            vec!["helper", "main"]
        );
        assert_eq!(definition.start_function.as_deref(), Some("main"));
        assert_eq!(definition.start_args.as_deref(), Some("[1, 2]"));
    }

    #[test]
    fn test_name_defaults_to_document() {
        let definition = build(&Node::new("workflow")).unwrap();
        assert_eq!(definition.name, "nightly.yaml");
        assert!(definition.start_function.is_none());
    }

    #[test]
    fn test_root_must_be_workflow() {
        let err = build(&Node::new("sequence")).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NotAWorkflow);
    }

    #[test]
    fn test_duplicate_function() {
        let function = || Node::new("function").attr("name", "main").child(Node::new("nop"));
        let document = Node::new("workflow").child(function()).child(function());
        let err = build(&document).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::DuplicateFunction("main".to_string()));
    }

    #[test]
    fn test_nested_error_is_reported() {
        let document = Node::new("workflow").child(
            Node::new("sequence").child(Node::new("loop").attr("var", "i").at_line(9)),
        );
        let err = build(&document).unwrap_err();
        assert_eq!(err.element, "loop");
        assert_eq!(err.location, "nightly.yaml:9");
        assert!(matches!(err.kind, ParseErrorKind::ChildCount { .. }));
    }

    #[test]
    fn test_unknown_workflow_attribute() {
        let document = Node::new("workflow").attr("owner", "ops");
        let err = build(&document).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedAttribute("owner".to_string()));
    }

    #[test]
    fn test_load_document() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(NIGHTLY.as_bytes()).unwrap();
        let document = load_document(file.path().to_str().unwrap()).unwrap();
        assert_eq!(document.element, "workflow");
        assert_eq!(document.children.len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_document("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read workflow file"));
    }

    #[test]
    fn test_load_malformed_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"element: [unclosed").unwrap();
        let err = load_document(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse workflow YAML"));
    }

    #[test]
    fn test_document_grammar() {
        let grammar = document_grammar();
        assert!(grammar.contains("<!ELEMENT workflow (%action;)*>"));
        assert!(grammar.contains("<!ELEMENT function (%action;)>"));
    }
}
