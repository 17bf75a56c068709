//! Node Validation
//!
//! Structural checks factories run before building an action:
//! - required and permitted attributes
//! - number of child elements
//!
//! Failures carry the element, its location and the offending attribute or
//! child so a document author can find the problem.

use std::fmt;

use log::debug;
use thiserror::Error;

use super::model::Node;

/// A structural error found while building actions from a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("<{element}> at {location}: {kind}")]
pub struct ParseError {
    pub element: String,
    pub location: String,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(element: impl Into<String>, location: impl Into<String>, kind: ParseErrorKind) -> Self {
        Self {
            element: element.into(),
            location: location.into(),
            kind,
        }
    }
}

/// What was wrong with a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("unknown element")]
    UnknownElement,
    #[error("missing required attribute '{0}'")]
    MissingAttribute(String),
    #[error("unexpected attribute '{0}'")]
    UnexpectedAttribute(String),
    #[error("invalid value for attribute '{attribute}': {reason}")]
    InvalidAttribute { attribute: String, reason: String },
    #[error("unexpected child <{0}>")]
    UnexpectedChild(String),
    #[error("expected {expected} child element(s), found {found}")]
    ChildCount { expected: Arity, found: usize },
    #[error("duplicate function '{0}'")]
    DuplicateFunction(String),
    #[error("document root must be <workflow>")]
    NotAWorkflow,
}

/// Allowed number of child elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::None => count == 0,
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Between(lo, hi) => (lo..=hi).contains(&count),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Arity::None => write!(f, "no"),
            Arity::Exactly(n) => write!(f, "exactly {}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
            Arity::Between(lo, hi) => write!(f, "{} to {}", lo, hi),
        }
    }
}

/// Expected shape of one element kind.
#[derive(Debug, Clone)]
pub struct NodeShape {
    element: &'static str,
    required: &'static [&'static str],
    optional: &'static [&'static str],
    children: Arity,
}

impl NodeShape {
    /// A shape with no attributes and no children.
    pub fn new(element: &'static str) -> Self {
        Self {
            element,
            required: &[],
            optional: &[],
            children: Arity::None,
        }
    }

    pub fn required(mut self, attributes: &'static [&'static str]) -> Self {
        self.required = attributes;
        self
    }

    pub fn optional(mut self, attributes: &'static [&'static str]) -> Self {
        self.optional = attributes;
        self
    }

    pub fn children(mut self, arity: Arity) -> Self {
        self.children = arity;
        self
    }

    /// Checks a node against this shape.
    pub fn check(&self, node: &Node, location: &str) -> Result<(), ParseError> {
        let fail = |kind| Err(ParseError::new(node.element.clone(), location, kind));

        for attribute in self.required {
            if node.get(attribute).is_none() {
                return fail(ParseErrorKind::MissingAttribute(attribute.to_string()));
            }
        }

        for attribute in node.attributes.keys() {
            let known = self.required.contains(&attribute.as_str())
                || self.optional.contains(&attribute.as_str());
            if !known {
                return fail(ParseErrorKind::UnexpectedAttribute(attribute.clone()));
            }
        }

        if !self.children.accepts(node.children.len()) {
            return fail(ParseErrorKind::ChildCount {
                expected: self.children,
                found: node.children.len(),
            });
        }

        debug!("Validated <{}> at {}", self.element, location);
        Ok(())
    }

    /// Grammar line in DTD form for registry documentation.
    pub fn grammar(&self) -> String {
        let content = match self.children {
            Arity::None => "EMPTY".to_string(),
            Arity::Exactly(1) => "(%action;)".to_string(),
            Arity::Exactly(n) => format!("(%action;){{{}}}", n),
            Arity::AtLeast(0) => "(%action;)*".to_string(),
            Arity::AtLeast(_) => "(%action;)+".to_string(),
            Arity::Between(lo, hi) => format!("(%action;){{{},{}}}", lo, hi),
        };
        let mut output = format!("<!ELEMENT {} {}>", self.element, content);
        if !self.required.is_empty() || !self.optional.is_empty() {
            output.push_str(&format!("\n<!ATTLIST {}", self.element));
            for attribute in self.required {
                output.push_str(&format!("\n  {} CDATA #REQUIRED", attribute));
            }
            for attribute in self.optional {
                output.push_str(&format!("\n  {} CDATA #IMPLIED", attribute));
            }
            output.push('>');
        }
        output
    }
}
