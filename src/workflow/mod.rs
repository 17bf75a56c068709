//! Workflow Definition Module
//!
//! Provides the document tree, its loading from YAML and the structural
//! checks run while building actions from it.
//!
//! # Structure
//!
//! - [`model`]: document nodes and job definitions
//! - [`parser`]: YAML loading and definition building
//! - [`validator`]: node shapes and parse errors

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{JobDefinition, Node};
pub use parser::{build_definition, load_document, parse_document};
pub use validator::{Arity, NodeShape, ParseError, ParseErrorKind};
