//! Action Factories
//!
//! A factory turns one parsed [`Node`] into an action template. Factories are
//! registered by element name in a [`FactoryRegistry`]; composite factories
//! build their children through the same registry via [`ParseContext`], so
//! externally supplied factories plug into the tree like built-ins.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use super::{basic, block, branch, flow, timer, Action, ActionMeta};
use crate::workflow::model::Node;
use crate::workflow::validator::{ParseError, ParseErrorKind};

/// Builds action templates for one element name.
pub trait ActionFactory: Send + Sync {
    /// Element name this factory is registered under.
    fn element(&self) -> &str;

    /// Grammar summary used for combined documentation.
    fn grammar(&self) -> String;

    /// Validates the node and builds a template.
    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError>;
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a factory for <{0}> is already registered")]
    Duplicate(String),
}

/// Element name to factory map.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: BTreeMap<String, Arc<dyn ActionFactory>>,
}

impl FactoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in action.
    pub fn with_builtins() -> Self {
        let builtins: Vec<Arc<dyn ActionFactory>> = vec![
            Arc::new(basic::NopFactory),
            Arc::new(basic::BreakFactory),
            Arc::new(basic::ContinueFactory),
            Arc::new(basic::ReturnFactory),
            Arc::new(basic::ThrowFactory),
            Arc::new(basic::RethrowFactory),
            Arc::new(basic::ScriptFactory),
            Arc::new(basic::RaiseFactory),
            Arc::new(basic::SignalHandlerFactory),
            Arc::new(flow::SequenceFactory),
            Arc::new(flow::IfFactory),
            Arc::new(flow::LoopFactory),
            Arc::new(flow::IterateFactory),
            Arc::new(flow::TryFactory),
            Arc::new(branch::ParallelFactory),
            Arc::new(branch::ParallelIterateFactory),
            Arc::new(super::function::CallFactory),
            Arc::new(timer::TimerFactory),
            Arc::new(timer::DelayFactory),
            Arc::new(block::BlockFactory),
            Arc::new(block::BlockControlFactory::new(block::BlockOp::Hold)),
            Arc::new(block::BlockControlFactory::new(block::BlockOp::Release)),
            Arc::new(block::BlockControlFactory::new(block::BlockOp::Terminate)),
        ];

        let mut registry = Self::new();
        for factory in builtins {
            registry
                .factories
                .insert(factory.element().to_string(), factory);
        }
        registry
    }

    /// Registers a factory under its element name.
    pub fn register(&mut self, factory: Arc<dyn ActionFactory>) -> Result<(), RegistryError> {
        let element = factory.element().to_string();
        if self.factories.contains_key(&element) {
            return Err(RegistryError::Duplicate(element));
        }
        debug!("Registered factory for <{}>", element);
        self.factories.insert(element, factory);
        Ok(())
    }

    pub fn get(&self, element: &str) -> Option<&Arc<dyn ActionFactory>> {
        self.factories.get(element)
    }

    /// Registered element names in sorted order.
    pub fn elements(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Combined grammar documentation of every registered element.
    pub fn grammar(&self) -> String {
        let mut output = String::new();
        for factory in self.factories.values() {
            output.push_str(&factory.grammar());
            output.push('\n');
        }
        output
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("elements", &self.elements())
            .finish()
    }
}

/// Context handed to factories while a document is being built.
pub struct ParseContext<'a> {
    registry: &'a FactoryRegistry,
    document: String,
    machine: String,
}

impl<'a> ParseContext<'a> {
    pub fn new(registry: &'a FactoryRegistry, document: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            registry,
            document: document.into(),
            machine: machine.into(),
        }
    }

    pub fn registry(&self) -> &FactoryRegistry {
        self.registry
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Static metadata for an action built from `node`.
    pub fn meta(&self, node: &Node) -> Arc<ActionMeta> {
        Arc::new(
            ActionMeta::new(node.element.clone())
                .with_document(self.document.clone(), self.machine.clone())
                .with_line(node.line),
        )
    }

    /// Human readable location of a node.
    pub fn location(&self, node: &Node) -> String {
        match node.line {
            Some(line) => format!("{}:{}", self.document, line),
            None => self.document.clone(),
        }
    }

    pub fn error(&self, node: &Node, kind: ParseErrorKind) -> ParseError {
        ParseError::new(node.element.clone(), self.location(node), kind)
    }

    /// Builds a child node through the registry.
    pub fn build(&self, node: &Node) -> Result<Arc<dyn Action>, ParseError> {
        let factory = self
            .registry
            .get(&node.element)
            .ok_or_else(|| self.error(node, ParseErrorKind::UnknownElement))?;
        factory.build(node, self)
    }

    pub fn build_all(&self, nodes: &[Node]) -> Result<Vec<Arc<dyn Action>>, ParseError> {
        nodes.iter().map(|n| self.build(n)).collect()
    }

    /// Value of a required attribute.
    pub fn required(&self, node: &Node, attribute: &str) -> Result<String, ParseError> {
        node.get(attribute)
            .map(str::to_string)
            .ok_or_else(|| self.error(node, ParseErrorKind::MissingAttribute(attribute.to_string())))
    }
}
