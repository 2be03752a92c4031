//! Minimal templates hosting nested fragment cache blocks.

mod parser;
mod render;

pub use parser::{CacheBlock, KeyExpr, Node, Path, TimeoutExpr};

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::cache::{FragmentCache, FragmentSite};

use render::Renderer;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template syntax error in {location}: {message}")]
    Syntax { location: String, message: String },
    #[error("template render error in {location}: {message}")]
    Render { location: String, message: String },
    #[error("template `{0}` is not registered")]
    NotFound(String),
}

impl TemplateError {
    fn syntax(location: &str, message: impl Into<String>) -> Self {
        Self::Syntax {
            location: location.to_string(),
            message: message.into(),
        }
    }
}

/// A compiled template. Fragment fingerprints are fixed at compile time.
#[derive(Debug, Clone)]
pub struct Template {
    location: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn compile(location: impl Into<String>, source: &str) -> Result<Self, TemplateError> {
        let location = location.into();
        let nodes = parser::compile(&location, source)?;
        Ok(Self { location, nodes })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Every cache block in document order, outer blocks before the ones they contain.
    pub fn fragment_sites(&self) -> Vec<&FragmentSite> {
        let mut sites = Vec::new();
        collect_sites(&self.nodes, &mut sites);
        sites
    }

    pub async fn render(
        &self,
        cache: &FragmentCache,
        context: &Value,
    ) -> Result<String, TemplateError> {
        Renderer {
            location: &self.location,
            cache,
        }
        .render(&self.nodes, context)
        .await
    }
}

fn collect_sites<'a>(nodes: &'a [Node], sites: &mut Vec<&'a FragmentSite>) {
    for node in nodes {
        match node {
            Node::Cache(block) => {
                sites.push(&block.site);
                collect_sites(&block.body, sites);
            }
            Node::For { body, .. } => collect_sites(body, sites),
            Node::If {
                then, otherwise, ..
            } => {
                collect_sites(then, sites);
                collect_sites(otherwise, sites);
            }
            Node::Text(_) | Node::Output(_) => {}
        }
    }
}

/// Templates registered by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, Template>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `source` and register it under `name`, which also serves as
    /// the fragment location of its cache blocks.
    pub fn add(&mut self, name: &str, source: &str) -> Result<(), TemplateError> {
        let template = Template::compile(name, source)?;
        self.templates.insert(name.to_string(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Template, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    pub async fn render(
        &self,
        name: &str,
        cache: &FragmentCache,
        context: &Value,
    ) -> Result<String, TemplateError> {
        self.get(name)?.render(cache, context).await
    }
}
