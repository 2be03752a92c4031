//! Async template rendering.
//!
//! Cache blocks hand their body to [`FragmentCache::cached_render`] as the
//! render closure, so a miss on an outer block re-renders it while any inner
//! block whose key did not change is still served from the cache.

use std::fmt::Write as _;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::cache::FragmentCache;

use super::TemplateError;
use super::parser::{CacheBlock, KeyExpr, Node, Path, TimeoutExpr};

/// Variables visible at one point of a render. Loop bindings shadow outer
/// scopes and the root context.
#[derive(Clone, Copy)]
struct Scope<'a> {
    root: &'a Value,
    binding: Option<(&'a str, &'a Value)>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn root(root: &'a Value) -> Self {
        Self {
            root,
            binding: None,
            parent: None,
        }
    }

    fn lookup_name(&self, name: &str) -> Option<&'a Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some((bound, value)) = current.binding {
                if bound == name {
                    return Some(value);
                }
            }
            scope = current.parent;
        }
        self.root.get(name)
    }

    fn lookup(&self, path: &Path) -> Option<&'a Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut value = self.lookup_name(first)?;
        for segment in rest {
            value = match value {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }
}

pub(super) struct Renderer<'r> {
    pub(super) location: &'r str,
    pub(super) cache: &'r FragmentCache,
}

impl<'r> Renderer<'r> {
    pub(super) async fn render(
        &self,
        nodes: &[Node],
        context: &Value,
    ) -> Result<String, TemplateError> {
        self.render_nodes(nodes, Scope::root(context)).await
    }

    fn render_nodes<'a>(
        &'a self,
        nodes: &'a [Node],
        scope: Scope<'a>,
    ) -> BoxFuture<'a, Result<String, TemplateError>> {
        async move {
            let mut out = String::new();
            for node in nodes {
                match node {
                    Node::Text(text) => out.push_str(text),
                    Node::Output(path) => write_value(&mut out, scope.lookup(path)),
                    Node::If {
                        condition,
                        then,
                        otherwise,
                    } => {
                        let branch = if is_truthy(scope.lookup(condition)) {
                            then
                        } else {
                            otherwise
                        };
                        out.push_str(&self.render_nodes(branch, scope).await?);
                    }
                    Node::For {
                        binding,
                        source,
                        body,
                    } => {
                        let items = match scope.lookup(source) {
                            None | Some(Value::Null) => continue,
                            Some(Value::Array(items)) => items,
                            Some(_) => {
                                return Err(self.error(format!(
                                    "`{}` is not a list",
                                    source.segments().join(".")
                                )));
                            }
                        };
                        for item in items {
                            let inner = Scope {
                                root: scope.root,
                                binding: Some((binding.as_str(), item)),
                                parent: Some(&scope),
                            };
                            out.push_str(&self.render_nodes(body, inner).await?);
                        }
                    }
                    Node::Cache(block) => out.push_str(&self.render_cache(block, scope).await?),
                }
            }
            Ok(out)
        }
        .boxed()
    }

    async fn render_cache<'a>(
        &'a self,
        block: &'a CacheBlock,
        scope: Scope<'a>,
    ) -> Result<String, TemplateError> {
        let key = match &block.key {
            KeyExpr::None => None,
            KeyExpr::Literal(literal) => Some(literal.clone()),
            KeyExpr::Path(path) => key_string(scope.lookup(path)),
        };
        let timeout = self.resolve_timeout(block.timeout.as_ref(), scope)?;

        self.cache
            .cached_render(key.as_deref(), timeout, &block.site, || {
                self.render_nodes(&block.body, scope)
            })
            .await
    }

    fn resolve_timeout(
        &self,
        timeout: Option<&TimeoutExpr>,
        scope: Scope<'_>,
    ) -> Result<Option<Duration>, TemplateError> {
        match timeout {
            None => Ok(None),
            Some(TimeoutExpr::Seconds(seconds)) => Ok(Some(Duration::from_secs(*seconds))),
            Some(TimeoutExpr::Path(path)) => match scope.lookup(path) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Number(number)) => number
                    .as_u64()
                    .map(|seconds| Some(Duration::from_secs(seconds)))
                    .ok_or_else(|| {
                        self.error(format!("cache timeout `{number}` is not a whole number of seconds"))
                    }),
                Some(other) => Err(self.error(format!("cache timeout `{other}` is not a number"))),
            },
        }
    }

    fn error(&self, message: String) -> TemplateError {
        TemplateError::Render {
            location: self.location.to_string(),
            message,
        }
    }
}

/// Falsy values (missing, null, false, zero, empty) mean "do not cache".
fn key_string(value: Option<&Value>) -> Option<String> {
    let value = value.filter(|value| is_truthy(Some(*value)))?;
    Some(match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

fn write_value(out: &mut String, value: Option<&Value>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => escape_into(out, text),
        Some(Value::Bool(flag)) => {
            let _ = write!(out, "{flag}");
        }
        Some(Value::Number(number)) => {
            let _ = write!(out, "{number}");
        }
        Some(other) => escape_into(out, &other.to_string()),
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn escapes_html() {
        let mut out = String::new();
        write_value(&mut out, Some(&json!("<a href=\"x\">Tom & 'Jerry'</a>")));
        assert_eq!(
            out,
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#x27;Jerry&#x27;&lt;/a&gt;"
        );
    }

    #[test]
    fn falsy_keys_bypass() {
        assert_eq!(key_string(None), None);
        assert_eq!(key_string(Some(&json!(null))), None);
        assert_eq!(key_string(Some(&json!(false))), None);
        assert_eq!(key_string(Some(&json!(""))), None);
        assert_eq!(key_string(Some(&json!(0))), None);
        assert_eq!(key_string(Some(&json!("k"))), Some("k".into()));
        assert_eq!(key_string(Some(&json!(7))), Some("7".into()));
    }

    #[test]
    fn loop_bindings_shadow_root() {
        let root = json!({ "name": "root", "items": [{ "name": "inner" }] });
        let scope = Scope::root(&root);
        let item = &root["items"][0];
        let inner = Scope {
            root: &root,
            binding: Some(("name", item)),
            parent: Some(&scope),
        };

        let path = Path::parse("name.name").unwrap();
        assert_eq!(inner.lookup(&path), Some(&json!("inner")));
        assert_eq!(
            scope.lookup(&Path::parse("items.0.name").unwrap()),
            Some(&json!("inner"))
        );
    }
}
