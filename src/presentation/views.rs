use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;

use crate::application::{blog::BlogPage, error::HttpError};
use crate::cache::{FragmentCache, FreshnessToken};
use crate::domain::entity::Entity;
use crate::presentation::template::{TemplateError, TemplateSet};

pub const INDEX_TEMPLATE: &str = "templates/index.html";

/// Templates compiled into the binary. Each is registered under its path
/// relative to the crate root.
pub fn builtin_templates() -> Result<TemplateSet, TemplateError> {
    let mut templates = TemplateSet::new();
    templates.add(INDEX_TEMPLATE, include_str!("../../templates/index.html"))?;
    Ok(templates)
}

/// Flatten an entity into a template context: its fields plus `key`,
/// `kind`, `updated_at` and the `cache_key` fragment blocks use.
pub fn entity_context(entity: &Entity) -> Value {
    let mut map: Map<String, Value> = entity
        .fields()
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();

    map.insert("key".into(), Value::String(entity.key().urlsafe()));
    map.insert("kind".into(), Value::String(entity.kind().to_string()));
    map.insert(
        "updated_at".into(),
        Value::String(entity.updated_at().format(&Rfc3339).unwrap_or_default()),
    );
    map.insert(
        "cache_key".into(),
        Value::String(FreshnessToken::compute(entity).into_string()),
    );
    Value::Object(map)
}

/// Context for the index page. `blog` is null until the blog exists; its
/// posts are nested under `blog.posts`.
pub fn index_context(blog_name: &str, page: Option<&BlogPage>) -> Value {
    let blog = match page {
        Some(page) => {
            let mut blog = entity_context(&page.blog);
            blog["posts"] = Value::Array(page.posts.iter().map(entity_context).collect());
            blog
        }
        None => Value::Null,
    };

    let mut context = Map::new();
    context.insert("blog_name".into(), Value::String(blog_name.to_string()));
    context.insert("blog".into(), blog);
    Value::Object(context)
}

impl From<TemplateError> for HttpError {
    fn from(err: TemplateError) -> Self {
        let status = match err {
            TemplateError::NotFound(_) => StatusCode::NOT_FOUND,
            TemplateError::Syntax { .. } | TemplateError::Render { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        HttpError::from_error(
            "presentation::views::render_page",
            status,
            "Template rendering failed",
            &err,
        )
    }
}

pub async fn render_page(
    templates: &TemplateSet,
    cache: &FragmentCache,
    name: &str,
    context: &Value,
) -> Result<Html<String>, HttpError> {
    templates
        .render(name, cache, context)
        .await
        .map(Html)
        .map_err(HttpError::from)
}

pub async fn render_page_response(
    templates: &TemplateSet,
    cache: &FragmentCache,
    name: &str,
    context: &Value,
) -> Response {
    match render_page(templates, cache, name, context).await {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}
