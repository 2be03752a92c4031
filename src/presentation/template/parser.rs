//! Template compilation.
//!
//! Recognized syntax:
//!
//! - `{{ path.to.value }}` prints an HTML-escaped value
//! - `{% for item in path %}…{% endfor %}`
//! - `{% if path %}…{% else %}…{% endif %}`
//! - `{% cache key[, timeout] %}…{% endcache %}`, also spelled
//!   `{% matryoshka … %}…{% endmatryoshka %}`
//!
//! A cache block's key is a path, a quoted string or `none`; its timeout is
//! a whole number of seconds or a path. The raw text between the block's
//! tags is fingerprinted here, once, so editing a block's source moves its
//! cached renders to a new key.

use crate::cache::FragmentSite;

use super::TemplateError;

const CACHE_TAGS: [&str; 2] = ["cache", "matryoshka"];
const CACHE_END_TAGS: [&str; 2] = ["endcache", "endmatryoshka"];

/// Dotted lookup path such as `post.title`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub(super) fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("expected a variable path".to_string());
        }

        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        let valid = segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
        if !valid {
            return Err(format!("invalid variable path `{raw}`"));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExpr {
    Path(Path),
    Literal(String),
    /// Explicit `none`: the block always renders uncached.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutExpr {
    Seconds(u64),
    Path(Path),
}

#[derive(Debug, Clone)]
pub struct CacheBlock {
    pub key: KeyExpr,
    pub timeout: Option<TimeoutExpr>,
    pub site: FragmentSite,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Text(String),
    Output(Path),
    For {
        binding: String,
        source: Path,
        body: Vec<Node>,
    },
    If {
        condition: Path,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Cache(CacheBlock),
}

#[derive(Debug, Clone, Copy)]
enum Token<'s> {
    Text(&'s str),
    Output {
        expr: &'s str,
        line: usize,
    },
    Tag {
        body: &'s str,
        line: usize,
        start: usize,
        end: usize,
    },
}

/// A closing tag that ended a nested block.
struct Closing<'s> {
    name: &'s str,
    start: usize,
}

pub(super) fn compile(location: &str, source: &str) -> Result<Vec<Node>, TemplateError> {
    let tokens = tokenize(location, source)?;
    let mut parser = Parser {
        location,
        source,
        tokens,
        pos: 0,
    };
    let (nodes, closing) = parser.parse_nodes(&[])?;
    match closing {
        None => Ok(nodes),
        Some(closing) => Err(parser.error_at(
            closing.start,
            format!("unexpected `{}`", closing.name),
        )),
    }
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn tokenize<'s>(location: &str, source: &'s str) -> Result<Vec<Token<'s>>, TemplateError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let open = rest.find("{{").into_iter().chain(rest.find("{%")).min();

        let Some(relative) = open else {
            tokens.push(Token::Text(rest));
            break;
        };

        if relative > 0 {
            tokens.push(Token::Text(&rest[..relative]));
        }

        let start = pos + relative;
        let is_tag = source[start..].starts_with("{%");
        let close = if is_tag { "%}" } else { "}}" };
        let inner_start = start + 2;
        let line = line_of(source, start);

        let Some(inner_len) = source[inner_start..].find(close) else {
            return Err(TemplateError::syntax(
                location,
                format!("line {line}: unclosed `{}`", &source[start..inner_start]),
            ));
        };

        let inner = &source[inner_start..inner_start + inner_len];
        let end = inner_start + inner_len + close.len();
        tokens.push(if is_tag {
            Token::Tag {
                body: inner.trim(),
                line,
                start,
                end,
            }
        } else {
            Token::Output {
                expr: inner,
                line,
            }
        });
        pos = end;
    }

    Ok(tokens)
}

struct Parser<'s> {
    location: &'s str,
    source: &'s str,
    tokens: Vec<Token<'s>>,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn error(&self, line: usize, message: impl std::fmt::Display) -> TemplateError {
        TemplateError::syntax(self.location, format!("line {line}: {message}"))
    }

    fn error_at(&self, offset: usize, message: impl std::fmt::Display) -> TemplateError {
        self.error(line_of(self.source, offset), message)
    }

    /// Parse until one of `ends` (or end of input when `ends` is empty).
    ///
    /// Any closing tag not in `ends` is handed back to the caller, which
    /// reports it as unexpected.
    fn parse_nodes(
        &mut self,
        ends: &[&str],
    ) -> Result<(Vec<Node>, Option<Closing<'s>>), TemplateError> {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.get(self.pos).copied() {
            self.pos += 1;
            match token {
                Token::Text(text) => nodes.push(Node::Text(text.to_string())),
                Token::Output { expr, line } => {
                    let path = Path::parse(expr).map_err(|message| self.error(line, message))?;
                    nodes.push(Node::Output(path));
                }
                Token::Tag {
                    body,
                    line,
                    start,
                    end,
                } => {
                    let (name, args) = split_tag(body);
                    if is_closing(name) {
                        if ends.is_empty() || ends.contains(&name) {
                            return Ok((nodes, Some(Closing { name, start })));
                        }
                        return Err(self.error(
                            line,
                            format!("unexpected `{name}`, expected `{}`", ends.join("` or `")),
                        ));
                    }
                    nodes.push(self.parse_tag(name, args, line, end)?);
                }
            }
        }

        if ends.is_empty() {
            Ok((nodes, None))
        } else {
            Err(self.error(
                line_of(self.source, self.source.len()),
                format!("missing `{}`", ends.join("` or `")),
            ))
        }
    }

    fn parse_until(&mut self, ends: &[&str]) -> Result<(Vec<Node>, Closing<'s>), TemplateError> {
        match self.parse_nodes(ends)? {
            (nodes, Some(closing)) => Ok((nodes, closing)),
            (_, None) => Err(self.error(
                line_of(self.source, self.source.len()),
                format!("missing `{}`", ends.join("` or `")),
            )),
        }
    }

    fn parse_tag(
        &mut self,
        name: &str,
        args: &str,
        line: usize,
        body_start: usize,
    ) -> Result<Node, TemplateError> {
        match name {
            "for" => {
                let (binding, source) =
                    parse_for_args(args).map_err(|message| self.error(line, message))?;
                let (body, _) = self.parse_until(&["endfor"])?;
                Ok(Node::For {
                    binding,
                    source,
                    body,
                })
            }
            "if" => {
                let condition = Path::parse(args).map_err(|message| self.error(line, message))?;
                let (then, closing) = self.parse_until(&["else", "endif"])?;
                let otherwise = if closing.name == "else" {
                    self.parse_until(&["endif"])?.0
                } else {
                    Vec::new()
                };
                Ok(Node::If {
                    condition,
                    then,
                    otherwise,
                })
            }
            name if CACHE_TAGS.contains(&name) => {
                let (key, timeout) =
                    parse_cache_args(args).map_err(|message| self.error(line, message))?;
                let (body, closing) = self.parse_until(&CACHE_END_TAGS)?;
                let raw_body = &self.source[body_start..closing.start];
                Ok(Node::Cache(CacheBlock {
                    key,
                    timeout,
                    site: FragmentSite::for_source(raw_body, self.location),
                    body,
                }))
            }
            other => Err(self.error(line, format!("unknown tag `{other}`"))),
        }
    }
}

fn split_tag(body: &str) -> (&str, &str) {
    match body.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (body, ""),
    }
}

fn is_closing(name: &str) -> bool {
    matches!(name, "else" | "endif" | "endfor") || CACHE_END_TAGS.contains(&name)
}

fn parse_for_args(args: &str) -> Result<(String, Path), String> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    match parts.as_slice() {
        [binding, "in", source] => {
            let binding_path = Path::parse(binding)?;
            if binding_path.segments().len() != 1 {
                return Err(format!("loop variable `{binding}` must be a plain name"));
            }
            Ok((binding.to_string(), Path::parse(source)?))
        }
        _ => Err("expected `for <name> in <path>`".to_string()),
    }
}

fn parse_cache_args(args: &str) -> Result<(KeyExpr, Option<TimeoutExpr>), String> {
    let (key, timeout) = split_top_level_comma(args)?;

    let key = parse_key_expr(key)?;
    let timeout = match timeout.map(str::trim) {
        None => None,
        Some("") => return Err("expected a timeout after `,`".to_string()),
        Some(raw) if raw.eq_ignore_ascii_case("none") => None,
        Some(raw) if raw.chars().all(|c| c.is_ascii_digit()) => Some(TimeoutExpr::Seconds(
            raw.parse()
                .map_err(|err| format!("invalid timeout `{raw}`: {err}"))?,
        )),
        Some(raw) => Some(TimeoutExpr::Path(Path::parse(raw)?)),
    };

    Ok((key, timeout))
}

fn parse_key_expr(raw: &str) -> Result<KeyExpr, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("expected a cache key".to_string());
    }
    if raw.eq_ignore_ascii_case("none") {
        return Ok(KeyExpr::None);
    }

    let quote = raw.chars().next().filter(|c| *c == '"' || *c == '\'');
    if let Some(quote) = quote {
        let inner = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
            .filter(|inner| !inner.contains(quote))
            .ok_or_else(|| format!("unterminated string `{raw}`"))?;
        return Ok(KeyExpr::Literal(inner.to_string()));
    }

    Ok(KeyExpr::Path(Path::parse(raw)?))
}

/// Split on the first comma that is not inside a quoted string.
fn split_top_level_comma(args: &str) -> Result<(&str, Option<&str>), String> {
    let mut quote: Option<char> = None;
    for (index, c) in args.char_indices() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ',') => {
                let (key, rest) = args.split_at(index);
                let timeout = &rest[1..];
                if timeout.contains(',') {
                    return Err("cache takes at most two arguments".to_string());
                }
                return Ok((key, Some(timeout)));
            }
            (None, _) => {}
        }
    }
    Ok((args, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentFingerprint;

    fn cache_blocks(nodes: &[Node]) -> Vec<&CacheBlock> {
        let mut out = Vec::new();
        for node in nodes {
            match node {
                Node::Cache(block) => {
                    out.push(block);
                    out.extend(cache_blocks(&block.body));
                }
                Node::For { body, .. } => out.extend(cache_blocks(body)),
                Node::If {
                    then, otherwise, ..
                } => {
                    out.extend(cache_blocks(then));
                    out.extend(cache_blocks(otherwise));
                }
                _ => {}
            }
        }
        out
    }

    #[test]
    fn fingerprints_raw_block_body() {
        let source = "<ul>{% cache blog.cache_key %}<li>{{ blog.name }}</li>{% endcache %}</ul>";
        let nodes = compile("index.html", source).unwrap();
        let blocks = cache_blocks(&nodes);

        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0].site.fingerprint(),
            &ContentFingerprint::of("<li>{{ blog.name }}</li>")
        );
        assert_eq!(blocks[0].site.location(), "index.html");
        assert!(matches!(blocks[0].key, KeyExpr::Path(_)));
        assert_eq!(blocks[0].timeout, None);
    }

    #[test]
    fn nested_blocks_fingerprint_independently() {
        let source = "{% cache a %}outer{% matryoshka b, 60 %}inner{% endmatryoshka %}{% endcache %}";
        let nodes = compile("t.html", source).unwrap();
        let blocks = cache_blocks(&nodes);

        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0].site.fingerprint(),
            &ContentFingerprint::of("outer{% matryoshka b, 60 %}inner{% endmatryoshka %}")
        );
        assert_eq!(blocks[1].site.fingerprint(), &ContentFingerprint::of("inner"));
        assert_eq!(blocks[1].timeout, Some(TimeoutExpr::Seconds(60)));
    }

    #[test]
    fn key_expressions() {
        assert_eq!(parse_key_expr("none").unwrap(), KeyExpr::None);
        assert_eq!(
            parse_key_expr("'sidebar'").unwrap(),
            KeyExpr::Literal("sidebar".into())
        );
        assert_eq!(
            parse_key_expr("\"a,b\"").unwrap(),
            KeyExpr::Literal("a,b".into())
        );
        assert!(parse_key_expr("'open").is_err());
        assert!(parse_key_expr("post..title").is_err());
    }

    #[test]
    fn cache_args_split_outside_quotes() {
        let (key, timeout) = parse_cache_args("'a,b', ttl").unwrap();
        assert_eq!(key, KeyExpr::Literal("a,b".into()));
        assert!(matches!(timeout, Some(TimeoutExpr::Path(_))));
        assert!(parse_cache_args("a, 1, 2").is_err());
        assert!(parse_cache_args("a,").is_err());
    }

    #[test]
    fn if_else_and_for_parse() {
        let nodes = compile(
            "t.html",
            "{% for post in posts %}{% if post.title %}{{ post.title }}{% else %}-{% endif %}{% endfor %}",
        )
        .unwrap();

        match &nodes[..] {
            [Node::For { binding, body, .. }] => {
                assert_eq!(binding, "post");
                assert!(matches!(&body[..], [Node::If { otherwise, .. }] if otherwise.len() == 1));
            }
            other => panic!("unexpected nodes: {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_name_location_and_line() {
        let err = compile("index.html", "a\n{% cache x %}\nbody").unwrap_err();
        match err {
            TemplateError::Syntax { location, message } => {
                assert_eq!(location, "index.html");
                assert!(message.contains("missing `endcache`"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = compile("index.html", "x\n{% endif %}").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");

        let err = compile("index.html", "{% for x in xs %}{% endif %}").unwrap_err();
        assert!(err.to_string().contains("unexpected `endif`"), "{err}");

        assert!(compile("index.html", "{{ unclosed").is_err());
        assert!(compile("index.html", "{% include 'x' %}").is_err());
    }
}
