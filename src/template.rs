// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Expression templates used by configuration values.
//!
//! Templates are plain text with embedded actions:
//!
//! ```text
//! bifroest-{{ .session.id }}
//! {{ .user.homeDir }}/.ssh/authorized_keys
//! {{ env "DOCKER_HOST" | default "unix:///var/run/docker.sock" }}
//! {{ eq .authorization.user.name "root" | not }}
//! ```
//!
//! An action is a pipeline of commands separated by `|`; the result of each
//! command is appended as the last argument of the next one. Field paths
//! (`.a.b`) are looked up in a [`RenderContext`], which is a materialised
//! value tree built from a serializable view struct right before rendering.
//!
//! Functions: `env`, `default`, `eq`, `ne`, `not`, `file`, `lower`, `upper`,
//! `trim`.
//!
//! Evaluation never panics; every failure is an [`Error`] of kind
//! [`ErrorKind::Config`](crate::shared::error::ErrorKind::Config).

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::shared::error::{Error, ErrorKind, Result};

/// Materialised values a template is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    root: Value,
}

impl RenderContext {
    /// Build a context from any serializable view.
    pub fn of<T: Serialize + ?Sized>(view: &T) -> Result<Self> {
        let root = serde_json::to_value(view)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot build render context", e))?;
        Ok(Self { root })
    }

    pub fn empty() -> Self {
        Self {
            root: Value::Object(Default::default()),
        }
    }

    /// Add (or replace) a top level field.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        if !self.root.is_object() {
            self.root = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.root {
            map.insert(key.to_string(), value);
        }
        self
    }

    fn lookup(&self, path: &[String]) -> Value {
        let mut current = &self.root;
        for segment in path {
            match current {
                Value::Object(map) => match map.get(segment) {
                    Some(v) => current = v,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            }
        }
        current.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Field(Vec<String>),
    Literal(Value),
    Func(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Command {
    terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Action(Vec<Command>),
}

/// A parsed template.
#[derive(Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| {
                    Error::config(format!("unterminated action in template {source:?}"))
                })?;
            let body = after[..end].trim_start_matches('-').trim_end_matches('-');
            segments.push(Segment::Action(parse_pipeline(body, source)?));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// A template which renders exactly `text`.
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Text(text.clone())]
        };
        Self {
            source: text,
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render to a string.
    pub fn render(&self, ctx: &RenderContext) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, ctx)
                        .map_err(|e| {
                            e.context(format!("cannot render template {:?}", self.source))
                        })?;
                    out.push_str(&value_to_string(&value));
                }
            }
        }
        Ok(out)
    }

    /// Render a template consisting of exactly one action to its raw value.
    fn render_value(&self, ctx: &RenderContext) -> Result<Value> {
        if let [Segment::Action(pipeline)] = self.segments.as_slice() {
            return eval_pipeline(pipeline, ctx)
                .map_err(|e| e.context(format!("cannot render template {:?}", self.source)));
        }
        self.render(ctx).map(Value::String)
    }
}

fn parse_pipeline(body: &str, source: &str) -> Result<Vec<Command>> {
    let tokens = tokenize(body, source)?;
    let mut commands = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        match token {
            Token::Pipe => {
                if current.is_empty() {
                    return Err(Error::config(format!("empty command in template {source:?}")));
                }
                commands.push(Command {
                    terms: std::mem::take(&mut current),
                });
            }
            Token::Term(term) => current.push(term),
        }
    }
    if current.is_empty() {
        return Err(Error::config(format!("empty command in template {source:?}")));
    }
    commands.push(Command { terms: current });
    Ok(commands)
}

enum Token {
    Pipe,
    Term(Term),
}

fn tokenize(body: &str, source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '|' {
            tokens.push(Token::Pipe);
            i += 1;
            continue;
        }
        if c == '"' || c == '`' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                if ch == '\\' && quote == '"' && i + 1 < chars.len() {
                    i += 1;
                    value.push(match chars[i] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    value.push(ch);
                }
                i += 1;
            }
            if !closed {
                return Err(Error::config(format!("unterminated string in template {source:?}")));
            }
            tokens.push(Token::Term(Term::Literal(Value::String(value))));
            continue;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '|' {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        let term = if word == "." {
            Term::Field(Vec::new())
        } else if let Some(path) = word.strip_prefix('.') {
            Term::Field(path.split('.').map(str::to_string).collect())
        } else if word == "true" || word == "false" {
            Term::Literal(Value::Bool(word == "true"))
        } else if let Ok(n) = word.parse::<i64>() {
            Term::Literal(Value::from(n))
        } else if word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Term::Func(word)
        } else {
            return Err(Error::config(format!("unexpected {word:?} in template {source:?}")));
        };
        tokens.push(Token::Term(term));
    }
    Ok(tokens)
}

fn eval_pipeline(pipeline: &[Command], ctx: &RenderContext) -> Result<Value> {
    let mut previous: Option<Value> = None;
    for command in pipeline {
        previous = Some(eval_command(command, ctx, previous.take())?);
    }
    Ok(previous.unwrap_or(Value::Null))
}

fn eval_command(command: &Command, ctx: &RenderContext, piped: Option<Value>) -> Result<Value> {
    let (head, rest) = match command.terms.split_first() {
        Some(v) => v,
        None => return Ok(Value::Null),
    };
    let eval_term = |term: &Term| -> Result<Value> {
        match term {
            Term::Field(path) => Ok(ctx.lookup(path)),
            Term::Literal(v) => Ok(v.clone()),
            Term::Func(name) => call(name, Vec::new()),
        }
    };
    match head {
        Term::Func(name) => {
            let mut args = rest.iter().map(eval_term).collect::<Result<Vec<_>>>()?;
            if let Some(v) = piped {
                args.push(v);
            }
            call(name, args)
        }
        other => {
            if !rest.is_empty() {
                return Err(Error::config("only functions accept arguments"));
            }
            if piped.is_some() {
                return Err(Error::config("cannot pipe into a value"));
            }
            eval_term(other)
        }
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() != n {
            return Err(Error::config(format!(
                "function {name} expects {n} argument(s) but got {}",
                args.len()
            )));
        }
        Ok(())
    };
    match name {
        "env" => {
            arity(1)?;
            let key = value_to_string(&args[0]);
            Ok(std::env::var(key).map(Value::String).unwrap_or(Value::Null))
        }
        "default" => {
            arity(2)?;
            if is_empty(&args[1]) {
                Ok(args[0].clone())
            } else {
                Ok(args[1].clone())
            }
        }
        "eq" => {
            arity(2)?;
            Ok(Value::Bool(loosely_equal(&args[0], &args[1])))
        }
        "ne" => {
            arity(2)?;
            Ok(Value::Bool(!loosely_equal(&args[0], &args[1])))
        }
        "not" => {
            arity(1)?;
            Ok(Value::Bool(!truthy(&args[0])))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::String(value_to_string(&args[0]).to_lowercase()))
        }
        "upper" => {
            arity(1)?;
            Ok(Value::String(value_to_string(&args[0]).to_uppercase()))
        }
        "trim" => {
            arity(1)?;
            Ok(Value::String(value_to_string(&args[0]).trim().to_string()))
        }
        "file" => {
            // file <path> or file "optional" <path> (path piped in last)
            let (optional, path) = match args.as_slice() {
                [path] => (false, value_to_string(path)),
                [mode, path] => (value_to_string(mode) == "optional", value_to_string(path)),
                _ => return Err(Error::config("function file expects 1 or 2 arguments")),
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => Ok(Value::String(content)),
                Err(e) if optional && e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Null),
                Err(e) => Err(Error::wrap(
                    ErrorKind::Config,
                    format!("cannot read {path}"),
                    e,
                )),
            }
        }
        other => Err(Error::config(format!("unknown function {other:?}"))),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::String(s) => parse_bool(s).unwrap_or(!s.is_empty()),
        other => !is_empty(other),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(_), _) | (_, Value::String(_)) => value_to_string(a) == value_to_string(b),
        _ => a == b,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

macro_rules! template_serde {
    ($ty:ident, $expecting:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.0.source())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                struct V;
                impl<'de> Visitor<'de> for V {
                    type Value = $ty;

                    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                        f.write_str($expecting)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<$ty, E> {
                        Template::parse(v).map($ty).map_err(E::custom)
                    }

                    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<$ty, E> {
                        Ok($ty(Template::literal(v.to_string())))
                    }

                    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<$ty, E> {
                        Ok($ty(Template::literal(v.to_string())))
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<$ty, E> {
                        Ok($ty(Template::literal(v.to_string())))
                    }
                }
                deserializer.deserialize_any(V)
            }
        }
    };
}

/// A template rendering to a string.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateString(Template);

impl TemplateString {
    pub fn new(source: &str) -> Result<Self> {
        Template::parse(source).map(Self)
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self(Template::literal(text))
    }

    pub fn render(&self, ctx: &RenderContext) -> Result<String> {
        self.0.render(ctx)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for TemplateString {
    fn default() -> Self {
        Self::literal("")
    }
}

template_serde!(TemplateString, "a template string");

/// A template rendering to a boolean.
///
/// Accepts `true`/`false`/`yes`/`no`/`on`/`off`/`1`/`0`; an empty rendering is
/// `false`.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateBool(Template);

impl TemplateBool {
    pub fn new(source: &str) -> Result<Self> {
        Template::parse(source).map(Self)
    }

    pub fn of(value: bool) -> Self {
        Self(Template::literal(value.to_string()))
    }

    pub fn render(&self, ctx: &RenderContext) -> Result<bool> {
        match self.0.render_value(ctx)? {
            Value::Bool(b) => Ok(b),
            other => {
                let text = value_to_string(&other);
                parse_bool(&text).ok_or_else(|| {
                    Error::config(format!(
                        "template {:?} rendered {text:?} which is not a boolean",
                        self.0.source()
                    ))
                })
            }
        }
    }
}

impl Default for TemplateBool {
    fn default() -> Self {
        Self::of(false)
    }
}

template_serde!(TemplateBool, "a boolean or a template");

/// A list of string templates; empty renderings are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateStrings(Vec<TemplateString>);

impl TemplateStrings {
    pub fn of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(TemplateString::literal).collect())
    }

    pub fn new<I, S>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values
            .into_iter()
            .map(|v| TemplateString::new(v.as_ref()))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn render(&self, ctx: &RenderContext) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(self.0.len());
        for template in &self.0 {
            let value = template.render(ctx)?;
            if !value.is_empty() {
                out.push(value);
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RenderContext {
        RenderContext::empty()
            .with("session", json!({"id": "4b7c"}))
            .with("user", json!({"name": "alice", "homeDir": "/home/alice"}))
    }

    #[test]
    fn test_render_fields() {
        let t = Template::parse("bifroest-{{ .session.id }}").unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), "bifroest-4b7c");

        let t = Template::parse("{{.user.homeDir}}/.ssh/authorized_keys").unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), "/home/alice/.ssh/authorized_keys");
    }

    #[test]
    fn test_missing_field_renders_empty() {
        let t = Template::parse("[{{ .nope.nothing }}]").unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), "[]");
    }

    #[test]
    fn test_default_pipeline() {
        let t = Template::parse(r#"{{ .user.shell | default "/bin/sh" }}"#).unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), "/bin/sh");
    }

    #[test]
    fn test_bool_templates() {
        let t = TemplateBool::new(r#"{{ eq .user.name "alice" }}"#).unwrap();
        assert!(t.render(&ctx()).unwrap());

        let t = TemplateBool::new(r#"{{ eq .user.name "root" | not }}"#).unwrap();
        assert!(t.render(&ctx()).unwrap());

        let t = TemplateBool::new("maybe").unwrap();
        assert!(t.render(&ctx()).is_err());

        assert!(!TemplateBool::default().render(&ctx()).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Template::parse("{{ .a").is_err());
        assert!(Template::parse(r#"{{ "unterminated }}"#).is_err());
        assert!(Template::parse("{{ | }}").is_err());
    }

    #[test]
    fn test_unknown_function_is_render_error() {
        let t = Template::parse("{{ frobnicate 1 }}").unwrap();
        assert!(t.render(&ctx()).is_err());
    }

    #[test]
    fn test_strings_drop_empty() {
        let t = TemplateStrings::new(["/bin/sh", "{{ .nope }}", "-l"]).unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), vec!["/bin/sh", "-l"]);
    }

    #[test]
    fn test_deserialize_from_yaml_scalars() {
        let b: TemplateBool = serde_yaml::from_str("true").unwrap();
        assert!(b.render(&ctx()).unwrap());
        let s: TemplateString = serde_yaml::from_str("\"{{ .user.name }}\"").unwrap();
        assert_eq!(s.render(&ctx()).unwrap(), "alice");
    }
}
