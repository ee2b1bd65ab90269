//! Configuration templates with reference tokens parsed once at load time.

use super::token::{ReferenceToken, TokenParseError};
use serde_json::{Map, Value};

/// A configuration value with every reference token pre-parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigTemplate {
    /// A value with no tokens anywhere inside it.
    Literal(Value),
    /// A string value that is a reference token.
    Token(ReferenceToken),
    /// A mapping containing at least one token.
    Object(Vec<(String, ConfigTemplate)>),
    /// A sequence containing at least one token.
    Array(Vec<ConfigTemplate>),
}

impl ConfigTemplate {
    /// Parses a raw configuration value.
    ///
    /// Subtrees without tokens collapse into a single `Literal`.
    pub fn parse(value: &Value) -> Result<Self, TokenParseError> {
        match value {
            Value::String(s) => Ok(ReferenceToken::parse(s)?
                .map_or_else(|| Self::Literal(value.clone()), Self::Token)),
            Value::Array(items) => {
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(Self::is_literal) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::Array(parsed))
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .iter()
                    .map(|(k, v)| Self::parse(v).map(|t| (k.clone(), t)))
                    .collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(|(_, t)| t.is_literal()) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::Object(parsed))
                }
            }
            _ => Ok(Self::Literal(value.clone())),
        }
    }

    /// Returns true when no tokens occur in this subtree.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Returns every token in document order.
    #[must_use]
    pub fn tokens(&self) -> Vec<&ReferenceToken> {
        let mut out = Vec::new();
        self.collect_tokens(&mut out);
        out
    }

    fn collect_tokens<'a>(&'a self, out: &mut Vec<&'a ReferenceToken>) {
        match self {
            Self::Literal(_) => {}
            Self::Token(token) => out.push(token),
            Self::Object(entries) => {
                for (_, t) in entries {
                    t.collect_tokens(out);
                }
            }
            Self::Array(items) => {
                for t in items {
                    t.collect_tokens(out);
                }
            }
        }
    }

    /// Rebuilds a concrete value, substituting each token through `lookup`.
    pub fn render<E, F>(&self, lookup: &mut F) -> Result<Value, E>
    where
        F: FnMut(&ReferenceToken) -> Result<Value, E>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Token(token) => lookup(token),
            Self::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, t) in entries {
                    map.insert(key.clone(), t.render(lookup)?);
                }
                Ok(Value::Object(map))
            }
            Self::Array(items) => items
                .iter()
                .map(|t| t.render(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_collapses() {
        let raw = json!({"vars": {"cores": 2, "tags": ["a", "b"]}});
        let template = ConfigTemplate::parse(&raw).unwrap();
        assert!(template.is_literal());
        assert!(template.tokens().is_empty());
    }

    #[test]
    fn test_tokens_in_document_order() {
        let raw = json!({
            "a": "_secret:vault:key",
            "b": ["plain", "_group:terraform:proxmox:master:master-01"],
        });
        let template = ConfigTemplate::parse(&raw).unwrap();
        let rendered: Vec<String> = template.tokens().iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "_secret:vault:key".to_string(),
                "_group:terraform:proxmox:master:master-01".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_substitutes_tokens() {
        let raw = json!({"password": "_secret:vault:key", "port": 8006});
        let template = ConfigTemplate::parse(&raw).unwrap();
        let value: Result<Value, ()> = template.render(&mut |_| Ok(json!("abc")));
        assert_eq!(value.unwrap(), json!({"password": "abc", "port": 8006}));
    }

    #[test]
    fn test_malformed_token_fails_parse() {
        let raw = json!({"host": "_group:terraform"});
        assert!(ConfigTemplate::parse(&raw).is_err());
    }
}
