//! 🔍 extract.rs: pulling metadata out of a document without asking it twice.
//!
//! Two tiny capability traits: [`ValueExtractor`] (document → optional scalar) and
//! [`FlagExtractor`] (document → bool). The builder only ever sees these. The config file
//! only ever produces [`FieldPath`]s. Code that wants something fancier hands in a closure
//! through [`FnExtractor`].

use serde_json::Value;

use crate::error::{ConnectorError, Result};

/// 🔍 document → optional scalar, as a string.
pub trait ValueExtractor: std::fmt::Debug + Send + Sync {
    fn extract(&self, document: &Value) -> Result<Option<String>>;
}

/// 🚩 document → yes/no.
pub trait FlagExtractor: std::fmt::Debug + Send + Sync {
    fn is_set(&self, document: &Value) -> Result<bool>;
}

/// 📍 A location inside a document: a JSON pointer, or a bare top-level key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pointer: String,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(ConnectorError::Configuration(
                "a field path can not be empty".to_string(),
            ));
        }
        let pointer = if path.starts_with('/') {
            path.to_string()
        } else {
            // 🔧 bare key: escape it into a one-segment pointer (RFC 6901, `~` first)
            format!("/{}", path.replace('~', "~0").replace('/', "~1"))
        };
        Ok(Self { pointer })
    }

    pub fn as_pointer(&self) -> &str {
        &self.pointer
    }

    fn lookup<'d>(&self, document: &'d Value) -> Result<&'d Value> {
        document.pointer(&self.pointer).ok_or_else(|| {
            ConnectorError::Extraction(format!("field '{}' is missing from the document", self.pointer))
        })
    }
}

impl ValueExtractor for FieldPath {
    fn extract(&self, document: &Value) -> Result<Option<String>> {
        match self.lookup(document)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
            other => Err(ConnectorError::Extraction(format!(
                "field '{}' holds {other}, which is not a scalar",
                self.pointer
            ))),
        }
    }
}

impl FlagExtractor for FieldPath {
    fn is_set(&self, document: &Value) -> Result<bool> {
        // 🚩 an absent flag is an unset flag
        match document.pointer(&self.pointer) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s == "true" => Ok(true),
            Some(Value::String(s)) if s == "false" => Ok(false),
            Some(other) => Err(ConnectorError::Extraction(format!(
                "flag field '{}' holds {other}, expected a boolean",
                self.pointer
            ))),
        }
    }
}

/// 🎁 Wraps a closure as an extractor. Works for both traits.
pub struct FnExtractor<F>(pub F);

impl<F> std::fmt::Debug for FnExtractor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnExtractor(<closure>)")
    }
}

impl<F> ValueExtractor for FnExtractor<F>
where
    F: Fn(&Value) -> Result<Option<String>> + Send + Sync,
{
    fn extract(&self, document: &Value) -> Result<Option<String>> {
        (self.0)(document)
    }
}

impl<F> FlagExtractor for FnExtractor<F>
where
    F: Fn(&Value) -> Result<bool> + Send + Sync,
{
    fn is_set(&self, document: &Value) -> Result<bool> {
        (self.0)(document)
    }
}
