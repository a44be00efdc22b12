//! Declared query templates

use super::BindError;
use super::lexer::{Placeholder, TokenKind, tokenize};
use serde::{Deserialize, Serialize};

/// Declared result shape of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnShape {
    /// First column of the first row
    Scalar,
    /// At most one record
    Single,
    /// Sequence of records
    Many,
    /// Number of rows written
    Affected,
}

impl ReturnShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnShape::Scalar => "scalar",
            ReturnShape::Single => "single",
            ReturnShape::Many => "many",
            ReturnShape::Affected => "affected",
        }
    }
}

impl std::str::FromStr for ReturnShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scalar" => Ok(ReturnShape::Scalar),
            "single" => Ok(ReturnShape::Single),
            "many" => Ok(ReturnShape::Many),
            "affected" => Ok(ReturnShape::Affected),
            other => Err(format!("unknown return shape: {other} (scalar, single, many, affected)")),
        }
    }
}

impl std::fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A statement as declared by the application: SQL text with placeholders,
/// the parameter names in placeholder order, and the expected result shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub shape: ReturnShape,
}

impl QueryTemplate {
    pub fn new(sql: impl Into<String>, shape: ReturnShape) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            shape,
        }
    }

    pub fn scalar(sql: impl Into<String>) -> Self {
        Self::new(sql, ReturnShape::Scalar)
    }

    pub fn single(sql: impl Into<String>) -> Self {
        Self::new(sql, ReturnShape::Single)
    }

    pub fn many(sql: impl Into<String>) -> Self {
        Self::new(sql, ReturnShape::Many)
    }

    pub fn affected(sql: impl Into<String>) -> Self {
        Self::new(sql, ReturnShape::Affected)
    }

    /// Declare the next parameter
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    /// Declare several parameters in order
    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare the parameters found in the SQL: distinct named placeholders in
    /// order of first appearance, or `1..=n` for positional ones
    pub fn infer_params(mut self) -> Result<Self, BindError> {
        let mut named: Vec<String> = Vec::new();
        let mut positional = 0;
        for token in tokenize(&self.sql)? {
            match token.kind {
                TokenKind::Param(Placeholder::Named(name)) => {
                    if !named.contains(&name) {
                        named.push(name);
                    }
                }
                TokenKind::Param(Placeholder::Anonymous) => positional += 1,
                TokenKind::Param(Placeholder::Numbered(n)) => positional = positional.max(n),
                _ => {}
            }
        }
        self.params = if named.is_empty() {
            (1..=positional).map(|i| i.to_string()).collect()
        } else {
            named
        };
        Ok(self)
    }

    /// Identity used by the compile cache
    pub fn identity(&self) -> TemplateId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.sql.as_bytes());
        hasher.update(&[0]);
        for param in &self.params {
            hasher.update(param.as_bytes());
            hasher.update(&[0]);
        }
        hasher.update(self.shape.as_str().as_bytes());
        TemplateId(*hasher.finalize().as_bytes())
    }
}

/// Digest of a template's text, parameters and shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId([u8; 32]);

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_depends_on_all_parts() {
        let base = QueryTemplate::many("SELECT * FROM person WHERE age > :minAge").param("minAge");
        assert_eq!(base.identity(), base.clone().identity());
        assert_ne!(base.identity(), QueryTemplate::many(base.sql.clone()).identity());

        let mut single = base.clone();
        single.shape = ReturnShape::Single;
        assert_ne!(base.identity(), single.identity());
    }

    #[test]
    fn test_infer_params() {
        let named = QueryTemplate::many("SELECT * FROM t WHERE a = :a OR b = @b OR c = :a")
            .infer_params()
            .unwrap();
        assert_eq!(named.params, vec!["a", "b"]);

        let positional = QueryTemplate::many("SELECT * FROM t WHERE a = ? AND b = ?").infer_params().unwrap();
        assert_eq!(positional.params, vec!["1", "2"]);

        let literal = QueryTemplate::many("SELECT ':a' FROM t").infer_params().unwrap();
        assert!(literal.params.is_empty());
    }

    #[test]
    fn test_shape_from_str() {
        assert_eq!("Many".parse::<ReturnShape>().unwrap(), ReturnShape::Many);
        assert_eq!("affected".parse::<ReturnShape>().unwrap(), ReturnShape::Affected);
        assert!("rows".parse::<ReturnShape>().is_err());
    }
}
