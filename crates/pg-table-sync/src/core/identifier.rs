//! Identifier validation and quoting for SQL injection prevention.
//!
//! SQL identifiers (schema, table, staging-table and column names) cannot be
//! passed as statement parameters, so generated SQL has to interpolate them.
//! Every identifier goes through [`validate_identifier`] first, which only
//! admits `[A-Za-z0-9_]`. Values never travel this way; they go through COPY
//! or bound parameters.
//!
//! Validated names are additionally wrapped in double quotes so that mixed
//! case survives and reserved words (`user`, `order`) remain usable.

use std::fmt;

use crate::error::{Result, SyncError};

/// Maximum identifier length. PostgreSQL silently truncates past 63 bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers exceeding [`MAX_IDENTIFIER_LENGTH`]
/// - Any character outside `[A-Za-z0-9_]` (quotes, `;`, whitespace, `.`, NUL, ...)
///
/// # Errors
///
/// Returns `SyncError::InvalidIdentifier` naming the offending input.
pub fn validate_identifier(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(SyncError::identifier(name, "identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::identifier(
            name,
            format!(
                "identifier exceeds maximum length of {} bytes (got {} bytes)",
                MAX_IDENTIFIER_LENGTH,
                name.len()
            ),
        ));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        let reason = match bad {
            '"' | '\'' | '`' => format!("SECURITY: contains quote character {:?}", bad),
            ';' => "SECURITY: contains statement separator ';'".to_string(),
            '\0' => "SECURITY: contains null byte".to_string(),
            other => format!("contains character {:?} outside [A-Za-z0-9_]", other),
        };
        return Err(SyncError::identifier(name, reason));
    }

    Ok(name)
}

/// An identifier that has passed [`validate_identifier`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The double-quoted form for SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A `(schema, table)` pair identifying one physical table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Ident,
    pub name: Ident,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            schema: Ident::new(schema)?,
            name: Ident::new(name)?,
        })
    }

    /// Parse `schema.table`, or a bare `table` placed in `default_schema`.
    pub fn parse(reference: &str, default_schema: &str) -> Result<Self> {
        match reference.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(default_schema, reference),
        }
    }

    /// `"schema"."table"` for SQL text.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.name.quoted())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("my_table").is_ok());
        assert!(validate_identifier("Table123").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_quotes() {
        for name in ["ta\"ble", "ta'ble", "ta`ble"] {
            let err = validate_identifier(name).unwrap_err();
            assert!(matches!(err, SyncError::InvalidIdentifier { .. }));
            assert!(err.to_string().contains("quote"), "{}", err);
        }
    }

    #[test]
    fn test_validate_identifier_rejects_semicolon() {
        let err = validate_identifier("users;DROP").unwrap_err();
        assert!(err.to_string().contains("separator"));
    }

    #[test]
    fn test_validate_identifier_rejects_other_characters() {
        assert!(validate_identifier("column with spaces").is_err());
        assert!(validate_identifier("schema.table").is_err());
        assert!(validate_identifier("table\0name").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("日本語").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = validate_identifier(&long_name);
        assert!(result.unwrap_err().to_string().contains("maximum length"));
    }

    #[test]
    fn test_validate_identifier_accepts_max_length() {
        let max_name = "a".repeat(MAX_IDENTIFIER_LENGTH);
        assert!(validate_identifier(&max_name).is_ok());
    }

    // =========================================================================
    // Ident / TableRef tests
    // =========================================================================

    #[test]
    fn test_ident_quoted() {
        let ident = Ident::new("Order").unwrap();
        assert_eq!(ident.as_str(), "Order");
        assert_eq!(ident.quoted(), "\"Order\"");
        assert_eq!(ident.to_string(), "Order");
    }

    #[test]
    fn test_table_ref_parse_qualified() {
        let table = TableRef::parse("sandbox.products", "public").unwrap();
        assert_eq!(table.schema.as_str(), "sandbox");
        assert_eq!(table.name.as_str(), "products");
        assert_eq!(table.qualified(), "\"sandbox\".\"products\"");
        assert_eq!(table.to_string(), "sandbox.products");
    }

    #[test]
    fn test_table_ref_parse_bare_uses_default_schema() {
        let table = TableRef::parse("products", "public").unwrap();
        assert_eq!(table.schema.as_str(), "public");
        assert_eq!(table.name.as_str(), "products");
    }

    #[test]
    fn test_table_ref_parse_rejects_extra_dots() {
        // "a.b.c" splits into schema "a" and table "b.c", which is invalid
        assert!(TableRef::parse("a.b.c", "public").is_err());
        assert!(TableRef::parse("public.", "public").is_err());
        assert!(TableRef::parse("products", "bad schema").is_err());
    }
}
