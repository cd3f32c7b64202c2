//! Accès PostgreSQL/PostGIS (pool, catalogue, staging, écriture, swap)

pub mod catalog;
pub mod cleanup;
pub mod pool;
pub mod staging;
pub mod swap;
pub mod writer;

use std::fmt;

/// Table qualifiée par son schéma
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Table sœur dans le même schéma
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.schema.clone(), name)
    }

    /// Nom qualifié et quoté, utilisable tel quel dans une requête
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Quote un identifiant SQL
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        let table = TableRef::new("public", "communes");
        assert_eq!(table.qualified(), "\"public\".\"communes\"");
        assert_eq!(table.to_string(), "public.communes");
        assert_eq!(table.sibling("x").qualified(), "\"public\".\"x\"");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
