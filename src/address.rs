//! Logical queue addresses and their physical table identifiers.
//!
//! A logical address has the form `table` or `table@schema`. The translation to a table is
//! deterministic. SQLite compares identifiers case-insensitively, so two logical addresses that
//! differ only by case (or that collapse to the same truncated identifier) would silently share a
//! table; [`AddressTranslator::register`] detects that at setup time.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::{error::Error, utils::quote_identifier};

/// Longest identifier the translator will emit. Longer names are truncated and suffixed with a
/// hash of the full name so that distinct long names stay distinct.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

const HASH_SUFFIX_LENGTH: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueAddress {
    table: String,
    schema: String,
}

impl QueueAddress {
    pub fn new(table: impl AsRef<str>, schema: impl AsRef<str>) -> Self {
        Self {
            table: fit_identifier(table.as_ref()),
            schema: fit_identifier(schema.as_ref()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// `"schema"."table"`, ready to splice into SQL.
    pub fn qualified_table_name(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        )
    }

    fn canonical_key(&self) -> String {
        format!("{}.{}", self.schema, self.table).to_lowercase()
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.table, self.schema)
    }
}

fn fit_identifier(name: &str) -> String {
    if name.chars().count() <= MAX_IDENTIFIER_LENGTH {
        return name.to_owned();
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let prefix: String = name
        .chars()
        .take(MAX_IDENTIFIER_LENGTH - HASH_SUFFIX_LENGTH - 1)
        .collect();

    format!("{prefix}_{}", &digest[..HASH_SUFFIX_LENGTH])
}

pub struct AddressTranslator {
    default_schema: String,
    /// Canonical (lower-cased) table key to the logical address that claimed it.
    registered: papaya::HashMap<String, String>,
}

impl AddressTranslator {
    pub fn new(default_schema: impl Into<String>) -> Self {
        Self {
            default_schema: default_schema.into(),
            registered: papaya::HashMap::new(),
        }
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn parse(&self, logical: &str) -> Result<QueueAddress, Error> {
        let (table, schema) = self.split(logical)?;
        Ok(QueueAddress::new(table, schema))
    }

    fn split<'a>(&'a self, logical: &'a str) -> Result<(&'a str, &'a str), Error> {
        let mut parts = logical.split('@');

        let table = parts.next().unwrap_or_default().trim();
        let schema = parts
            .next()
            .map(str::trim)
            .filter(|schema| !schema.is_empty())
            .unwrap_or(self.default_schema.as_str());

        if table.is_empty() || parts.next().is_some() {
            return Err(Error::invalid_parameter(format!(
                "invalid queue address '{logical}', expected 'table' or 'table@schema'"
            )));
        }

        Ok((table, schema))
    }

    /// Parses `logical` and claims its table. Registering the same logical address twice is
    /// fine; a different logical address mapping to an already claimed table is an error.
    pub fn register(&self, logical: &str) -> Result<QueueAddress, Error> {
        let (table, schema) = self.split(logical)?;
        let address = QueueAddress::new(table, schema);
        let canonical = format!("{table}@{schema}");

        let map = self.registered.pin();
        let owner = map.get_or_insert_with(address.canonical_key(), || canonical.clone());

        if *owner != canonical {
            return Err(Error::AddressCollision {
                existing: owner.clone(),
                requested: logical.to_owned(),
                table: address.qualified_table_name(),
            });
        }

        Ok(address)
    }

    /// Logical address of an endpoint-owned auxiliary table such as the delayed store.
    pub fn generate(&self, endpoint_name: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{endpoint_name}.{suffix}"),
            None => endpoint_name.to_owned(),
        }
    }
}
