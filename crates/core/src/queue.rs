//! Queue-level value types: table identifiers and claim batch bounds.

use core::num::NonZeroU32;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest identifier Postgres keeps without truncation.
const MAX_IDENT_LEN: usize = 63;

/// Validated name of a queue table, optionally schema-qualified (`schema.table`).
///
/// Table names are interpolated into SQL, so only plain identifiers are
/// accepted: an ASCII letter or `_`, followed by ASCII letters, digits or `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        let mut parts = name.split('.');
        let first = parts.next().unwrap_or_default();
        validate_ident(&name, first)?;
        if let Some(second) = parts.next() {
            validate_ident(&name, second)?;
        }
        if parts.next().is_some() {
            return Err(DomainError::invalid_table(format!(
                "{name:?}: at most one schema qualifier is allowed"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier quoted for interpolation into Postgres statements.
    pub fn quoted(&self) -> String {
        self.0
            .split('.')
            .map(|part| format!("\"{part}\""))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Name of the advisory lock that serializes claimers of this table.
    pub fn claim_lock_name(&self) -> String {
        format!("{}_claim_lock", self.0)
    }
}

fn validate_ident(full: &str, part: &str) -> DomainResult<()> {
    if part.is_empty() {
        return Err(DomainError::invalid_table(format!("{full:?}: empty identifier")));
    }
    if part.len() > MAX_IDENT_LEN {
        return Err(DomainError::invalid_table(format!(
            "{full:?}: identifier longer than {MAX_IDENT_LEN} bytes"
        )));
    }
    let mut chars = part.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DomainError::invalid_table(format!(
            "{full:?}: only ASCII letters, digits and '_' are allowed"
        )));
    }
    Ok(())
}

impl core::fmt::Display for TableName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TableName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

/// Upper bound on how many rows one claim may take.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimBatchSize(NonZeroU32);

impl ClaimBatchSize {
    pub fn new(rows: u32) -> DomainResult<Self> {
        NonZeroU32::new(rows)
            .map(Self)
            .ok_or_else(|| DomainError::validation("claim batch size must be positive"))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl Default for ClaimBatchSize {
    fn default() -> Self {
        Self(NonZeroU32::MIN.saturating_add(4))
    }
}

impl FromStr for ClaimBatchSize {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rows = u32::from_str(s.trim())
            .map_err(|e| DomainError::validation(format!("claim batch size: {e}")))?;
        Self::new(rows)
    }
}
