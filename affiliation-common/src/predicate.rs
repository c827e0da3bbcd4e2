use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::affiliation::Affiliation;

/// Enumeration of errors for predicate construction. These are caller bugs
/// (bad field name, bad combinator), never data errors: fail fast, never
/// retry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PredicateError {
    #[error("{0} is not a recognized filter field")]
    UnrecognizedField(String),
    #[error("{0} is not a valid query operator, expected 'and' or 'or'")]
    UnrecognizedOp(String),
}

/// The closed set of fields an affiliation query may filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    UserId,
    Username,
    TenantId,
    Email,
    PhoneNumber,
    MobilePhoneNumber,
    Barcode,
    ExternalSystemId,
}

impl FilterField {
    /// SQL expression the field compares against. Username and user id are
    /// matched on their lowercased text form, mirroring
    /// [`PredicateBuilder::field`] normalizing the clause value.
    pub(crate) fn column_expr(&self) -> &'static str {
        match self {
            FilterField::UserId => "user_id::text",
            FilterField::Username => "lower(username)",
            FilterField::TenantId => "tenant_id",
            FilterField::Email => "email",
            FilterField::PhoneNumber => "phone_number",
            FilterField::MobilePhoneNumber => "mobile_phone_number",
            FilterField::Barcode => "barcode",
            FilterField::ExternalSystemId => "external_system_id",
        }
    }
}

/// Allow casting `FilterField` from the wire names used by the query API.
impl FromStr for FilterField {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "userId" => Ok(FilterField::UserId),
            "username" => Ok(FilterField::Username),
            "tenantId" => Ok(FilterField::TenantId),
            "email" => Ok(FilterField::Email),
            "phoneNumber" => Ok(FilterField::PhoneNumber),
            "mobilePhoneNumber" => Ok(FilterField::MobilePhoneNumber),
            "barcode" => Ok(FilterField::Barcode),
            "externalSystemId" => Ok(FilterField::ExternalSystemId),
            invalid => Err(PredicateError::UnrecognizedField(invalid.to_owned())),
        }
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterField::UserId => "userId",
            FilterField::Username => "username",
            FilterField::TenantId => "tenantId",
            FilterField::Email => "email",
            FilterField::PhoneNumber => "phoneNumber",
            FilterField::MobilePhoneNumber => "mobilePhoneNumber",
            FilterField::Barcode => "barcode",
            FilterField::ExternalSystemId => "externalSystemId",
        };
        f.write_str(name)
    }
}

/// Combinator across the supplied filter clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOp {
    #[default]
    And,
    Or,
}

impl FromStr for QueryOp {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(QueryOp::And),
            "or" => Ok(QueryOp::Or),
            invalid => Err(PredicateError::UnrecognizedOp(invalid.to_owned())),
        }
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOp::And => f.write_str("and"),
            QueryOp::Or => f.write_str("or"),
        }
    }
}

/// One equality clause: `field = value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    field: FilterField,
    value: String,
}

impl Clause {
    pub fn field(&self) -> FilterField {
        self.field
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A conjunctive or disjunctive filter over affiliation fields. Zero
/// clauses matches every record in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    op: QueryOp,
    clauses: Vec<Clause>,
}

impl Predicate {
    /// The unfiltered predicate.
    pub fn match_all() -> Self {
        PredicateBuilder::new(QueryOp::And).build()
    }

    pub fn op(&self) -> QueryOp {
        self.op
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Pure evaluation against one record, used by the in-memory store.
    /// The Postgres store renders the same clauses to SQL instead.
    pub fn matches(&self, record: &Affiliation) -> bool {
        if self.clauses.is_empty() {
            return true;
        }
        match self.op {
            QueryOp::And => self.clauses.iter().all(|c| clause_matches(c, record)),
            QueryOp::Or => self.clauses.iter().any(|c| clause_matches(c, record)),
        }
    }
}

fn clause_matches(clause: &Clause, record: &Affiliation) -> bool {
    let value = clause.value.as_str();
    match clause.field {
        // Clause values for these two are lowercased at build time.
        FilterField::UserId => record.user_id.to_string() == value,
        FilterField::Username => record
            .username
            .as_deref()
            .is_some_and(|u| u.to_lowercase() == value),
        FilterField::TenantId => record.tenant_id == value,
        FilterField::Email => record.email.as_deref() == Some(value),
        FilterField::PhoneNumber => record.phone_number.as_deref() == Some(value),
        FilterField::MobilePhoneNumber => record.mobile_phone_number.as_deref() == Some(value),
        FilterField::Barcode => record.barcode.as_deref() == Some(value),
        FilterField::ExternalSystemId => record.external_system_id.as_deref() == Some(value),
    }
}

/// Builds a [`Predicate`] from a sparse set of optional field values.
/// Absent and blank values are dropped: they never become `field = ""`
/// clauses.
#[derive(Debug)]
pub struct PredicateBuilder {
    op: QueryOp,
    clauses: Vec<Clause>,
}

impl PredicateBuilder {
    pub fn new(op: QueryOp) -> Self {
        Self {
            op,
            clauses: Vec::new(),
        }
    }

    /// Add an equality clause for `field` if `value` is present and
    /// non-blank. Username and user id values are lowercased so matching
    /// is case-insensitive regardless of stored casing.
    pub fn field(mut self, field: FilterField, value: Option<&str>) -> Self {
        if let Some(value) = value {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                let value = match field {
                    FilterField::Username | FilterField::UserId => trimmed.to_lowercase(),
                    _ => trimmed.to_owned(),
                };
                self.clauses.push(Clause { field, value });
            }
        }
        self
    }

    /// Like [`PredicateBuilder::field`], resolving the field from its wire
    /// name. An unrecognized name is a caller error.
    pub fn try_field(self, name: &str, value: Option<&str>) -> Result<Self, PredicateError> {
        Ok(self.field(name.parse()?, value))
    }

    pub fn build(self) -> Predicate {
        Predicate {
            op: self.op,
            clauses: self.clauses,
        }
    }
}
