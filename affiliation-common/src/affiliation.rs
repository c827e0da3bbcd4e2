use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Request header (HTTP) and message header (Kafka) carrying the tenant
/// scope for a call. The scope is always extracted at the edge and passed
/// down explicitly; nothing below the transport layer reads it ambiently.
pub const TENANT_HEADER: &str = "tenant-id";

/// The tenant boundary within which uniqueness, queries and deletes are
/// evaluated. One consortium member tenant == one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantScope(String);

impl TenantScope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which channel a claim arrived through. Primary affiliations only ever
/// arrive through the consortium event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrigin {
    Api,
    ConsortiumEvent,
}

/// A stored user–tenant affiliation: the assertion that `user_id` is known
/// in `tenant_id`, within one consortium scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Affiliation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_system_id: Option<String>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("affiliation claim is missing required field '{0}'")]
    MissingField(&'static str),
}

/// An inbound affiliation-creation claim, as decoded from an API body or an
/// event payload. Everything is optional at this stage; validation happens
/// in [`AffiliationClaim::into_affiliation`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AffiliationClaim {
    pub id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub mobile_phone_number: Option<String>,
    pub barcode: Option<String>,
    pub external_system_id: Option<String>,
}

impl AffiliationClaim {
    /// Validate the required fields and produce the record to persist.
    /// `created_at` is provisional here; the store stamps the final value
    /// at insert.
    pub fn into_affiliation(self, origin: ClaimOrigin) -> Result<Affiliation, ValidationError> {
        let id = self.id.ok_or(ValidationError::MissingField("id"))?;
        let user_id = self.user_id.ok_or(ValidationError::MissingField("userId"))?;
        let tenant_id = self
            .tenant_id
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::MissingField("tenantId"))?;

        Ok(Affiliation {
            id,
            user_id,
            tenant_id,
            username: self.username,
            email: self.email,
            phone_number: self.phone_number,
            mobile_phone_number: self.mobile_phone_number,
            barcode: self.barcode,
            external_system_id: self.external_system_id,
            is_primary: matches!(origin, ClaimOrigin::ConsortiumEvent),
            created_at: Utc::now(),
        })
    }
}
