use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::affiliation::{Affiliation, TenantScope};
use crate::predicate::Predicate;

pub mod memory;
pub mod postgres;

/// Enumeration of errors for operations with an [`AffiliationStore`].
/// Driver errors are wrapped to carry the failing command for context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("affiliation for user {user_id} in tenant {tenant_id} already exists")]
    Conflict { user_id: Uuid, tenant_id: String },
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
}

impl StoreError {
    /// Whether retrying the operation later could succeed. Conflicts never
    /// resolve on retry; connection-level failures usually do.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict { .. } => false,
            StoreError::Connection { .. } => true,
            StoreError::Query { error, .. } => postgres::is_transient_error(error),
        }
    }
}

/// One page of query results plus the total match count.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliationPage {
    pub user_affiliations: Vec<Affiliation>,
    pub total_records: i64,
}

/// Durable keyed collection of affiliation records. Every operation is
/// scoped to one consortium member tenant; implementations never reach
/// across scopes.
#[async_trait]
pub trait AffiliationStore: Send + Sync {
    /// Atomic insert-or-conflict: fails with [`StoreError::Conflict`] iff
    /// `(user_id, tenant_id)` already exists in scope. The stored record is
    /// returned with its final `created_at`.
    async fn insert(
        &self,
        scope: &TenantScope,
        record: Affiliation,
    ) -> Result<Affiliation, StoreError>;

    /// Fetch the record holding the given natural key, if any.
    async fn find_by_key(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Affiliation>, StoreError>;

    /// Cheap existence probe on the natural key, without materializing a
    /// record.
    async fn exists_by_key(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<bool, StoreError>;

    /// Page of matching records in insertion order, plus the total count.
    /// `limit == 0` returns no rows but still an accurate total.
    async fn query(
        &self,
        scope: &TenantScope,
        predicate: &Predicate,
        offset: i64,
        limit: i64,
    ) -> Result<AffiliationPage, StoreError>;

    /// Remove every record in the scope. Idempotent; returns the number of
    /// records removed.
    async fn delete_all_for_tenant(&self, scope: &TenantScope) -> Result<u64, StoreError>;
}
