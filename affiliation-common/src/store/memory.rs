use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::affiliation::{Affiliation, TenantScope};
use crate::predicate::Predicate;
use crate::store::{AffiliationPage, AffiliationStore, StoreError};

/// In-memory [`AffiliationStore`] backing tests and local runs.
///
/// Records live in a single `Vec` in insertion order. The
/// check-then-push in [`AffiliationStore::insert`] runs under one lock
/// acquisition, so concurrent inserts of the same key observe exactly one
/// success — the same arbitration the Postgres unique index provides.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ScopedRecord>>,
}

struct ScopedRecord {
    scope: TenantScope,
    record: Affiliation,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AffiliationStore for MemoryStore {
    async fn insert(
        &self,
        scope: &TenantScope,
        mut record: Affiliation,
    ) -> Result<Affiliation, StoreError> {
        let mut records = self.records.lock().expect("poisoned MemoryStore mutex");

        let taken = records.iter().any(|r| {
            r.scope == *scope
                && r.record.user_id == record.user_id
                && r.record.tenant_id == record.tenant_id
        });
        if taken {
            return Err(StoreError::Conflict {
                user_id: record.user_id,
                tenant_id: record.tenant_id,
            });
        }

        record.created_at = Utc::now();
        records.push(ScopedRecord {
            scope: scope.clone(),
            record: record.clone(),
        });
        Ok(record)
    }

    async fn find_by_key(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Affiliation>, StoreError> {
        let records = self.records.lock().expect("poisoned MemoryStore mutex");
        Ok(records
            .iter()
            .find(|r| {
                r.scope == *scope && r.record.user_id == user_id && r.record.tenant_id == tenant_id
            })
            .map(|r| r.record.clone()))
    }

    async fn exists_by_key(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<bool, StoreError> {
        let records = self.records.lock().expect("poisoned MemoryStore mutex");
        Ok(records.iter().any(|r| {
            r.scope == *scope && r.record.user_id == user_id && r.record.tenant_id == tenant_id
        }))
    }

    async fn query(
        &self,
        scope: &TenantScope,
        predicate: &Predicate,
        offset: i64,
        limit: i64,
    ) -> Result<AffiliationPage, StoreError> {
        let records = self.records.lock().expect("poisoned MemoryStore mutex");

        let matching: Vec<&Affiliation> = records
            .iter()
            .filter(|r| r.scope == *scope && predicate.matches(&r.record))
            .map(|r| &r.record)
            .collect();

        let total_records = matching.len() as i64;
        let user_affiliations = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();

        Ok(AffiliationPage {
            user_affiliations,
            total_records,
        })
    }

    async fn delete_all_for_tenant(&self, scope: &TenantScope) -> Result<u64, StoreError> {
        let mut records = self.records.lock().expect("poisoned MemoryStore mutex");
        let before = records.len();
        records.retain(|r| r.scope != *scope);
        Ok((before - records.len()) as u64)
    }
}
