use std::sync::Arc;

use uuid::Uuid;

use crate::affiliation::{Affiliation, TenantScope};
use crate::store::{AffiliationStore, StoreError};

/// Classification of a write attempt against the uniqueness invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    /// The natural key is free; an insert should succeed.
    New,
    /// The key is held by a record with the same id: a true redelivery of
    /// an already-applied claim.
    DuplicateOfExisting(Uuid),
    /// The key is held by a record with a different id: a genuine conflict
    /// to surface, never to swallow.
    Conflict(Uuid),
}

/// Decides whether persisting a candidate would violate the uniqueness
/// invariant, and if so, whether that is a redelivery or a conflict.
///
/// A prior read is never authoritative under races: callers attempt the
/// insert first and only consult [`DuplicateDetector::classify`] once the
/// storage layer reports a uniqueness violation. Of two racing inserts for
/// one key, exactly one succeeds; the loser lands here and is reclassified.
pub struct DuplicateDetector {
    store: Arc<dyn AffiliationStore>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn AffiliationStore>) -> Self {
        Self { store }
    }

    /// Cheap probe for the common redelivery case, before paying for an
    /// insert attempt. Advisory only; the insert remains the arbiter.
    pub async fn key_taken(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<bool, StoreError> {
        self.store.exists_by_key(scope, user_id, tenant_id).await
    }

    /// Re-read the natural key and decide duplicate vs conflict.
    pub async fn classify(
        &self,
        scope: &TenantScope,
        candidate: &Affiliation,
    ) -> Result<DuplicateCheck, StoreError> {
        match self
            .store
            .find_by_key(scope, candidate.user_id, &candidate.tenant_id)
            .await?
        {
            None => Ok(DuplicateCheck::New),
            Some(existing) if existing.id == candidate.id => {
                Ok(DuplicateCheck::DuplicateOfExisting(existing.id))
            }
            Some(existing) => Ok(DuplicateCheck::Conflict(existing.id)),
        }
    }
}
