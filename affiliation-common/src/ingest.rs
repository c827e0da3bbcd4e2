use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::affiliation::{
    Affiliation, AffiliationClaim, ClaimOrigin, TenantScope, ValidationError,
};
use crate::dedup::{DuplicateCheck, DuplicateDetector};
use crate::predicate::Predicate;
use crate::store::{AffiliationPage, AffiliationStore, StoreError};

/// Tagged result of one ingestion attempt. Returned by value so every call
/// site handles all four branches; a duplicate is data, not an exception.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The claim was persisted.
    Created(Affiliation),
    /// Redelivery of an already-applied claim: a success, not an error.
    AlreadyProcessed { id: Uuid },
    /// A different record already holds the key. Surfaced for operator
    /// resolution, never retried automatically.
    Rejected { existing_id: Uuid, candidate_id: Uuid },
    /// Storage or transport failure with no data-integrity implication;
    /// the caller should retry (event path: request redelivery).
    Transient { reason: String },
}

/// Single entry point for affiliation writes, shared by the synchronous
/// management API and the event consumer. Only the event path has to cope
/// with redelivery; both get the same insert-or-conflict semantics.
pub struct AffiliationIngestionService {
    store: Arc<dyn AffiliationStore>,
    detector: DuplicateDetector,
}

impl AffiliationIngestionService {
    pub fn new(store: Arc<dyn AffiliationStore>) -> Self {
        let detector = DuplicateDetector::new(store.clone());
        Self { store, detector }
    }

    /// Drive one claim through validate → persist-with-dedup → classify.
    pub async fn ingest(
        &self,
        scope: &TenantScope,
        claim: AffiliationClaim,
        origin: ClaimOrigin,
    ) -> Result<Outcome, ValidationError> {
        let candidate = claim.into_affiliation(origin)?;
        debug!(
            id = %candidate.id,
            user_id = %candidate.user_id,
            tenant_id = %candidate.tenant_id,
            scope = %scope,
            "trying to save user-tenant affiliation"
        );

        // Fast path for redelivered events: skip the insert attempt when
        // the key is already taken. The insert below stays the authority
        // under races, so a probe failure just falls through.
        if let Ok(true) = self
            .detector
            .key_taken(scope, candidate.user_id, &candidate.tenant_id)
            .await
        {
            match self.detector.classify(scope, &candidate).await {
                Ok(DuplicateCheck::DuplicateOfExisting(id)) => {
                    return Ok(self.already_processed(scope, id))
                }
                Ok(DuplicateCheck::Conflict(existing_id)) => {
                    return Ok(self.rejected(scope, existing_id, candidate.id))
                }
                Ok(DuplicateCheck::New) | Err(_) => {}
            }
        }

        match self.store.insert(scope, candidate.clone()).await {
            Ok(record) => {
                info!(
                    id = %record.id,
                    user_id = %record.user_id,
                    tenant_id = %record.tenant_id,
                    scope = %scope,
                    "user-tenant affiliation saved"
                );
                metrics::counter!("affiliations_created_total").increment(1);
                Ok(Outcome::Created(record))
            }
            // The unique index fired: re-read to decide redelivery vs
            // genuine conflict.
            Err(StoreError::Conflict { .. }) => {
                match self.detector.classify(scope, &candidate).await {
                    Ok(DuplicateCheck::DuplicateOfExisting(id)) => {
                        Ok(self.already_processed(scope, id))
                    }
                    Ok(DuplicateCheck::Conflict(existing_id)) => {
                        Ok(self.rejected(scope, existing_id, candidate.id))
                    }
                    // The holder vanished between the insert and the
                    // re-read; let the caller retry against current state.
                    Ok(DuplicateCheck::New) => Ok(Outcome::Transient {
                        reason: "affiliation vanished between insert and re-read".to_owned(),
                    }),
                    Err(classify_error) => Ok(Outcome::Transient {
                        reason: classify_error.to_string(),
                    }),
                }
            }
            Err(store_error) => {
                if store_error.is_transient() {
                    warn!(
                        error = %store_error,
                        scope = %scope,
                        "transient store failure saving affiliation, caller should retry"
                    );
                } else {
                    error!(
                        error = %store_error,
                        scope = %scope,
                        "store failure saving affiliation"
                    );
                }
                Ok(Outcome::Transient {
                    reason: store_error.to_string(),
                })
            }
        }
    }

    /// Page of affiliations matching the predicate within the scope.
    pub async fn query_affiliations(
        &self,
        scope: &TenantScope,
        predicate: &Predicate,
        offset: i64,
        limit: i64,
    ) -> Result<AffiliationPage, StoreError> {
        self.store.query(scope, predicate, offset, limit).await
    }

    /// Remove every affiliation in the scope when a member tenant detaches
    /// from the consortium. Idempotent: revoking an empty scope succeeds
    /// with zero effect.
    pub async fn revoke_membership(&self, scope: &TenantScope) -> Result<u64, StoreError> {
        let removed = self.store.delete_all_for_tenant(scope).await?;
        warn!(
            scope = %scope,
            removed,
            "member tenant detached from the consortium, its affiliation registry is now empty"
        );
        Ok(removed)
    }

    fn already_processed(&self, scope: &TenantScope, id: Uuid) -> Outcome {
        info!(
            id = %id,
            scope = %scope,
            "duplicate affiliation claim received, skipped processing"
        );
        metrics::counter!("affiliations_duplicates_skipped_total").increment(1);
        Outcome::AlreadyProcessed { id }
    }

    fn rejected(&self, scope: &TenantScope, existing_id: Uuid, candidate_id: Uuid) -> Outcome {
        error!(
            existing_id = %existing_id,
            candidate_id = %candidate_id,
            scope = %scope,
            "affiliation claim clashes with an existing record for the same user and tenant"
        );
        metrics::counter!("affiliations_conflicts_total").increment(1);
        Outcome::Rejected {
            existing_id,
            candidate_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{FilterField, PredicateBuilder, QueryOp};
    use crate::store::memory::MemoryStore;

    fn service() -> AffiliationIngestionService {
        AffiliationIngestionService::new(Arc::new(MemoryStore::new()))
    }

    fn claim(id: Uuid, user_id: Uuid, tenant_id: &str) -> AffiliationClaim {
        AffiliationClaim {
            id: Some(id),
            user_id: Some(user_id),
            tenant_id: Some(tenant_id.to_string()),
            username: Some("joe".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn redelivered_claim_is_already_processed() {
        let service = service();
        let scope = TenantScope::new("member_a");
        let id = Uuid::now_v7();
        let c = claim(id, Uuid::now_v7(), "central");

        let first = service
            .ingest(&scope, c.clone(), ClaimOrigin::ConsortiumEvent)
            .await
            .unwrap();
        assert!(matches!(first, Outcome::Created(_)));

        let second = service
            .ingest(&scope, c, ClaimOrigin::ConsortiumEvent)
            .await
            .unwrap();
        assert_eq!(second, Outcome::AlreadyProcessed { id });

        // Exactly one record for the key.
        let page = service
            .query_affiliations(&scope, &Predicate::match_all(), 0, 10)
            .await
            .unwrap();
        assert_eq!(page.total_records, 1);
        assert_eq!(page.user_affiliations[0].id, id);
    }

    #[tokio::test]
    async fn conflicting_claim_is_rejected_and_not_persisted() {
        let service = service();
        let scope = TenantScope::new("member_a");
        let user_id = Uuid::now_v7();
        let first_id = Uuid::now_v7();

        service
            .ingest(
                &scope,
                claim(first_id, user_id, "central"),
                ClaimOrigin::ConsortiumEvent,
            )
            .await
            .unwrap();

        let rival_id = Uuid::now_v7();
        let outcome = service
            .ingest(
                &scope,
                claim(rival_id, user_id, "central"),
                ClaimOrigin::ConsortiumEvent,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Rejected {
                existing_id: first_id,
                candidate_id: rival_id,
            }
        );

        // The original record is untouched.
        let page = service
            .query_affiliations(&scope, &Predicate::match_all(), 0, 10)
            .await
            .unwrap();
        assert_eq!(page.total_records, 1);
        assert_eq!(page.user_affiliations[0].id, first_id);
    }

    #[tokio::test]
    async fn invalid_claim_never_reaches_the_store() {
        let service = service();
        let scope = TenantScope::new("member_a");

        let incomplete = AffiliationClaim {
            id: Some(Uuid::now_v7()),
            ..Default::default()
        };
        let result = service
            .ingest(&scope, incomplete, ClaimOrigin::Api)
            .await;
        assert_eq!(result, Err(ValidationError::MissingField("userId")));

        let page = service
            .query_affiliations(&scope, &Predicate::match_all(), 0, 10)
            .await
            .unwrap();
        assert_eq!(page.total_records, 0);
    }

    #[tokio::test]
    async fn concurrent_identical_claims_create_exactly_once() {
        let service = Arc::new(service());
        let scope = TenantScope::new("member_a");
        let c = claim(Uuid::now_v7(), Uuid::now_v7(), "central");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            let scope = scope.clone();
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                service
                    .ingest(&scope, c, ClaimOrigin::ConsortiumEvent)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut already_processed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Outcome::Created(_) => created += 1,
                Outcome::AlreadyProcessed { .. } => already_processed += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(already_processed, 15);

        let page = service
            .query_affiliations(&scope, &Predicate::match_all(), 0, 100)
            .await
            .unwrap();
        assert_eq!(page.total_records, 1);
    }

    #[tokio::test]
    async fn revocation_clears_one_scope_and_stays_idempotent() {
        let service = service();
        let member_a = TenantScope::new("member_a");
        let member_b = TenantScope::new("member_b");

        service
            .ingest(
                &member_a,
                claim(Uuid::now_v7(), Uuid::now_v7(), "central"),
                ClaimOrigin::ConsortiumEvent,
            )
            .await
            .unwrap();
        service
            .ingest(
                &member_b,
                claim(Uuid::now_v7(), Uuid::now_v7(), "central"),
                ClaimOrigin::ConsortiumEvent,
            )
            .await
            .unwrap();

        assert_eq!(service.revoke_membership(&member_a).await.unwrap(), 1);
        assert_eq!(service.revoke_membership(&member_a).await.unwrap(), 0);

        let revoked = service
            .query_affiliations(&member_a, &Predicate::match_all(), 0, 10)
            .await
            .unwrap();
        assert_eq!(revoked.total_records, 0);
        assert!(revoked.user_affiliations.is_empty());

        let untouched = service
            .query_affiliations(&member_b, &Predicate::match_all(), 0, 10)
            .await
            .unwrap();
        assert_eq!(untouched.total_records, 1);
    }

    #[tokio::test]
    async fn or_query_returns_union_of_matches() {
        let service = service();
        let scope = TenantScope::new("member_a");
        let u1 = Uuid::now_v7();

        service
            .ingest(&scope, claim(Uuid::now_v7(), u1, "t1"), ClaimOrigin::Api)
            .await
            .unwrap();
        service
            .ingest(
                &scope,
                claim(Uuid::now_v7(), Uuid::now_v7(), "t1"),
                ClaimOrigin::Api,
            )
            .await
            .unwrap();
        service
            .ingest(
                &scope,
                claim(Uuid::now_v7(), Uuid::now_v7(), "t2"),
                ClaimOrigin::Api,
            )
            .await
            .unwrap();

        let either = PredicateBuilder::new(QueryOp::Or)
            .field(FilterField::UserId, Some(u1.to_string().as_str()))
            .field(FilterField::TenantId, Some("t1"))
            .build();
        let page = service
            .query_affiliations(&scope, &either, 0, 10)
            .await
            .unwrap();
        assert_eq!(page.total_records, 2);
    }
}
