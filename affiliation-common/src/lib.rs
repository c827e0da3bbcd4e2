//! Shared core of the consortium affiliation registry.
//!
//! Both the management API and the event consumer funnel their writes
//! through [`ingest::AffiliationIngestionService`]; reads go through a
//! [`predicate::Predicate`] evaluated by an [`store::AffiliationStore`].

pub mod affiliation;
pub mod dedup;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod predicate;
pub mod store;
