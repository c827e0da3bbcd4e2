use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;
use uuid::Uuid;

use crate::affiliation::{Affiliation, TenantScope};
use crate::predicate::{Predicate, QueryOp};
use crate::store::{AffiliationPage, AffiliationStore, StoreError};

const COLUMNS: &str = "id, user_id, tenant_id, username, email, phone_number, \
                       mobile_phone_number, barcode, external_system_id, is_primary, created_at";

/// [`AffiliationStore`] backed by the `user_affiliations` table (DDL under
/// `migrations/`). The unique index on `(scope, user_id, tenant_id)` is the
/// arbiter for concurrent same-key inserts.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::Connection { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Render the predicate into a WHERE fragment. `$1` is always the
    /// scope; clause values bind from `$2` onwards, in clause order.
    fn render_where(predicate: &Predicate) -> String {
        let mut sql = String::from("scope = $1");
        if !predicate.is_empty() {
            let op = match predicate.op() {
                QueryOp::And => " AND ",
                QueryOp::Or => " OR ",
            };
            let clauses = predicate
                .clauses()
                .iter()
                .enumerate()
                .map(|(i, clause)| format!("{} = ${}", clause.field().column_expr(), i + 2))
                .collect::<Vec<_>>()
                .join(op);
            sql.push_str(" AND (");
            sql.push_str(&clauses);
            sql.push(')');
        }
        sql
    }
}

#[async_trait]
impl AffiliationStore for PostgresStore {
    async fn insert(
        &self,
        scope: &TenantScope,
        record: Affiliation,
    ) -> Result<Affiliation, StoreError> {
        let sql = format!(
            r#"
INSERT INTO user_affiliations
    (scope, id, user_id, tenant_id, username, email, phone_number,
     mobile_phone_number, barcode, external_system_id, is_primary)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
RETURNING {COLUMNS}
            "#
        );

        sqlx::query_as::<_, Affiliation>(&sql)
            .bind(scope.as_str())
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.tenant_id)
            .bind(&record.username)
            .bind(&record.email)
            .bind(&record.phone_number)
            .bind(&record.mobile_phone_number)
            .bind(&record.barcode)
            .bind(&record.external_system_id)
            .bind(record.is_primary)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::Conflict {
                        user_id: record.user_id,
                        tenant_id: record.tenant_id.clone(),
                    }
                } else {
                    StoreError::Query {
                        command: "INSERT",
                        error,
                    }
                }
            })
    }

    async fn find_by_key(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Affiliation>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM user_affiliations \
             WHERE scope = $1 AND user_id = $2 AND tenant_id = $3"
        );

        sqlx::query_as::<_, Affiliation>(&sql)
            .bind(scope.as_str())
            .bind(user_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })
    }

    async fn exists_by_key(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM user_affiliations \
             WHERE scope = $1 AND user_id = $2 AND tenant_id = $3)",
        )
        .bind(scope.as_str())
        .bind(user_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT",
            error,
        })
    }

    async fn query(
        &self,
        scope: &TenantScope,
        predicate: &Predicate,
        offset: i64,
        limit: i64,
    ) -> Result<AffiliationPage, StoreError> {
        let where_sql = Self::render_where(predicate);

        let count_sql = format!("SELECT COUNT(*) FROM user_affiliations WHERE {where_sql}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(scope.as_str());
        for clause in predicate.clauses() {
            count_query = count_query.bind(clause.value());
        }
        let total_records = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;

        if limit == 0 {
            return Ok(AffiliationPage {
                user_affiliations: Vec::new(),
                total_records,
            });
        }

        let next_bind = predicate.clauses().len() + 2;
        let rows_sql = format!(
            "SELECT {COLUMNS} FROM user_affiliations WHERE {where_sql} \
             ORDER BY created_at, id OFFSET ${next_bind} LIMIT ${}",
            next_bind + 1
        );
        let mut rows_query = sqlx::query_as::<_, Affiliation>(&rows_sql).bind(scope.as_str());
        for clause in predicate.clauses() {
            rows_query = rows_query.bind(clause.value());
        }
        let user_affiliations = rows_query
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT",
                error,
            })?;

        Ok(AffiliationPage {
            user_affiliations,
            total_records,
        })
    }

    async fn delete_all_for_tenant(&self, scope: &TenantScope) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_affiliations WHERE scope = $1")
            .bind(scope.as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "DELETE",
                error,
            })?;

        Ok(result.rows_affected())
    }
}

/// Determines if a sqlx::Error is the unique index rejecting a duplicate
/// natural key.
pub fn is_unique_violation(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => {
            // 23505 = unique_violation
            // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = db_error.code() {
                code.as_ref() == "23505"
            } else {
                db_error
                    .message()
                    .to_lowercase()
                    .contains("unique constraint")
            }
        }
        _ => false,
    }
}

/// Determines if a sqlx::Error represents a transient failure that should
/// be retried.
pub fn is_transient_error(error: &SqlxError) -> bool {
    match error {
        // Connection/pool issues: usually transient.
        SqlxError::Io(_)
        | SqlxError::PoolTimedOut
        | SqlxError::PoolClosed
        // TLS/handshake can be transient (network/cert rollover).
        | SqlxError::Tls(_) => true,

        // Database-specific errors: prefer SQLSTATE when available.
        SqlxError::Database(db_error) => {
            if let Some(code) = db_error.code() {
                let code = code.as_ref();

                // See: PostgreSQL SQLSTATE appendix
                // 08***  Connection Exception
                // 53***  Insufficient Resources
                // 57***  Operator Intervention
                // 58***  System Error (often transient)
                // 40001  Serialization Failure
                // 40003  Statement Completion Unknown (retry if idempotent)
                // 40P01  Deadlock Detected
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40003"
                    || code == "40P01"
            } else {
                // Last resort: message heuristics (less reliable than SQLSTATE).
                let msg = db_error.message().to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("deadlock")
                    || msg.contains("serialization")
            }
        }

        // Protocol glitches may be transient.
        SqlxError::Protocol(msg) => {
            let m = msg.to_lowercase();
            m.contains("connection") || m.contains("timeout") || m.contains("ssl") || m.contains("tls")
        }

        // Default: assume non-transient since we're not sure about the error type.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{FilterField, PredicateBuilder, QueryOp};

    // Mock database error so classification is testable without a live
    // Postgres.
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::{borrow::Cow, error::Error as StdError, fmt};

    #[derive(Debug)]
    struct MockDbError {
        msg: &'static str,
        code: Option<&'static str>,
        kind: ErrorKind,
    }

    impl fmt::Display for MockDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl StdError for MockDbError {}

    impl DatabaseError for MockDbError {
        fn message(&self) -> &str {
            self.msg
        }

        fn kind(&self) -> ErrorKind {
            match self.kind {
                ErrorKind::UniqueViolation => ErrorKind::UniqueViolation,
                ErrorKind::ForeignKeyViolation => ErrorKind::ForeignKeyViolation,
                ErrorKind::NotNullViolation => ErrorKind::NotNullViolation,
                ErrorKind::CheckViolation => ErrorKind::CheckViolation,
                _ => ErrorKind::Other,
            }
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::from)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }
    }

    fn db_err(msg: &'static str, code: Option<&'static str>, kind: ErrorKind) -> SqlxError {
        SqlxError::from(MockDbError { msg, code, kind })
    }

    #[test]
    fn unique_violation_detected_by_sqlstate() {
        let unique = db_err(
            "duplicate key value violates unique constraint \"user_affiliations_scope_user_tenant\"",
            Some("23505"),
            ErrorKind::UniqueViolation,
        );
        assert!(is_unique_violation(&unique));
        // A duplicate key is permanent, never worth a redelivery.
        assert!(!is_transient_error(&unique));

        let fk = db_err(
            "insert violates foreign key constraint",
            Some("23503"),
            ErrorKind::ForeignKeyViolation,
        );
        assert!(!is_unique_violation(&fk));
    }

    #[test]
    fn unique_violation_message_fallback() {
        let no_code = db_err(
            "duplicate key value violates unique constraint",
            None,
            ErrorKind::UniqueViolation,
        );
        assert!(is_unique_violation(&no_code));

        assert!(!is_unique_violation(&SqlxError::RowNotFound));
    }

    #[test]
    fn transient_connection_errors() {
        assert!(is_transient_error(&SqlxError::PoolTimedOut));
        assert!(is_transient_error(&SqlxError::PoolClosed));
        assert!(is_transient_error(&SqlxError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))));
    }

    #[test]
    fn transient_sqlstate_classes() {
        // 08*** Connection Exception
        assert!(is_transient_error(&db_err(
            "connection dropped unexpectedly",
            Some("08006"),
            ErrorKind::Other
        )));
        // 57014 statement_timeout
        assert!(is_transient_error(&db_err(
            "canceling statement due to statement timeout",
            Some("57014"),
            ErrorKind::Other
        )));
        // 40P01 deadlock
        assert!(is_transient_error(&db_err(
            "deadlock detected",
            Some("40P01"),
            ErrorKind::Other
        )));
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        // Syntax errors and data exceptions don't resolve on retry.
        assert!(!is_transient_error(&db_err(
            "syntax error at or near \"SELECT\"",
            Some("42601"),
            ErrorKind::Other
        )));
        assert!(!is_transient_error(&db_err(
            "invalid input syntax for type uuid",
            Some("22P02"),
            ErrorKind::Other
        )));
        assert!(!is_transient_error(&SqlxError::RowNotFound));
    }

    #[test]
    fn where_clause_rendering() {
        assert_eq!(
            PostgresStore::render_where(&Predicate::match_all()),
            "scope = $1"
        );

        let and = PredicateBuilder::new(QueryOp::And)
            .field(FilterField::Username, Some("Joe"))
            .field(FilterField::TenantId, Some("central"))
            .build();
        assert_eq!(
            PostgresStore::render_where(&and),
            "scope = $1 AND (lower(username) = $2 AND tenant_id = $3)"
        );

        let or = PredicateBuilder::new(QueryOp::Or)
            .field(FilterField::UserId, Some("ABC"))
            .field(FilterField::Barcode, Some("b-1"))
            .build();
        assert_eq!(
            PostgresStore::render_where(&or),
            "scope = $1 AND (user_id::text = $2 OR barcode = $3)"
        );
    }
}
