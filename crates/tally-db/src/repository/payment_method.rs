//! # Payment Method Repository
//!
//! Registry of payment methods and their classification. Only methods of
//! kind `cash` move the expected drawer amount of a session.
//!
//! Seeded defaults (ids equal codes): `cash`, `debit_card`, `credit_card`,
//! `transfer`, `qr`, `check`.

use sqlx::{SqliteConnection, SqlitePool};
use tally_core::validation::{validate_id, validate_text};
use tally_core::{LedgerError, LedgerResult, PaymentMethod, PaymentMethodKind, MAX_DESCRIPTION_LEN};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DbResult;
use crate::repository::rows::PaymentMethodRow;

const METHOD_COLUMNS: &str = "id, code, name, kind, is_active";

/// Repository for payment method operations.
#[derive(Debug, Clone)]
pub struct PaymentMethodRepository {
    pool: SqlitePool,
}

impl PaymentMethodRepository {
    /// Creates a new PaymentMethodRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PaymentMethodRepository { pool }
    }

    /// Gets a payment method by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<PaymentMethod>> {
        let sql = format!("SELECT {METHOD_COLUMNS} FROM payment_methods WHERE id = ?1");
        let row: Option<PaymentMethodRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PaymentMethod::from))
    }

    /// Gets a payment method by its business code.
    pub async fn find_by_code(&self, code: &str) -> DbResult<Option<PaymentMethod>> {
        let sql = format!("SELECT {METHOD_COLUMNS} FROM payment_methods WHERE code = ?1");
        let row: Option<PaymentMethodRow> = sqlx::query_as(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PaymentMethod::from))
    }

    /// Lists payment methods, active ones only unless `include_inactive`.
    pub async fn list(&self, include_inactive: bool) -> DbResult<Vec<PaymentMethod>> {
        let sql = format!(
            "SELECT {METHOD_COLUMNS} FROM payment_methods \
             WHERE is_active = 1 OR ?1 ORDER BY code"
        );
        let rows: Vec<PaymentMethodRow> = sqlx::query_as(&sql)
            .bind(include_inactive)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PaymentMethod::from).collect())
    }

    /// Registers a new payment method.
    pub async fn create(&self, code: &str, name: &str, kind: PaymentMethodKind) -> LedgerResult<PaymentMethod> {
        validate_id("code", code)?;
        validate_text("name", name, MAX_DESCRIPTION_LEN)?;

        let method = PaymentMethod {
            id: Uuid::new_v4().to_string(),
            code: code.trim().to_string(),
            name: name.trim().to_string(),
            kind,
            is_active: true,
        };

        debug!(code = %method.code, kind = ?kind, "Creating payment method");

        sqlx::query(
            "INSERT INTO payment_methods (id, code, name, kind, is_active) VALUES (?1, ?2, ?3, ?4, 1)",
        )
        .bind(&method.id)
        .bind(&method.code)
        .bind(&method.name)
        .bind(method.kind)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;

        info!(id = %method.id, code = %method.code, "Payment method created");
        Ok(method)
    }

    /// Activates or deactivates a method. Existing movements keep referencing it.
    pub async fn set_active(&self, id: &str, active: bool) -> LedgerResult<PaymentMethod> {
        let sql = format!(
            "UPDATE payment_methods SET is_active = ?2 WHERE id = ?1 RETURNING {METHOD_COLUMNS}"
        );
        let row: Option<PaymentMethodRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;

        row.map(PaymentMethod::from)
            .ok_or_else(|| LedgerError::not_found("payment method", id))
    }
}

/// Looks up a method inside a write transaction, rejecting unknown and
/// inactive ones.
pub(crate) async fn require_active(conn: &mut SqliteConnection, id: &str) -> LedgerResult<PaymentMethod> {
    let sql = format!("SELECT {METHOD_COLUMNS} FROM payment_methods WHERE id = ?1");
    let row: Option<PaymentMethodRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(crate::error::DbError::from)?;

    let method = row
        .map(PaymentMethod::from)
        .ok_or_else(|| LedgerError::not_found("payment method", id))?;

    if !method.is_active {
        return Err(LedgerError::InvalidState(format!(
            "payment method {} is inactive",
            method.code
        )));
    }

    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tally_core::ErrorKind;

    #[tokio::test]
    async fn test_seeded_methods() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let methods = db.payment_methods().list(false).await.unwrap();

        let codes: Vec<&str> = methods.iter().map(|m| m.code.as_str()).collect();
        for code in ["cash", "debit_card", "credit_card", "transfer", "qr", "check"] {
            assert!(codes.contains(&code), "missing seeded method {code}");
        }

        let cash = db.payment_methods().get("cash").await.unwrap().unwrap();
        assert!(cash.kind.is_physical_cash());
        let qr = db.payment_methods().find_by_code("qr").await.unwrap().unwrap();
        assert_eq!(qr.kind, PaymentMethodKind::Digital);
    }

    #[tokio::test]
    async fn test_create_and_deactivate() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.payment_methods();

        let voucher = repo.create("voucher", "Gift voucher", PaymentMethodKind::Other).await.unwrap();
        assert!(voucher.is_active);

        let duplicate = repo.create("voucher", "Again", PaymentMethodKind::Other).await;
        assert_eq!(duplicate.unwrap_err().kind(), ErrorKind::InvalidState);

        let inactive = repo.set_active(&voucher.id, false).await.unwrap();
        assert!(!inactive.is_active);
        assert!(!repo.list(false).await.unwrap().iter().any(|m| m.id == voucher.id));
        assert!(repo.list(true).await.unwrap().iter().any(|m| m.id == voucher.id));

        let missing = repo.set_active("nope", true).await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::EntityNotFound);
    }
}
