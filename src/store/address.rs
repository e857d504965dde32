//! Address bookkeeping: the local copy of the user's address list.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::remote::types::Address;

/// Replace the stored address set with `addresses` in one transaction:
/// upserts every entry (order preserved) and deletes entries the remote
/// no longer reports.
pub async fn replace_addresses(
    pool: &SqlitePool,
    user_id: &str,
    addresses: &[Address],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM addresses WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    for (ord, address) in addresses.iter().enumerate() {
        sqlx::query(
            "INSERT INTO addresses (user_id, id, email, receive, ord) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&address.id)
        .bind(&address.email)
        .bind(address.receive as i64)
        .bind(ord as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_addresses(pool: &SqlitePool, user_id: &str) -> Result<Vec<Address>> {
    let rows = sqlx::query("SELECT id, email, receive FROM addresses WHERE user_id = ? ORDER BY ord")
        .bind(user_id)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| Address {
            id: row.get("id"),
            email: row.get("email"),
            receive: row.get::<i64, _>("receive") != 0,
        })
        .collect())
}

/// Emails currently able to receive mail, in remote-reported order.
pub async fn receiving_emails(pool: &SqlitePool, user_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT email FROM addresses WHERE user_id = ? AND receive = 1 ORDER BY ord",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| row.get("email")).collect())
}
