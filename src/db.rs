// src/db.rs
use crate::error::LedgerError;
use crate::ledger::{credit, holdings, settle, Trade};
use crate::models::{TradeReceipt, Transaction, User, UserId};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

pub const STARTING_CASH: &str = "10000.00";

pub async fn init(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::query(&format!(
        r#"
            CREATE TABLE IF NOT EXISTS users(
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                username TEXT NOT NULL UNIQUE,
                hash TEXT NOT NULL,
                cash TEXT NOT NULL DEFAULT '{STARTING_CASH}'
            );

            CREATE TABLE IF NOT EXISTS transactions(
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id),
                symbol TEXT NOT NULL,
                shares INTEGER NOT NULL CHECK (shares <> 0),
                price_per_share TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_user_symbol ON transactions(user_id, symbol);
            CREATE INDEX IF NOT EXISTS idx_transactions_user_created ON transactions(user_id, created_at);
        "#
    ))
    .execute(&pool)
    .await?;

    info!("Database ready at {}", database_url);
    Ok(pool)
}

fn decimal(raw: &str, column: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(raw)
        .map_err(|e| LedgerError::CorruptRecord(format!("{} {:?}: {}", column, raw, e)))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User, LedgerError> {
    let cash: String = row.try_get("cash")?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("hash")?,
        cash: decimal(&cash, "cash")?,
    })
}

fn transaction_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction, LedgerError> {
    let price: String = row.try_get("price_per_share")?;
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| LedgerError::CorruptRecord(format!("created_at {:?}: {}", created_at, e)))?
        .with_timezone(&Utc);
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        shares: row.try_get("shares")?,
        price_per_share: decimal(&price, "price_per_share")?,
        created_at,
    })
}

pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    password_hash: &str,
) -> Result<UserId, LedgerError> {
    let result = sqlx::query("INSERT INTO users (username, hash) VALUES (?, ?)")
        .bind(username)
        .bind(password_hash)
        .execute(pool)
        .await;
    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(LedgerError::Conflict("username taken".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn find_user(pool: &SqlitePool, user_id: UserId) -> Result<User, LedgerError> {
    let row = sqlx::query("SELECT id, username, hash, cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(LedgerError::UserNotFound(user_id))?;
    user_from_row(&row)
}

pub async fn find_user_by_name(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, LedgerError> {
    let row = sqlx::query("SELECT id, username, hash, cash FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn update_password_hash(
    pool: &SqlitePool,
    user_id: UserId,
    password_hash: &str,
) -> Result<(), LedgerError> {
    let done = sqlx::query("UPDATE users SET hash = ? WHERE id = ?")
        .bind(password_hash)
        .bind(user_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(LedgerError::UserNotFound(user_id));
    }
    Ok(())
}

async fn load_log(
    conn: &mut SqliteConnection,
    user_id: UserId,
    symbol: Option<&str>,
) -> Result<Vec<Transaction>, LedgerError> {
    let rows = match symbol {
        Some(symbol) => {
            sqlx::query(
                "SELECT id, user_id, symbol, shares, price_per_share, created_at FROM transactions WHERE user_id = ? AND symbol = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(user_id)
            .bind(symbol)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, user_id, symbol, shares, price_per_share, created_at FROM transactions WHERE user_id = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(user_id)
            .fetch_all(&mut *conn)
            .await?
        }
    };
    rows.iter().map(transaction_from_row).collect()
}

/// The user's ledger in history order.
pub async fn transactions_for(
    pool: &SqlitePool,
    user_id: UserId,
) -> Result<Vec<Transaction>, LedgerError> {
    let mut conn = pool.acquire().await?;
    load_log(&mut *conn, user_id, None).await
}

/// Reads the user's cash inside `conn`'s transaction, returning the parsed value
/// together with the stored text used for the compare-and-swap.
async fn read_cash(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> Result<(Decimal, String), LedgerError> {
    let raw = sqlx::query_scalar::<_, String>("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(LedgerError::UserNotFound(user_id))?;
    Ok((decimal(&raw, "cash")?, raw))
}

async fn swap_cash(
    conn: &mut SqliteConnection,
    user_id: UserId,
    expected: &str,
    next: Decimal,
) -> Result<(), LedgerError> {
    let done = sqlx::query("UPDATE users SET cash = ? WHERE id = ? AND cash = ?")
        .bind(next.to_string())
        .bind(user_id)
        .bind(expected)
        .execute(&mut *conn)
        .await?;
    if done.rows_affected() != 1 {
        warn!("Cash for user {} changed underneath an update", user_id);
        return Err(LedgerError::ConcurrentModification);
    }
    Ok(())
}

/// Applies a buy or sell as one unit: cash update and log append commit together
/// or not at all. Failed preconditions leave the ledger untouched.
pub async fn record_trade(
    pool: &SqlitePool,
    user_id: UserId,
    trade: &Trade,
) -> Result<TradeReceipt, LedgerError> {
    let mut tx = pool.begin().await?;

    let (cash, raw_cash) = read_cash(&mut *tx, user_id).await?;
    let log = load_log(&mut *tx, user_id, Some(&trade.symbol)).await?;
    let held = holdings(user_id, &log)
        .get(&trade.symbol)
        .copied()
        .unwrap_or(0);
    let next = settle(cash, held, trade)?;

    swap_cash(&mut *tx, user_id, &raw_cash, next).await?;

    let created_at = Utc::now();
    let done = sqlx::query(
        r#"
            INSERT INTO transactions (
                user_id, symbol, shares, price_per_share, created_at
            ) VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(&trade.symbol)
    .bind(trade.signed_shares())
    .bind(trade.price.to_string())
    .bind(timestamp(created_at))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(TradeReceipt {
        transaction: Transaction {
            id: done.last_insert_rowid(),
            user_id,
            symbol: trade.symbol.clone(),
            shares: trade.signed_shares(),
            price_per_share: trade.price,
            created_at,
        },
        cash: next,
    })
}

/// Adds `amount` to the user's cash and returns the new balance.
pub async fn deposit(
    pool: &SqlitePool,
    user_id: UserId,
    amount: Decimal,
) -> Result<Decimal, LedgerError> {
    let mut tx = pool.begin().await?;
    let (cash, raw_cash) = read_cash(&mut *tx, user_id).await?;
    let next = credit(cash, amount)?;
    swap_cash(&mut *tx, user_id, &raw_cash, next).await?;
    tx.commit().await?;
    info!("User {} deposited {}", user_id, amount);
    Ok(next)
}
