// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type UserId = i64;

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    pub cash: Decimal,
}

/// One row of the append-only ledger. Positive shares are buys, negative are sells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: UserId,
    pub symbol: String,
    pub shares: i64,
    pub price_per_share: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub symbol: String,
    pub name: Option<String>,
    pub shares: i64,
    pub price: Option<Decimal>,
    pub value: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub cash: Decimal,
    pub positions: Vec<Position>,
    pub total: Decimal,
}

/// Result of a committed buy or sell.
#[derive(Debug, Clone, Serialize)]
pub struct TradeReceipt {
    pub transaction: Transaction,
    pub cash: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub cash: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub user_id: UserId,
    pub token: String,
}
