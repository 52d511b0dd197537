// src/ledger.rs
use crate::auth::AuthContext;
use crate::db;
use crate::error::LedgerError;
use crate::models::{Balance, Portfolio, Position, Quote, TradeReceipt, Transaction, UserId};
use crate::quote::{normalize_symbol, QuoteProvider};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Net share count per symbol for one user, keeping only strictly positive nets.
///
/// Entries belonging to other users are ignored, so the full log can be passed.
pub fn holdings(user_id: UserId, log: &[Transaction]) -> BTreeMap<String, i64> {
    let mut net: BTreeMap<String, i64> = BTreeMap::new();
    for entry in log.iter().filter(|t| t.user_id == user_id) {
        let shares = net.entry(entry.symbol.clone()).or_insert(0);
        *shares = shares.saturating_add(entry.shares);
    }
    net.retain(|_, shares| *shares > 0);
    net
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// A validated order, priced at the quote it will execute at.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub side: Side,
    pub symbol: String,
    pub shares: i64,
    pub price: Decimal,
}

impl Trade {
    pub fn new(side: Side, request: TradeRequest, quote: &Quote) -> Self {
        Self {
            side,
            symbol: quote.symbol.clone(),
            shares: request.shares,
            price: quote.price,
        }
    }

    /// Share count as written to the log: positive for buys, negative for sells.
    pub fn signed_shares(&self) -> i64 {
        match self.side {
            Side::Buy => self.shares,
            Side::Sell => -self.shares,
        }
    }

    pub fn amount(&self) -> Result<Decimal, LedgerError> {
        let shares = Decimal::from(self.shares);
        self.price
            .checked_mul(shares)
            .filter(|amount| amount.checked_div(shares) == Some(self.price))
            .ok_or_else(|| LedgerError::validation("order value cannot be represented exactly"))
    }
}

/// Largest balance a deposit may bring a user's cash to.
pub const MAX_CASH: i64 = 1_000_000_000_000_000;

/// `a + b`, or `None` when the sum overflows or had to be rounded.
fn exact_sum(a: Decimal, b: Decimal) -> Option<Decimal> {
    let sum = a.checked_add(b)?;
    (sum.checked_sub(a) == Some(b)).then_some(sum)
}

/// Checks a trade against the current cash and holding and returns the new cash balance.
pub fn settle(cash: Decimal, held: i64, trade: &Trade) -> Result<Decimal, LedgerError> {
    let amount = trade.amount()?;
    match trade.side {
        Side::Buy => {
            if amount > cash {
                return Err(LedgerError::InsufficientFunds {
                    required: amount,
                    available: cash,
                });
            }
            exact_sum(cash, -amount)
                .ok_or_else(|| LedgerError::validation("order value cannot be represented exactly"))
        }
        Side::Sell => {
            if held <= 0 || held < trade.shares {
                return Err(LedgerError::Oversell {
                    symbol: trade.symbol.clone(),
                    requested: trade.shares,
                    held: held.max(0),
                });
            }
            exact_sum(cash, amount)
                .ok_or_else(|| LedgerError::validation("order value cannot be represented exactly"))
        }
    }
}

/// Returns the balance after depositing `amount` into `cash`.
pub fn credit(cash: Decimal, amount: Decimal) -> Result<Decimal, LedgerError> {
    let next = exact_sum(cash, amount)
        .ok_or_else(|| LedgerError::validation("amount cannot be represented exactly"))?;
    if next > Decimal::from(MAX_CASH) {
        return Err(LedgerError::validation(format!(
            "balance may not exceed {}",
            MAX_CASH
        )));
    }
    Ok(next)
}

/// Raw buy/sell body. Fields are optional so that missing input is a validation
/// error rather than a deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct TradeForm {
    pub symbol: Option<String>,
    pub shares: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRequest {
    pub symbol: String,
    pub shares: i64,
}

impl TryFrom<TradeForm> for TradeRequest {
    type Error = LedgerError;

    fn try_from(form: TradeForm) -> Result<Self, Self::Error> {
        let symbol = parse_symbol(form.symbol.as_deref())?;
        let shares = match form.shares {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match shares {
            Some(shares) if shares > 0 => Ok(Self { symbol, shares }),
            _ => Err(LedgerError::validation("shares must be a positive integer")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FundsForm {
    pub amount: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundsRequest {
    pub amount: Decimal,
}

impl TryFrom<FundsForm> for FundsRequest {
    type Error = LedgerError;

    fn try_from(form: FundsForm) -> Result<Self, Self::Error> {
        let amount = match form.amount {
            Some(Value::Number(n)) => parse_decimal(&n.to_string()),
            Some(Value::String(s)) => parse_decimal(s.trim()),
            _ => None,
        };
        match amount {
            Some(amount) if amount <= Decimal::ZERO => {
                Err(LedgerError::validation("amount must be positive"))
            }
            Some(amount) if amount.normalize().scale() > 2 => Err(LedgerError::validation(
                "amount may have at most 2 decimal places",
            )),
            Some(amount) if amount > Decimal::from(MAX_CASH) => Err(LedgerError::validation(
                format!("amount may not exceed {}", MAX_CASH),
            )),
            Some(amount) => Ok(Self { amount }),
            None => Err(LedgerError::validation("amount must be a real number")),
        }
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

pub fn parse_symbol(raw: Option<&str>) -> Result<String, LedgerError> {
    let symbol = normalize_symbol(raw.unwrap_or_default());
    if symbol.is_empty() {
        return Err(LedgerError::validation("must provide symbol"));
    }
    Ok(symbol)
}

async fn resolve(quotes: &dyn QuoteProvider, symbol: &str) -> Result<Quote, LedgerError> {
    quotes
        .lookup(symbol)
        .await?
        .ok_or_else(|| LedgerError::UnknownSymbol(symbol.to_string()))
}

pub async fn quote(quotes: &dyn QuoteProvider, symbol: &str) -> Result<Quote, LedgerError> {
    let symbol = parse_symbol(Some(symbol))?;
    resolve(quotes, &symbol).await
}

pub async fn buy(
    pool: &SqlitePool,
    quotes: &dyn QuoteProvider,
    ctx: &AuthContext,
    form: TradeForm,
) -> Result<TradeReceipt, LedgerError> {
    trade(pool, quotes, ctx, Side::Buy, form).await
}

pub async fn sell(
    pool: &SqlitePool,
    quotes: &dyn QuoteProvider,
    ctx: &AuthContext,
    form: TradeForm,
) -> Result<TradeReceipt, LedgerError> {
    trade(pool, quotes, ctx, Side::Sell, form).await
}

async fn trade(
    pool: &SqlitePool,
    quotes: &dyn QuoteProvider,
    ctx: &AuthContext,
    side: Side,
    form: TradeForm,
) -> Result<TradeReceipt, LedgerError> {
    let request = TradeRequest::try_from(form)?;
    let quote = resolve(quotes, &request.symbol).await?;
    let trade = Trade::new(side, request, &quote);
    let receipt = db::record_trade(pool, ctx.user_id, &trade).await?;
    info!(
        "User {} {:?} {} {} @ {}",
        ctx.user_id, side, trade.shares, trade.symbol, trade.price
    );
    Ok(receipt)
}

pub async fn add_funds(
    pool: &SqlitePool,
    ctx: &AuthContext,
    form: FundsForm,
) -> Result<Balance, LedgerError> {
    let request = FundsRequest::try_from(form)?;
    let cash = db::deposit(pool, ctx.user_id, request.amount).await?;
    Ok(Balance { cash })
}

pub async fn history(pool: &SqlitePool, ctx: &AuthContext) -> Result<Vec<Transaction>, LedgerError> {
    db::transactions_for(pool, ctx.user_id).await
}

/// Current cash plus every active holding priced at its latest quote.
///
/// A holding whose quote cannot be fetched is listed without a price and left
/// out of the total.
pub async fn portfolio(
    pool: &SqlitePool,
    quotes: &dyn QuoteProvider,
    ctx: &AuthContext,
) -> Result<Portfolio, LedgerError> {
    let cash = db::find_user(pool, ctx.user_id).await?.cash;
    let log = db::transactions_for(pool, ctx.user_id).await?;

    let mut total = cash;
    let mut positions = Vec::new();
    for (symbol, shares) in holdings(ctx.user_id, &log) {
        let quote = match quotes.lookup(&symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("Quote for {} unavailable: {}", symbol, e);
                None
            }
        };
        let position = match quote {
            Some(quote) => {
                let value = quote.price.checked_mul(Decimal::from(shares));
                match value.and_then(|v| total.checked_add(v)) {
                    Some(sum) => total = sum,
                    None => warn!("Value of {} {} left out of the total", shares, symbol),
                }
                Position {
                    symbol,
                    name: Some(quote.name),
                    shares,
                    price: Some(quote.price),
                    value,
                }
            }
            None => Position {
                symbol,
                name: None,
                shares,
                price: None,
                value: None,
            },
        };
        positions.push(position);
    }

    Ok(Portfolio {
        cash,
        positions,
        total,
    })
}
