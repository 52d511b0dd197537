// src/quote.rs
use crate::models::Quote;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

const ALPHAVANTAGE_URL: &str = "https://www.alphavantage.co/query";

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("provider refused the request: {0}")]
    Throttled(String),
}

/// Point-in-time price source. `Ok(None)` means the symbol does not resolve.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, QuoteError>;
}

/// Canonical form used for lookups and for the ledger: trimmed, upper case.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    global_quote: Option<GlobalQuote>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: Option<String>,
    #[serde(rename = "05. price")]
    price: Option<String>,
}

#[derive(Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<SymbolMatch>,
}

#[derive(Deserialize)]
struct SymbolMatch {
    #[serde(rename = "1. symbol")]
    symbol: String,
    #[serde(rename = "2. name")]
    name: String,
}

pub struct AlphaVantage {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantage {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: ALPHAVANTAGE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn query<T: DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<T, QuoteError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(QuoteError::Status(response.status()));
        }
        Ok(response.json::<T>().await?)
    }

    async fn company_name(&self, symbol: &str) -> Option<String> {
        let search = self
            .query::<SymbolSearchResponse>(&[("function", "SYMBOL_SEARCH"), ("keywords", symbol)])
            .await;
        match search {
            Ok(search) => best_match_name(search, symbol),
            Err(e) => {
                warn!("Symbol search for {} failed: {}", symbol, e);
                None
            }
        }
    }
}

#[async_trait]
impl QuoteProvider for AlphaVantage {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, QuoteError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Ok(None);
        }

        let response = self
            .query::<GlobalQuoteResponse>(&[("function", "GLOBAL_QUOTE"), ("symbol", symbol.as_str())])
            .await?;
        let Some((symbol, price)) = parse_global_quote(response)? else {
            info!("No quote for {}", symbol);
            return Ok(None);
        };

        let name = self
            .company_name(&symbol)
            .await
            .unwrap_or_else(|| symbol.clone());
        Ok(Some(Quote {
            symbol,
            name,
            price,
        }))
    }
}

fn parse_global_quote(
    response: GlobalQuoteResponse,
) -> Result<Option<(String, Decimal)>, QuoteError> {
    if let Some(message) = response.note.or(response.information) {
        return Err(QuoteError::Throttled(message));
    }
    let Some(quote) = response.global_quote else {
        return Ok(None);
    };
    let (Some(symbol), Some(price)) = (quote.symbol, quote.price) else {
        return Ok(None);
    };
    match Decimal::from_str(price.trim()) {
        Ok(price) if price > Decimal::ZERO => Ok(Some((normalize_symbol(&symbol), price))),
        _ => Ok(None),
    }
}

fn best_match_name(search: SymbolSearchResponse, symbol: &str) -> Option<String> {
    search
        .best_matches
        .into_iter()
        .find(|m| m.symbol.eq_ignore_ascii_case(symbol))
        .map(|m| m.name)
}
