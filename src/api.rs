// src/api.rs
use crate::auth::{self, AuthContext, LoginForm, PasswordForm, RegisterForm, TokenIssuer};
use crate::error::{handle_rejection, reject, LedgerError};
use crate::ledger::{self, FundsForm, TradeForm};
use crate::quote::QuoteProvider;
use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, EXPIRES, PRAGMA};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Deserialize)]
struct CheckQuery {
    username: Option<String>,
}

pub fn routes(
    pool: SqlitePool,
    quotes: Arc<dyn QuoteProvider>,
    tokens: Arc<TokenIssuer>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let check = warp::path!("check")
        .and(warp::get())
        .and(warp::query::<CheckQuery>())
        .and(with_pool(pool.clone()))
        .and_then(check_handler);

    let register = warp::path!("register")
        .and(warp::post())
        .and(json_body::<RegisterForm>())
        .and(with_pool(pool.clone()))
        .and(with_tokens(tokens.clone()))
        .and_then(register_handler);

    let login = warp::path!("login")
        .and(warp::post())
        .and(json_body::<LoginForm>())
        .and(with_pool(pool.clone()))
        .and(with_tokens(tokens.clone()))
        .and_then(login_handler);

    let password = warp::path!("password")
        .and(warp::post())
        .and(with_auth(tokens.clone()))
        .and(json_body::<PasswordForm>())
        .and(with_pool(pool.clone()))
        .and_then(password_handler);

    let index = warp::path::end()
        .and(warp::get())
        .and(with_auth(tokens.clone()))
        .and(with_pool(pool.clone()))
        .and(with_quotes(quotes.clone()))
        .and_then(portfolio_handler);

    let quote = warp::path!("quote" / String)
        .and(warp::get())
        .and(with_auth(tokens.clone()))
        .and(with_quotes(quotes.clone()))
        .and_then(quote_handler);

    let buy = warp::path!("buy")
        .and(warp::post())
        .and(with_auth(tokens.clone()))
        .and(json_body::<TradeForm>())
        .and(with_pool(pool.clone()))
        .and(with_quotes(quotes.clone()))
        .and_then(buy_handler);

    let sell = warp::path!("sell")
        .and(warp::post())
        .and(with_auth(tokens.clone()))
        .and(json_body::<TradeForm>())
        .and(with_pool(pool.clone()))
        .and(with_quotes(quotes))
        .and_then(sell_handler);

    let history = warp::path!("history")
        .and(warp::get())
        .and(with_auth(tokens.clone()))
        .and(with_pool(pool.clone()))
        .and_then(history_handler);

    let add_funds = warp::path!("funds" / "add")
        .and(warp::post())
        .and(with_auth(tokens))
        .and(json_body::<FundsForm>())
        .and(with_pool(pool))
        .and_then(add_funds_handler);

    check
        .or(register)
        .or(login)
        .or(password)
        .or(index)
        .or(quote)
        .or(buy)
        .or(sell)
        .or(history)
        .or(add_funds)
        .recover(handle_rejection)
        .with(warp::reply::with::headers(no_cache_headers()))
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

fn with_pool(
    pool: SqlitePool,
) -> impl Filter<Extract = (SqlitePool,), Error = Infallible> + Clone {
    warp::any().map(move || pool.clone())
}

fn with_quotes(
    quotes: Arc<dyn QuoteProvider>,
) -> impl Filter<Extract = (Arc<dyn QuoteProvider>,), Error = Infallible> + Clone {
    warp::any().map(move || quotes.clone())
}

fn with_tokens(
    tokens: Arc<TokenIssuer>,
) -> impl Filter<Extract = (Arc<TokenIssuer>,), Error = Infallible> + Clone {
    warp::any().map(move || tokens.clone())
}

fn with_auth(
    tokens: Arc<TokenIssuer>,
) -> impl Filter<Extract = (AuthContext,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_tokens(tokens))
        .and_then(|header: Option<String>, tokens: Arc<TokenIssuer>| async move {
            tokens
                .authorize(header.as_deref())
                .map_err(|e| reject(LedgerError::from(e)))
        })
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

async fn check_handler(query: CheckQuery, pool: SqlitePool) -> Result<impl Reply, Rejection> {
    let username = query.username.unwrap_or_default();
    match auth::check_username(&pool, &username).await {
        Ok(available) => Ok(warp::reply::json(&available)),
        Err(e) => {
            error!("Failed to check username: {}", e);
            Err(reject(e))
        }
    }
}

async fn register_handler(
    form: RegisterForm,
    pool: SqlitePool,
    tokens: Arc<TokenIssuer>,
) -> Result<impl Reply, Rejection> {
    match auth::register(&pool, &tokens, form).await {
        Ok(registered) => {
            info!("Registered user {}.", registered.user_id);
            Ok(warp::reply::with_status(
                warp::reply::json(&registered),
                StatusCode::CREATED,
            ))
        }
        Err(e) => {
            error!("Failed to register: {}", e);
            Err(reject(e))
        }
    }
}

async fn login_handler(
    form: LoginForm,
    pool: SqlitePool,
    tokens: Arc<TokenIssuer>,
) -> Result<impl Reply, Rejection> {
    match auth::login(&pool, &tokens, form).await {
        Ok(session) => Ok(warp::reply::json(&session)),
        Err(e) => {
            error!("Failed to log in: {}", e);
            Err(reject(e))
        }
    }
}

async fn password_handler(
    ctx: AuthContext,
    form: PasswordForm,
    pool: SqlitePool,
) -> Result<impl Reply, Rejection> {
    match auth::change_password(&pool, &ctx, form).await {
        Ok(()) => Ok(warp::reply::json(&json!({"message": "Changed!"}))),
        Err(e) => {
            error!("Failed to change password for user {}: {}", ctx.user_id, e);
            Err(reject(e))
        }
    }
}

async fn portfolio_handler(
    ctx: AuthContext,
    pool: SqlitePool,
    quotes: Arc<dyn QuoteProvider>,
) -> Result<impl Reply, Rejection> {
    match ledger::portfolio(&pool, quotes.as_ref(), &ctx).await {
        Ok(portfolio) => Ok(warp::reply::json(&portfolio)),
        Err(e) => {
            error!("Failed to load portfolio for user {}: {}", ctx.user_id, e);
            Err(reject(e))
        }
    }
}

async fn quote_handler(
    symbol: String,
    ctx: AuthContext,
    quotes: Arc<dyn QuoteProvider>,
) -> Result<impl Reply, Rejection> {
    match ledger::quote(quotes.as_ref(), &symbol).await {
        Ok(quote) => Ok(warp::reply::json(&quote)),
        Err(e) => {
            error!("Quote for {} failed (user {}): {}", symbol, ctx.user_id, e);
            Err(reject(e))
        }
    }
}

async fn buy_handler(
    ctx: AuthContext,
    form: TradeForm,
    pool: SqlitePool,
    quotes: Arc<dyn QuoteProvider>,
) -> Result<impl Reply, Rejection> {
    match ledger::buy(&pool, quotes.as_ref(), &ctx, form).await {
        Ok(receipt) => Ok(warp::reply::with_status(
            warp::reply::json(&receipt),
            StatusCode::CREATED,
        )),
        Err(e) => {
            error!("Buy failed for user {}: {}", ctx.user_id, e);
            Err(reject(e))
        }
    }
}

async fn sell_handler(
    ctx: AuthContext,
    form: TradeForm,
    pool: SqlitePool,
    quotes: Arc<dyn QuoteProvider>,
) -> Result<impl Reply, Rejection> {
    match ledger::sell(&pool, quotes.as_ref(), &ctx, form).await {
        Ok(receipt) => Ok(warp::reply::with_status(
            warp::reply::json(&receipt),
            StatusCode::CREATED,
        )),
        Err(e) => {
            error!("Sell failed for user {}: {}", ctx.user_id, e);
            Err(reject(e))
        }
    }
}

async fn history_handler(ctx: AuthContext, pool: SqlitePool) -> Result<impl Reply, Rejection> {
    match ledger::history(&pool, &ctx).await {
        Ok(transactions) => Ok(warp::reply::json(&transactions)),
        Err(e) => {
            error!("Failed to load history for user {}: {}", ctx.user_id, e);
            Err(reject(e))
        }
    }
}

async fn add_funds_handler(
    ctx: AuthContext,
    form: FundsForm,
    pool: SqlitePool,
) -> Result<impl Reply, Rejection> {
    match ledger::add_funds(&pool, &ctx, form).await {
        Ok(balance) => {
            info!("Funds added for user {}.", ctx.user_id);
            Ok(warp::reply::json(&balance))
        }
        Err(e) => {
            error!("Failed to add funds for user {}: {}", ctx.user_id, e);
            Err(reject(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_pool;
    use crate::ledger::tests::quotes_at;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use serde_json::Value;
    use std::str::FromStr;

    struct Harness {
        pool: SqlitePool,
        tokens: Arc<TokenIssuer>,
        quotes: Arc<dyn QuoteProvider>,
    }

    impl Harness {
        async fn new(price: Decimal) -> Self {
            Self {
                pool: memory_pool().await,
                tokens: Arc::new(TokenIssuer::new("api-test", Duration::hours(1))),
                quotes: Arc::new(quotes_at(price)),
            }
        }

        fn api(&self) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
            routes(self.pool.clone(), self.quotes.clone(), self.tokens.clone())
        }

        async fn register(&self, username: &str) -> String {
            let resp = warp::test::request()
                .method("POST")
                .path("/register")
                .json(&json!({"username": username, "password": "pw", "confirmation": "pw"}))
                .reply(&self.api())
                .await;
            assert_eq!(resp.status(), StatusCode::CREATED);
            let body: Value = serde_json::from_slice(resp.body()).unwrap();
            format!("Bearer {}", body["token"].as_str().unwrap())
        }

        async fn post(&self, token: &str, path: &str, body: Value) -> (StatusCode, Value) {
            let resp = warp::test::request()
                .method("POST")
                .path(path)
                .header("authorization", token)
                .json(&body)
                .reply(&self.api())
                .await;
            (resp.status(), serde_json::from_slice(resp.body()).unwrap())
        }

        async fn get(&self, token: &str, path: &str) -> (StatusCode, Value) {
            let resp = warp::test::request()
                .method("GET")
                .path(path)
                .header("authorization", token)
                .reply(&self.api())
                .await;
            (resp.status(), serde_json::from_slice(resp.body()).unwrap())
        }
    }

    fn money(value: &Value) -> Decimal {
        Decimal::from_str(value.as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn trading_flow_over_http() {
        let h = Harness::new(Decimal::new(5000, 2)).await;
        let token = h.register("alice").await;

        let (status, receipt) = h
            .post(&token, "/buy", json!({"symbol": "aaa", "shares": "10"}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(money(&receipt["cash"]), Decimal::new(950000, 2));
        assert_eq!(receipt["transaction"]["shares"], json!(10));
        assert_eq!(receipt["transaction"]["symbol"], json!("AAA"));

        let (status, portfolio) = h.get(&token, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(portfolio["positions"][0]["shares"], json!(10));
        assert_eq!(money(&portfolio["total"]), Decimal::new(1_000_000, 2));

        let (status, body) = h
            .post(&token, "/sell", json!({"symbol": "AAA", "shares": 100}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("OVERSELL"));

        let (status, history) = h.get(&token, "/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejections_carry_codes() {
        let h = Harness::new(Decimal::new(5000, 2)).await;
        let token = h.register("bob").await;

        let (status, body) = h
            .post(&token, "/buy", json!({"symbol": "ZZZZ", "shares": 1}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("UNKNOWN_SYMBOL"));

        let (_, body) = h
            .post(&token, "/buy", json!({"symbol": "AAA", "shares": 0}))
            .await;
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (_, body) = h
            .post(&token, "/buy", json!({"symbol": "AAA", "shares": 1000}))
            .await;
        assert_eq!(body["code"], json!("INSUFFICIENT_FUNDS"));

        let (status, body) = h.get(&token, "/quote/zzzz").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("UNKNOWN_SYMBOL"));

        let (status, portfolio) = h.get(&token, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(money(&portfolio["cash"]), Decimal::new(1_000_000, 2));
        assert!(portfolio["positions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn funds_and_quotes() {
        let h = Harness::new(Decimal::new(12345, 2)).await;
        let token = h.register("carol").await;

        let (status, body) = h.post(&token, "/funds/add", json!({"amount": "99.50"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(money(&body["cash"]), Decimal::new(1_009_950, 2));

        let (status, body) = h.post(&token, "/funds/add", json!({"amount": -10})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (status, quote) = h.get(&token, "/quote/aaa").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(quote["symbol"], json!("AAA"));
        assert_eq!(money(&quote["price"]), Decimal::new(12345, 2));
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let h = Harness::new(Decimal::ONE).await;
        let token = h.register("erin").await;

        let form = warp::test::request()
            .method("POST")
            .path("/buy")
            .header("authorization", &token)
            .header("content-type", "application/x-www-form-urlencoded")
            .body("symbol=AAA&shares=1")
            .reply(&h.api())
            .await;
        assert_eq!(form.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let body: Value = serde_json::from_slice(form.body()).unwrap();
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let padding = "x".repeat(20 * 1024);
        let huge = warp::test::request()
            .method("POST")
            .path("/buy")
            .header("authorization", &token)
            .json(&json!({"symbol": "AAA", "shares": 1, "note": padding}))
            .reply(&h.api())
            .await;
        assert_eq!(huge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: Value = serde_json::from_slice(huge.body()).unwrap();
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (_, portfolio) = h.get(&token, "/").await;
        assert_eq!(money(&portfolio["cash"]), Decimal::new(1_000_000, 2));
    }

    #[tokio::test]
    async fn fractional_cent_deposits_are_refused() {
        let h = Harness::new(Decimal::ONE).await;
        let token = h.register("frank").await;

        let (status, body) = h
            .post(&token, "/funds/add", json!({"amount": "0.0000000000000000000000001"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));

        let (_, portfolio) = h.get(&token, "/").await;
        assert_eq!(money(&portfolio["cash"]), Decimal::new(1_000_000, 2));
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let h = Harness::new(Decimal::ONE).await;
        let resp = warp::test::request()
            .method("GET")
            .path("/history")
            .reply(&h.api())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers()[CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
    }

    #[tokio::test]
    async fn username_check() {
        let h = Harness::new(Decimal::ONE).await;
        h.register("dave").await;

        let taken = warp::test::request()
            .path("/check?username=dave")
            .reply(&h.api())
            .await;
        assert_eq!(taken.body().as_ref(), b"false");

        let free = warp::test::request()
            .path("/check?username=erin")
            .reply(&h.api())
            .await;
        assert_eq!(free.body().as_ref(), b"true");
    }
}
