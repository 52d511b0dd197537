// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod ledger;
mod models;
mod quote;

use crate::auth::TokenIssuer;
use crate::config::Config;
use crate::quote::{AlphaVantage, QuoteProvider};
use env_logger::{Builder, Env};
use log::{error, info};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match db::init(&config.database_url, config.max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    info!("Connected to database...");

    let client = match Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let mut alphavantage = AlphaVantage::new(client, config.alphavantage_api_key.clone());
    if let Some(url) = &config.alphavantage_url {
        alphavantage = alphavantage.with_base_url(url.clone());
    }
    let quotes: Arc<dyn QuoteProvider> = Arc::new(alphavantage);
    let tokens = Arc::new(TokenIssuer::new(
        config.jwt_secret.clone().into_bytes(),
        config.token_ttl,
    ));

    let api = api::routes(pool.clone(), quotes, tokens);

    info!("Server running on http://{}", config.bind_addr);
    let (_, server) = warp::serve(api).bind_with_graceful_shutdown(config.bind_addr, async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    });
    server.await;
    pool.close().await;
}
