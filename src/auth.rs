// src/auth.rs
use crate::db;
use crate::error::LedgerError;
use crate::models::{TokenResponse, UserId};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token subject is not a user id")]
    InvalidSubject,

    #[error("password hashing failed: {0}")]
    Hash(String),
}

impl From<AuthError> for LedgerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Hash(message) => LedgerError::Credential(message),
            other => LedgerError::Unauthorized(other.to_string()),
        }
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    pub fn issue(&self, user_id: UserId) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (Utc::now() + self.ttl).timestamp().max(0) as usize,
        };
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )?)
    }

    pub fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &Validation::default(),
        )?;
        let user_id = data
            .claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::InvalidSubject)?;
        Ok(AuthContext { user_id })
    }

    /// Extracts the context from an `Authorization: Bearer <token>` header value.
    pub fn authorize(&self, header: Option<&str>) -> Result<AuthContext, AuthError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Hash(e.to_string()))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AuthError::Hash(e.to_string())),
    }
}

async fn hash_blocking(password: String) -> Result<String, LedgerError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| LedgerError::Credential(e.to_string()))?
        .map_err(LedgerError::from)
}

async fn verify_blocking(password: String, hash: String) -> Result<bool, LedgerError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| LedgerError::Credential(e.to_string()))?
        .map_err(LedgerError::from)
}

fn required(value: Option<String>, message: &str) -> Result<String, LedgerError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| LedgerError::validation(message))
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterForm {
    pub username: Option<String>,
    pub password: Option<String>,
    pub confirmation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PasswordForm {
    pub current_password: Option<String>,
    pub new_password: Option<String>,
    pub new_password_confirmation: Option<String>,
}

/// `true` when `username` is non-empty and not registered yet.
pub async fn check_username(pool: &SqlitePool, username: &str) -> Result<bool, LedgerError> {
    let username = username.trim();
    if username.is_empty() {
        return Ok(false);
    }
    Ok(db::find_user_by_name(pool, username).await?.is_none())
}

pub async fn register(
    pool: &SqlitePool,
    tokens: &TokenIssuer,
    form: RegisterForm,
) -> Result<TokenResponse, LedgerError> {
    let username = required(form.username, "must provide username")?;
    let password = required(form.password, "must provide password")?;
    if form.confirmation.as_deref() != Some(password.as_str()) {
        return Err(LedgerError::validation("passwords do not match"));
    }

    let hash = hash_blocking(password).await?;
    let user_id = db::create_user(pool, username.trim(), &hash).await?;
    info!("Registered user {} ({})", username.trim(), user_id);
    Ok(TokenResponse {
        user_id,
        token: tokens.issue(user_id)?,
    })
}

pub async fn login(
    pool: &SqlitePool,
    tokens: &TokenIssuer,
    form: LoginForm,
) -> Result<TokenResponse, LedgerError> {
    let username = required(form.username, "must provide username")?;
    let password = required(form.password, "must provide password")?;

    let invalid = || LedgerError::Unauthorized("invalid username and/or password".to_string());
    let user = db::find_user_by_name(pool, username.trim())
        .await?
        .ok_or_else(invalid)?;
    if !verify_blocking(password, user.password_hash).await? {
        return Err(invalid());
    }
    info!("User {} ({}) logged in", user.username, user.id);
    Ok(TokenResponse {
        user_id: user.id,
        token: tokens.issue(user.id)?,
    })
}

pub async fn change_password(
    pool: &SqlitePool,
    ctx: &AuthContext,
    form: PasswordForm,
) -> Result<(), LedgerError> {
    let current = required(form.current_password, "must provide current password")?;
    let user = db::find_user(pool, ctx.user_id).await?;
    if !verify_blocking(current, user.password_hash).await? {
        return Err(LedgerError::Unauthorized("invalid password".to_string()));
    }

    let new_password = required(form.new_password, "must provide new password")?;
    let confirmation = required(
        form.new_password_confirmation,
        "must provide new password confirmation",
    )?;
    if new_password != confirmation {
        return Err(LedgerError::validation(
            "new password and confirmation must match",
        ));
    }

    let hash = hash_blocking(new_password).await?;
    db::update_password_hash(pool, ctx.user_id, &hash).await?;
    info!("User {} changed password", ctx.user_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_pool;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret", Duration::hours(1))
    }

    fn register_form(username: &str, password: &str, confirmation: &str) -> RegisterForm {
        RegisterForm {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            confirmation: Some(confirmation.to_string()),
        }
    }

    #[test]
    fn issued_tokens_verify() {
        let tokens = issuer();
        let token = tokens.issue(7).unwrap();
        assert_eq!(tokens.verify(&token).unwrap(), AuthContext { user_id: 7 });
        let header = format!("Bearer {}", token);
        assert_eq!(tokens.authorize(Some(&header)).unwrap().user_id, 7);
    }

    #[test]
    fn foreign_and_expired_tokens_are_rejected() {
        let token = TokenIssuer::new("other-secret", Duration::hours(1))
            .issue(7)
            .unwrap();
        assert!(issuer().verify(&token).is_err());

        let expired = TokenIssuer::new("test-secret", Duration::hours(-2))
            .issue(7)
            .unwrap();
        assert!(issuer().verify(&expired).is_err());
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(matches!(
            issuer().authorize(None),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            issuer().authorize(Some("Basic abc")),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
    }

    #[tokio::test]
    async fn register_login_and_change_password() {
        let pool = memory_pool().await;
        let tokens = issuer();

        assert!(check_username(&pool, "alice").await.unwrap());
        let registered = register(&pool, &tokens, register_form("alice", "pw", "pw"))
            .await
            .unwrap();
        assert!(!check_username(&pool, "alice").await.unwrap());
        assert!(!check_username(&pool, "  ").await.unwrap());

        let logged_in = login(
            &pool,
            &tokens,
            LoginForm {
                username: Some("alice".to_string()),
                password: Some("pw".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(logged_in.user_id, registered.user_id);

        let ctx = AuthContext {
            user_id: registered.user_id,
        };
        let wrong = change_password(
            &pool,
            &ctx,
            PasswordForm {
                current_password: Some("nope".to_string()),
                new_password: Some("pw2".to_string()),
                new_password_confirmation: Some("pw2".to_string()),
            },
        )
        .await;
        assert!(matches!(wrong, Err(LedgerError::Unauthorized(_))));

        change_password(
            &pool,
            &ctx,
            PasswordForm {
                current_password: Some("pw".to_string()),
                new_password: Some("pw2".to_string()),
                new_password_confirmation: Some("pw2".to_string()),
            },
        )
        .await
        .unwrap();

        let old = login(
            &pool,
            &tokens,
            LoginForm {
                username: Some("alice".to_string()),
                password: Some("pw".to_string()),
            },
        )
        .await;
        assert!(matches!(old, Err(LedgerError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn registration_validates_input() {
        let pool = memory_pool().await;
        let tokens = issuer();

        let mismatch = register(&pool, &tokens, register_form("bob", "a", "b")).await;
        assert!(matches!(mismatch, Err(LedgerError::Validation(_))));

        let missing = register(&pool, &tokens, RegisterForm::default()).await;
        assert!(matches!(missing, Err(LedgerError::Validation(_))));

        register(&pool, &tokens, register_form("bob", "a", "a"))
            .await
            .unwrap();
        let taken = register(&pool, &tokens, register_form("bob", "c", "c")).await;
        assert!(matches!(taken, Err(LedgerError::Conflict(_))));
    }
}
