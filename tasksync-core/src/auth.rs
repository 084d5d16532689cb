use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::client::{ApiErrorClass, classify_api_status, parse_base_url};

const AUTH_PREFIX: &str = "auth/v1/";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl AuthError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            AuthError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

#[derive(Serialize)]
struct PasswordCredentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

impl AuthClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: parse_base_url(base_url)?,
            api_key: api_key.into(),
        })
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SessionToken, AuthError> {
        let url = self.token_endpoint("password")?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(&PasswordCredentials { email, password })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Registers a new account. Projects that require email confirmation
    /// answer with the bare user and no session.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, AuthError> {
        let url = self.endpoint("signup")?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(&PasswordCredentials { email, password })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn refresh_session(&self, refresh_token: &str) -> Result<SessionToken, AuthError> {
        let url = self.token_endpoint("refresh_token")?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(&RefreshGrant { refresh_token })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let url = self.endpoint("logout")?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::Api { status, body })
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        Ok(self.base_url.join(AUTH_PREFIX)?.join(path)?)
    }

    fn token_endpoint(&self, grant_type: &str) -> Result<Url, AuthError> {
        let mut url = self.endpoint("token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AuthError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub refresh_token: String,
    pub user: AuthUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SignUp {
    Session(SessionToken),
    PendingConfirmation(AuthUser),
}
