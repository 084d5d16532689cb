use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

const REST_PREFIX: &str = "rest/v1/";
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const RETURN_REPRESENTATION: &str = "return=representation";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("no row matched the request")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Order::Ascending => "asc",
            Order::Descending => "desc",
        }
    }
}

/// Equality filters plus an optional ordering, rendered as row-API query
/// parameters (`column=eq.value`, `order=column.desc`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    filters: Vec<(String, String)>,
    order: Option<(String, Order)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order = Some((column.into(), order));
        self
    }

    fn append_to(&self, url: &mut Url) {
        let mut query = url.query_pairs_mut();
        for (column, value) in &self.filters {
            query.append_pair(column, &format!("eq.{value}"));
        }
        if let Some((column, order)) = &self.order {
            query.append_pair("order", &format!("{column}.{}", order.as_str()));
        }
    }
}

/// Row-level CRUD client for the hosted store. Every call is made on behalf of
/// the holder of `access_token`; the store's row policies decide visibility.
#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl StoreClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            http: Client::new(),
            base_url: parse_base_url(base_url)?,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        access_token: &str,
        table: &str,
        query: &Query,
    ) -> Result<Vec<T>, StoreError> {
        let mut url = self.endpoint(table)?;
        url.query_pairs_mut().append_pair("select", "*");
        query.append_to(&mut url);
        let response = self
            .authorized(self.http.get(url), access_token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn insert<B, T>(
        &self,
        access_token: &str,
        table: &str,
        row: &B,
    ) -> Result<T, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(table)?;
        let response = self
            .authorized(self.http.post(url), access_token)
            .header("Prefer", RETURN_REPRESENTATION)
            .header("Accept", SINGLE_OBJECT)
            .json(row)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update<B, T>(
        &self,
        access_token: &str,
        table: &str,
        id: &str,
        patch: &B,
    ) -> Result<T, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut url = self.endpoint(table)?;
        Query::new().eq("id", id).append_to(&mut url);
        let response = self
            .authorized(self.http.patch(url), access_token)
            .header("Prefer", RETURN_REPRESENTATION)
            .header("Accept", SINGLE_OBJECT)
            .json(patch)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete(&self, access_token: &str, table: &str, id: &str) -> Result<(), StoreError> {
        let mut url = self.endpoint(table)?;
        Query::new().eq("id", id).append_to(&mut url);
        let response = self
            .authorized(self.http.delete(url), access_token)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_from(response).await)
    }

    fn authorized(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {access_token}"))
    }

    fn endpoint(&self, table: &str) -> Result<Url, StoreError> {
        Ok(self.base_url.join(REST_PREFIX)?.join(table)?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn error_from(response: reqwest::Response) -> StoreError {
        let status = response.status();
        // A single-object request that matched no row is answered with 406.
        if status == StatusCode::NOT_ACCEPTABLE {
            return StoreError::NotFound;
        }
        let body = response.text().await.unwrap_or_default();
        StoreError::Api { status, body }
    }
}

/// Parses a service base URL so that relative joins land under its path,
/// e.g. `https://host/api` becomes `https://host/api/`.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}
