//! reqwest transport for [`KonnectApi`].

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::*;
use url::Url;

use super::{
    Credentials, KonnectApi, KonnectApiFactory, KonnectError, ListFilter, Organization,
    RemoteObject,
};

const PAGE_SIZE: &str = "100";
const MAX_PAGES: usize = 50;

/// Shares one connection pool between the clients of all organizations.
#[derive(Clone)]
pub struct HttpKonnectApiFactory {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpKonnectApiFactory {
    pub fn new(timeout: Duration) -> Result<Self, KonnectError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gateway-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, timeout })
    }
}

impl KonnectApiFactory for HttpKonnectApiFactory {
    type Api = HttpKonnectApi;

    fn api_for(&self, credentials: &Credentials) -> HttpKonnectApi {
        HttpKonnectApi {
            http: self.http.clone(),
            base: credentials.server_url.clone(),
            token: credentials.token.clone(),
            timeout: self.timeout,
        }
    }
}

pub struct HttpKonnectApi {
    http: reqwest::Client,
    base: Url,
    token: String,
    timeout: Duration,
}

impl HttpKonnectApi {
    fn url(&self, path: &str) -> Result<Url, KonnectError> {
        self.base
            .join(path)
            .map_err(|e| KonnectError::InvalidResponse(format!("invalid path {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.token)
    }

    /// Send a request and decode its JSON body, if it has one.
    async fn send(&self, request: RequestBuilder) -> Result<Option<Value>, KonnectError> {
        tokio::time::timeout(self.timeout, exchange(request))
            .await
            .map_err(|_| KonnectError::Timeout(self.timeout))?
    }

    async fn object(&self, request: RequestBuilder) -> Result<RemoteObject, KonnectError> {
        let body = self
            .send(request)
            .await?
            .ok_or_else(|| KonnectError::InvalidResponse("empty response body".into()))?;
        RemoteObject::from_value(unwrap_item(body))
    }
}

impl KonnectApi for HttpKonnectApi {
    async fn create(&self, collection: &str, body: &Value) -> Result<RemoteObject, KonnectError> {
        debug!("Creating Konnect object in {collection}");
        let url = self.url(collection)?;
        self.object(self.request(Method::POST, url).json(body)).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<RemoteObject, KonnectError> {
        let url = self.url(&format!("{collection}/{id}"))?;
        self.object(self.request(Method::GET, url)).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> Result<RemoteObject, KonnectError> {
        debug!("Updating Konnect object {id} in {collection}");
        let url = self.url(&format!("{collection}/{id}"))?;
        self.object(self.request(update_method(collection), url).json(body))
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), KonnectError> {
        debug!("Deleting Konnect object {id} in {collection}");
        let url = self.url(&format!("{collection}/{id}"))?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn list(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> Result<Vec<RemoteObject>, KonnectError> {
        let mut objects = Vec::new();
        let mut offset: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let url = list_url(self.url(collection)?, filter, offset.as_deref());
            let Some(page) = self.send(self.request(Method::GET, url)).await? else {
                break;
            };
            let items = page
                .get("data")
                .or_else(|| page.get("items"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in items {
                objects.push(RemoteObject::from_value(item)?);
            }
            // core entities paginate with an opaque offset, other collections return one page
            offset = page.get("offset").and_then(Value::as_str).map(str::to_owned);
            if offset.is_none() {
                break;
            }
        }
        Ok(objects)
    }

    async fn current_organization(&self) -> Result<Organization, KonnectError> {
        let url = self.url("v3/organizations/me")?;
        let body = self
            .send(self.request(Method::GET, url))
            .await?
            .ok_or_else(|| KonnectError::InvalidResponse("empty response body".into()))?;
        let field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_owned);
        Ok(Organization {
            id: field("id")
                .ok_or_else(|| KonnectError::InvalidResponse("organization without an id".into()))?,
            name: field("name").unwrap_or_default(),
        })
    }
}

async fn exchange(request: RequestBuilder) -> Result<Option<Value>, KonnectError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        let body = response.bytes().await?;
        if status == StatusCode::NO_CONTENT || body.is_empty() {
            return Ok(None);
        }
        return serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| KonnectError::InvalidResponse(e.to_string()));
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(KonnectError::from_status(
        status.as_u16(),
        error_message(status, &body),
        retry_after,
    ))
}

/// Core entities are replaced wholesale, control plane level objects are patched.
fn update_method(collection: &str) -> Method {
    if collection.contains("/core-entities/") {
        Method::PUT
    } else {
        Method::PATCH
    }
}

fn list_url(mut url: Url, filter: &ListFilter, offset: Option<&str>) -> Url {
    {
        let mut query = url.query_pairs_mut();
        match filter {
            ListFilter::Tags(tags) if tags.is_empty() => {}
            ListFilter::Tags(tags) => {
                query.append_pair("tags", &tags.join(","));
            }
            ListFilter::Name(name) => {
                query.append_pair("filter[name][eq]", name);
            }
        }
        query.append_pair("size", PAGE_SIZE);
        if let Some(offset) = offset {
            query.append_pair("offset", offset);
        }
    }
    url
}

/// Some endpoints wrap the object they return in `item`.
fn unwrap_item(body: Value) -> Value {
    match body {
        Value::Object(mut map) if !map.contains_key("id") && map.contains_key("item") => {
            map.remove("item").unwrap_or_default()
        }
        other => other,
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|v| {
        ["detail", "message", "title"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_str))
            .map(str::to_owned)
    });
    match from_json {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().to_owned(),
        None => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_owned(),
    }
}
