//! REST adapter for Salesforce-style org APIs.

use super::{Identity, QueryResult, RemoteStore, UpsertResult};
use crate::config::ConnectionConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::query::Query;
use crate::record::{ID_FIELD, Record};
use crate::schema::{ObjectDescriptor, ObjectSummary};
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

/// Composite collection endpoints accept at most this many records.
const COLLECTION_LIMIT: usize = 200;

/// HTTP client for one org.
pub struct RestStore {
    client: Client,
    instance_url: String,
    api_version: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GlobalDescribe {
    sobjects: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    total_size: usize,
    #[serde(default)]
    records: Vec<JsonValue>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    preferred_username: String,
    #[serde(default)]
    user_id: String,
    organization_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default, alias = "statusCode", alias = "errorCode")]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SaveResult {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    created: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
}

impl From<SaveResult> for UpsertResult {
    fn from(r: SaveResult) -> Self {
        UpsertResult {
            success: r.success,
            id: r.id,
            errors: r.errors.into_iter().map(format_api_error).collect(),
            created: r.created,
        }
    }
}

fn format_api_error(e: ApiError) -> String {
    if e.code.is_empty() {
        e.message
    } else {
        format!("{}: {}", e.code, e.message)
    }
}

impl RestStore {
    /// Build a client from connection settings.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout()?)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            instance_url: config.instance_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}{}",
            self.instance_url, self.api_version, path
        )
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<Response> {
        debug!(operation, %method, url, "remote call");
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.access_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| Error::transient(operation, e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, operation: &str, url: &str) -> Result<T> {
        let response = self.send(operation, Method::GET, url, None).await?;
        let response = check_status(operation, response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("Invalid {} response", operation), e))
    }

    async fn save(
        &self,
        operation: &str,
        method: Method,
        url: &str,
        body: &JsonValue,
    ) -> Result<UpsertResult> {
        let response = self.send(operation, method, url, Some(body)).await?;
        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let errors: Vec<ApiError> = response.json().await.unwrap_or_default();
            return Ok(UpsertResult::failed(
                errors.into_iter().map(format_api_error).collect(),
            ));
        }
        let response = check_status(operation, response).await?;
        let saved: SaveResult = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("Invalid {} response", operation), e))?;
        Ok(saved.into())
    }
}

/// Map HTTP failures onto the error taxonomy: throttling and server faults
/// are transient, everything else is permanent.
async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Err(Error::transient(operation, message))
    } else {
        Err(Error::remote(operation, message))
    }
}

/// Remove the `attributes` envelope the API adds to every row.
fn strip_attributes(mut value: JsonValue) -> JsonValue {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("attributes");
        for nested in obj.values_mut() {
            if nested.is_object() {
                *nested = strip_attributes(nested.take());
            }
        }
    }
    value
}

fn path_segment(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn identity(&self) -> Result<Identity> {
        let url = format!("{}/services/oauth2/userinfo", self.instance_url);
        let info: UserInfo = self.get_json("identity", &url).await?;
        Ok(Identity {
            username: info.preferred_username,
            user_id: info.user_id,
            organization_id: info.organization_id,
        })
    }

    async fn describe_global(&self) -> Result<Vec<ObjectSummary>> {
        let global: GlobalDescribe = self
            .get_json("describe_global", &self.data_url("/sobjects"))
            .await?;
        Ok(global.sobjects)
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescriptor> {
        let url = self.data_url(&format!("/sobjects/{}/describe", path_segment(object)));
        self.get_json("describe", &url).await
    }

    #[instrument(skip(self), fields(object = %query.object))]
    async fn query(&self, query: &Query) -> Result<QueryResult> {
        let soql = query.to_soql();
        let mut url = format!(
            "{}?q={}",
            self.data_url("/query"),
            path_segment(&soql)
        );
        let mut records = Vec::new();
        let mut total_size = 0;

        loop {
            let page: QueryPage = self.get_json("query", &url).await?;
            total_size = total_size.max(page.total_size);
            for row in page.records {
                records.push(Record::from_json(strip_attributes(row))?);
            }
            match page.next_records_url {
                Some(next) => url = format!("{}{}", self.instance_url, next),
                None => break,
            }
        }

        Ok(QueryResult {
            records,
            total_size,
        })
    }

    async fn count(&self, object: &str) -> Result<u64> {
        let soql = format!("SELECT COUNT() FROM {}", object);
        let url = format!("{}?q={}", self.data_url("/query"), path_segment(&soql));
        let page: QueryPage = self.get_json("count", &url).await?;
        Ok(page.total_size as u64)
    }

    async fn upsert_one(
        &self,
        object: &str,
        record: &Record,
        external_id_field: &str,
    ) -> Result<UpsertResult> {
        let Some(external_id) = record.text(external_id_field) else {
            return Ok(UpsertResult::failed(vec![format!(
                "MISSING_EXTERNAL_ID: {} is required for upsert",
                external_id_field
            )]));
        };
        let mut body = record.clone();
        body.remove(external_id_field);
        body.remove(ID_FIELD);
        let url = self.data_url(&format!(
            "/sobjects/{}/{}/{}",
            path_segment(object),
            path_segment(external_id_field),
            path_segment(external_id)
        ));
        self.save("upsert", Method::PATCH, &url, &body.to_json()?).await
    }

    async fn insert_one(&self, object: &str, record: &Record) -> Result<UpsertResult> {
        let mut body = record.clone();
        body.remove(ID_FIELD);
        let url = self.data_url(&format!("/sobjects/{}", path_segment(object)));
        let mut result = self.save("insert", Method::POST, &url, &body.to_json()?).await?;
        if result.success {
            result.created = true;
        }
        Ok(result)
    }

    async fn upsert_bulk(
        &self,
        object: &str,
        records: &[Record],
        external_id_field: &str,
    ) -> Result<Vec<UpsertResult>> {
        let url = self.data_url(&format!(
            "/composite/sobjects/{}/{}",
            path_segment(object),
            path_segment(external_id_field)
        ));
        let mut results = Vec::with_capacity(records.len());

        for chunk in records.chunks(COLLECTION_LIMIT) {
            let mut payload = Vec::with_capacity(chunk.len());
            for record in chunk {
                let mut row = record.to_json()?;
                if let Some(obj) = row.as_object_mut() {
                    obj.remove(ID_FIELD);
                    obj.insert("attributes".into(), json!({ "type": object }));
                }
                payload.push(row);
            }
            let body = json!({ "allOrNone": false, "records": payload });
            let response = self
                .send("upsert_bulk", Method::PATCH, &url, Some(&body))
                .await?;
            let response = check_status("upsert_bulk", response).await?;
            let saved: Vec<SaveResult> = response
                .json()
                .await
                .map_err(|e| Error::serialization("Invalid upsert_bulk response", e))?;
            if saved.len() != chunk.len() {
                return Err(Error::remote(
                    "upsert_bulk",
                    format!("expected {} results, got {}", chunk.len(), saved.len()),
                ));
            }
            results.extend(saved.into_iter().map(UpsertResult::from));
        }

        Ok(results)
    }
}
