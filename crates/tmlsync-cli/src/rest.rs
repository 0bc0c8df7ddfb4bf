//! Blocking REST v2 client implementing `ContentApi`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tmlsync_content::{ContentDocument, ContentType, MetadataType, MigrationStatus, PlatformVersion};
use tmlsync_migrate::{
    ApiError, ContentApi, ContentFilter, ContentHeader, ExportedObject, ImportOutcome,
    ImportPolicy, ShareTarget,
};

use crate::config::Environment;

const API_PREFIX: &str = "/api/rest/2.0";
const PAGE_SIZE: usize = 500;

pub struct RestClient {
    client: Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(env: &Environment) -> Result<Self> {
        Self::with_timeout(&env.base_url, &env.token, Some(env.timeout))
    }

    pub fn with_timeout(base_url: &str, token: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| anyhow!("failed to build http client: {e}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    fn post(&self, path: &str, payload: &Value) -> Result<Value, ApiError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "POST");
        self.send(&url, self.client.post(&url).json(payload))
    }

    fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "GET");
        self.send(&url, self.client.get(&url))
    }

    fn send(&self, url: &str, request: RequestBuilder) -> Result<Value, ApiError> {
        let resp = request
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| ApiError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let status = resp.status();
        let body = resp.text().map_err(|e| e.to_string());
        interpret_body(url, status.as_u16(), body)
    }

    /// Release version reported by the platform.
    pub fn platform_version(&self) -> Result<PlatformVersion, ApiError> {
        let url = self.url("/system");
        let info: SystemInfo = decode(&url, self.get("/system")?)?;
        info.release_version
            .parse()
            .map_err(|e: tmlsync_content::DocumentError| ApiError::Decode {
                url,
                message: e.to_string(),
            })
    }

    fn search(&self, payload: Value) -> Result<Vec<ContentHeader>, ApiError> {
        let url = self.url("/metadata/search");
        let mut headers = Vec::new();
        let mut offset = 0;
        loop {
            let mut page = payload.clone();
            page["record_offset"] = json!(offset);
            page["record_size"] = json!(PAGE_SIZE);
            let rows: Vec<SearchRow> = decode(&url, self.post("/metadata/search", &page)?)?;
            let n = rows.len();
            headers.extend(rows.into_iter().filter_map(SearchRow::into_header));
            if n < PAGE_SIZE {
                return Ok(headers);
            }
            offset += n;
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

fn decode<T: for<'de> Deserialize<'de>>(url: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
struct SystemInfo {
    release_version: String,
}

#[derive(Deserialize)]
struct SearchRow {
    metadata_id: String,
    #[serde(default)]
    metadata_name: String,
    metadata_type: String,
    #[serde(default)]
    metadata_header: SearchHeader,
}

#[derive(Default, Deserialize)]
struct SearchHeader {
    #[serde(default, rename = "type")]
    subtype: Option<String>,
    #[serde(default, rename = "authorName")]
    author: Option<String>,
    #[serde(default)]
    tags: Vec<NamedRef>,
}

#[derive(Deserialize)]
struct NamedRef {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

impl SearchRow {
    fn into_header(self) -> Option<ContentHeader> {
        let Some(content_type) =
            content_type_of(&self.metadata_type, self.metadata_header.subtype.as_deref())
        else {
            tracing::debug!(
                guid = %self.metadata_id,
                metadata_type = %self.metadata_type,
                "skipping non-migratable object"
            );
            return None;
        };
        Some(ContentHeader {
            guid: self.metadata_id,
            name: self.metadata_name,
            content_type,
            author: self.metadata_header.author,
            tags: self.metadata_header.tags.into_iter().map(|t| t.name).collect(),
        })
    }
}

#[derive(Deserialize)]
struct ExportRow {
    info: ExportInfo,
    #[serde(default)]
    edoc: Option<String>,
}

#[derive(Deserialize)]
struct ExportInfo {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    content_type: Option<String>,
    status: RemoteStatus,
}

#[derive(Deserialize)]
struct RemoteStatus {
    status_code: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ImportRow {
    response: ImportResponse,
}

#[derive(Deserialize)]
struct ImportResponse {
    status: RemoteStatus,
    #[serde(default)]
    header: Option<ImportHeader>,
}

#[derive(Deserialize)]
struct ImportHeader {
    #[serde(default)]
    id_guid: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ConnectionRow {
    id: String,
    #[serde(default)]
    details: Option<Value>,
}

/// Listing kind plus header subtype to content type. `None` for kinds that
/// are never migrated.
pub fn content_type_of(metadata_type: &str, subtype: Option<&str>) -> Option<ContentType> {
    match (metadata_type, subtype.unwrap_or_default()) {
        ("CONNECTION", _) => Some(ContentType::Connection),
        ("LOGICAL_TABLE", "ONE_TO_ONE_LOGICAL") => Some(ContentType::Table),
        ("LOGICAL_TABLE", "SQL_VIEW") => Some(ContentType::SqlView),
        ("LOGICAL_TABLE", "AGGR_WORKSHEET") => Some(ContentType::View),
        ("LOGICAL_TABLE", "WORKSHEET" | "") => Some(ContentType::Worksheet),
        ("ANSWER", _) => Some(ContentType::Answer),
        ("LIVEBOARD", _) => Some(ContentType::Liveboard),
        _ => None,
    }
}

/// Turn a status and the outcome of reading the body into a JSON value.
/// An empty 2xx body is `Null`; a body that could not be read is a
/// transport failure.
fn interpret_body(url: &str, status: u16, body: Result<String, String>) -> Result<Value, ApiError> {
    if !(200..300).contains(&status) {
        return Err(ApiError::Http {
            url: url.to_string(),
            status,
            body: body.unwrap_or_else(|e| format!("<body unreadable: {e}>")),
        });
    }
    let text = body.map_err(|message| ApiError::Transport {
        url: url.to_string(),
        message: format!("reading the response body failed: {message}"),
    })?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| ApiError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Request body for `metadata/search`.
pub fn search_payload(filter: &ContentFilter) -> Value {
    let kinds = filter.listing_kinds();
    let types: Vec<Option<MetadataType>> = if kinds.is_empty() {
        vec![None]
    } else {
        kinds.into_iter().map(Some).collect()
    };

    let mut metadata = Vec::new();
    for metadata_type in &types {
        let mut base = json!({});
        if let Some(t) = metadata_type {
            base["type"] = json!(t.as_api_str());
        }
        if let Some(pattern) = &filter.name_pattern {
            base["name_pattern"] = json!(pattern);
        }
        if filter.guids.is_empty() {
            metadata.push(base);
        } else {
            for guid in &filter.guids {
                let mut entry = base.clone();
                entry["identifier"] = json!(guid);
                metadata.push(entry);
            }
        }
    }

    let mut payload = json!({ "metadata": metadata, "include_headers": true });
    if !filter.tags.is_empty() {
        payload["tag_identifiers"] = json!(filter.tags);
    }
    if let Some(author) = &filter.author {
        payload["created_by_user_identifiers"] = json!([author]);
    }
    if !filter.exclude_types.is_empty() {
        let excluded: Vec<Value> = filter
            .exclude_types
            .iter()
            .map(|t| json!({ "type": t.as_api_str() }))
            .collect();
        payload["exclude_metadata"] = json!(excluded);
    }
    payload
}

fn exported_object(row: ExportRow) -> ExportedObject {
    let status = MigrationStatus::from_remote(&row.info.status.status_code);
    let mut message = row.info.status.error_message.unwrap_or_default();
    let body = match row.edoc.as_deref().map(serde_json::from_str::<Value>) {
        Some(Ok(body)) => Some(body),
        Some(Err(err)) => {
            message = format!("unreadable TML in export response: {err}");
            None
        }
        None => None,
    };
    let status = if body.is_none() && !status.is_error() && !message.is_empty() {
        MigrationStatus::Error
    } else {
        status
    };
    ExportedObject {
        guid: row.info.id,
        content_type: row
            .info
            .content_type
            .as_deref()
            .and_then(|t| t.parse().ok()),
        status,
        message,
        body,
    }
}

fn import_outcome(row: ImportRow) -> ImportOutcome {
    let header = row.response.header;
    ImportOutcome {
        status: MigrationStatus::from_remote(&row.response.status.status_code),
        guid: header.as_ref().and_then(|h| h.id_guid.clone()),
        name: header.and_then(|h| h.name),
        message: row.response.status.error_message.unwrap_or_default(),
    }
}

/// Connection search row to a connection document body.
fn connection_body(row: ConnectionRow) -> Value {
    let mut content = row.details.unwrap_or_else(|| json!({}));
    if !content.is_object() {
        content = json!({});
    }
    json!({ "guid": row.id, "connection": content })
}

fn connection_payload(document: &ContentDocument) -> Value {
    let content = document.content().cloned().unwrap_or_default();
    let warehouse = content
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    json!({
        "name": document.display_name(),
        "data_warehouse_type": warehouse,
        "data_warehouse_config": Value::Object(content),
        "validate": false,
    })
}

// ============================================================================
// ContentApi
// ============================================================================

impl ContentApi for RestClient {
    fn list_content(&self, filter: &ContentFilter) -> Result<Vec<ContentHeader>, ApiError> {
        let headers = self.search(search_payload(filter))?;
        Ok(headers.into_iter().filter(|h| filter.matches(h)).collect())
    }

    fn export_tml(
        &self,
        guids: &[String],
        with_associated: bool,
        export_fqn: bool,
    ) -> Result<Vec<ExportedObject>, ApiError> {
        let url = self.url("/metadata/tml/export");
        let metadata: Vec<Value> = guids.iter().map(|g| json!({ "identifier": g })).collect();
        let payload = json!({
            "metadata": metadata,
            "export_associated": with_associated,
            "export_fqn": export_fqn,
            "edoc_format": "JSON",
        });
        let rows: Vec<ExportRow> = decode(&url, self.post("/metadata/tml/export", &payload)?)?;
        Ok(rows.into_iter().map(exported_object).collect())
    }

    fn export_connection(&self, guid: &str) -> Result<Value, ApiError> {
        let url = self.url("/connection/search");
        let payload = json!({
            "connections": [ { "identifier": guid } ],
            "include_details": true,
        });
        let rows: Vec<ConnectionRow> = match self.post("/connection/search", &payload) {
            Ok(value) => decode(&url, value)?,
            Err(ApiError::Http { status: 404, .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        rows.into_iter()
            .find(|r| r.id.eq_ignore_ascii_case(guid))
            .map(connection_body)
            .ok_or_else(|| ApiError::NotFound {
                guid: guid.to_string(),
            })
    }

    fn parents_of(&self, guid: &str) -> Result<Vec<ContentHeader>, ApiError> {
        let url = self.url("/metadata/search");
        let payload = json!({
            "metadata": [ { "identifier": guid, "type": "LOGICAL_TABLE" } ],
            "include_details": true,
        });
        let rows: Vec<Value> = decode(&url, self.post("/metadata/search", &payload)?)?;
        let parents: Vec<NamedRef> = rows
            .into_iter()
            .filter_map(|mut row| row.pointer_mut("/metadata_detail/tables").map(Value::take))
            .map(|tables| decode::<Vec<NamedRef>>(&url, tables))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        Ok(parents
            .into_iter()
            .map(|t| ContentHeader {
                guid: t.id,
                name: t.name,
                content_type: ContentType::Table,
                author: None,
                tags: Vec::new(),
            })
            .collect())
    }

    fn import_tml(
        &self,
        documents: &[ContentDocument],
        policy: ImportPolicy,
        force_create: bool,
    ) -> Result<Vec<ImportOutcome>, ApiError> {
        let url = self.url("/metadata/tml/import");
        let tmls = documents
            .iter()
            .map(ContentDocument::to_pretty_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?;
        let payload = json!({
            "metadata_tmls": tmls,
            "import_policy": policy.as_api_str(),
            "create_new": force_create,
        });
        let rows: Vec<ImportRow> = decode(&url, self.post("/metadata/tml/import", &payload)?)?;
        Ok(rows.into_iter().map(import_outcome).collect())
    }

    fn create_connection(&self, document: &ContentDocument) -> Result<ImportOutcome, ApiError> {
        let url = self.url("/connection/create");
        let created: NamedRef =
            decode(&url, self.post("/connection/create", &connection_payload(document))?)?;
        let name = if created.name.is_empty() {
            document.display_name().to_string()
        } else {
            created.name
        };
        Ok(ImportOutcome::ok(created.id, name))
    }

    fn update_connection(
        &self,
        guid: &str,
        document: &ContentDocument,
    ) -> Result<ImportOutcome, ApiError> {
        let path = format!("/connections/{guid}/update");
        match self.post(&path, &connection_payload(document)) {
            Ok(_) => Ok(ImportOutcome::ok(guid, document.display_name())),
            Err(ApiError::Http { status: 404, .. }) => Err(ApiError::NotFound {
                guid: guid.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    fn assign_tags(
        &self,
        guids: &[String],
        metadata_type: MetadataType,
        tags: &[String],
    ) -> Result<(), ApiError> {
        let metadata: Vec<Value> = guids
            .iter()
            .map(|g| json!({ "identifier": g, "type": metadata_type.as_api_str() }))
            .collect();
        let payload = json!({ "metadata": metadata, "tag_identifiers": tags });
        self.post("/tags/assign", &payload).map(|_| ())
    }

    fn share(
        &self,
        guids: &[String],
        metadata_type: MetadataType,
        targets: &[ShareTarget],
    ) -> Result<(), ApiError> {
        let permissions: Vec<Value> = targets
            .iter()
            .map(|t| {
                json!({
                    "principal": { "identifier": t.principal },
                    "share_mode": t.access.as_api_str(),
                })
            })
            .collect();
        let payload = json!({
            "metadata_type": metadata_type.as_api_str(),
            "metadata_identifiers": guids,
            "permissions": permissions,
        });
        self.post("/security/metadata/share", &payload).map(|_| ())
    }
}
