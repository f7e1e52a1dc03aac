use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::config::NotionConfig;

pub const COL_COMPANY: &str = "Company";
pub const COL_POSITION: &str = "Position";
pub const COL_STAGE: &str = "Stage";
pub const COL_REFERRAL: &str = "Referral?";
pub const COL_JOB_URL: &str = "JobURL";
pub const COL_APPLY_DATE: &str = "Apply date";
pub const COL_RESPONSE_DATE: &str = "Response date";

/// Property values this tracker writes, in Notion's column types.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Title(String),
    RichText(String),
    Status(String),
    Select(String),
    Url(String),
    Date(DateTime<Utc>),
}

impl PropertyValue {
    pub fn to_notion(&self) -> Value {
        match self {
            PropertyValue::Title(text) => json!({ "title": [{ "text": { "content": text } }] }),
            PropertyValue::RichText(text) => {
                json!({ "rich_text": [{ "text": { "content": text } }] })
            }
            PropertyValue::Status(name) => json!({ "status": { "name": name } }),
            PropertyValue::Select(name) => json!({ "select": { "name": name } }),
            PropertyValue::Url(url) => json!({ "url": url }),
            PropertyValue::Date(date) => json!({ "date": { "start": date.to_rfc3339() } }),
        }
    }

    #[allow(dead_code)]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Title(text) | PropertyValue::RichText(text) => Some(text),
            _ => None,
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

fn properties_json(props: &Properties) -> Value {
    let map: Map<String, Value> = props
        .iter()
        .map(|(name, value)| (name.clone(), value.to_notion()))
        .collect();
    Value::Object(map)
}

/// Identity columns of an existing row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub company: String,
    pub position: String,
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Every row in the table, in the store's query order.
    async fn query_all(&self) -> Result<Vec<Row>>;

    async fn update(&self, row_id: &str, props: &Properties) -> Result<()>;

    /// Returns the new row's id.
    async fn create(&self, props: &Properties) -> Result<String>;
}

// --- Notion API ---

const NOTION_API_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Default, Deserialize)]
struct RichTextObject {
    #[serde(default)]
    plain_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PropertyObject {
    Title {
        #[serde(default)]
        title: Vec<RichTextObject>,
    },
    RichText {
        #[serde(default)]
        rich_text: Vec<RichTextObject>,
    },
    #[serde(other)]
    Other,
}

impl PropertyObject {
    fn plain_text(&self) -> String {
        match self {
            PropertyObject::Title { title: parts } | PropertyObject::RichText { rich_text: parts } => {
                parts.iter().map(|p| p.plain_text.as_str()).collect()
            }
            PropertyObject::Other => String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageObject {
    id: String,
    #[serde(default)]
    properties: BTreeMap<String, PropertyObject>,
}

impl PageObject {
    fn text(&self, column: &str) -> String {
        self.properties
            .get(column)
            .map(PropertyObject::plain_text)
            .unwrap_or_default()
    }

    fn into_row(self) -> Row {
        Row {
            company: self.text(COL_COMPANY),
            position: self.text(COL_POSITION),
            id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<PageObject>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedPage {
    id: String,
}

pub struct NotionStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
    database_id: String,
}

impl NotionStore {
    pub fn new(config: &NotionConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: NOTION_API_URL.to_string(),
            token: config.token.clone(),
            database_id: config.database_id.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send Notion {} request", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Notion {} failed with status {}: {}",
                what,
                status,
                error_text
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl RowStore for NotionStore {
    async fn query_all(&self) -> Result<Vec<Row>> {
        let path = format!("databases/{}/query", self.database_id);
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(c) = &cursor {
                body["start_cursor"] = json!(c);
            }

            let page: QueryResponse = self
                .send(self.request(reqwest::Method::POST, &path).json(&body), "query")
                .await?
                .json()
                .await
                .context("Failed to parse Notion query response")?;

            rows.extend(page.results.into_iter().map(PageObject::into_row));

            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(rows = rows.len(), database = %self.database_id, "queried Notion database");
        Ok(rows)
    }

    async fn update(&self, row_id: &str, props: &Properties) -> Result<()> {
        let body = json!({ "properties": properties_json(props) });
        self.send(
            self.request(reqwest::Method::PATCH, &format!("pages/{}", row_id))
                .json(&body),
            "update",
        )
        .await?;
        Ok(())
    }

    async fn create(&self, props: &Properties) -> Result<String> {
        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": properties_json(props),
        });
        let created: CreatedPage = self
            .send(self.request(reqwest::Method::POST, "pages").json(&body), "create")
            .await?
            .json()
            .await
            .context("Failed to parse Notion create response")?;
        Ok(created.id)
    }
}
