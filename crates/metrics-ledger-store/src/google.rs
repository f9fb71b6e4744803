use std::fmt::{Debug, Formatter};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics_ledger_core::CellValue;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::{A1Range, SheetStore};

pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/";

const MAX_ERROR_BODY: usize = 512;

/// Connection settings for one spreadsheet.
#[derive(Clone)]
pub struct GoogleSheetsConfig {
    pub spreadsheet_id: String,
    pub access_token: String,
    pub api_base: Url,
    pub timeout: Duration,
}

impl GoogleSheetsConfig {
    /// # Errors
    /// Returns an error when the built-in API base URL fails to parse.
    pub fn new(spreadsheet_id: String, access_token: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            spreadsheet_id,
            access_token,
            api_base: Url::parse(DEFAULT_SHEETS_API_BASE).context("invalid sheets API base URL")?,
            timeout,
        })
    }
}

impl Debug for GoogleSheetsConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleSheetsConfig")
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("access_token", &"<redacted>")
            .field("api_base", &self.api_base.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMetadata {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: i64,
    #[serde(default)]
    title: String,
}

/// Google Sheets v4 REST backend authenticated with a bearer token.
///
/// Uses the blocking client; call it from a blocking context, never directly from
/// an async task.
#[derive(Debug, Clone)]
pub struct GoogleSheetsStore {
    config: GoogleSheetsConfig,
    http: Client,
}

impl GoogleSheetsStore {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: GoogleSheetsConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("metrics-ledger/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .context("failed to build sheets HTTP client")?;
        Ok(Self { config, http })
    }

    fn spreadsheet_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("sheets API base cannot carry a path"))?
            .pop_if_empty()
            .push("spreadsheets")
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &A1Range) -> Result<Url> {
        let range = range.to_string();
        self.spreadsheet_url(&[self.config.spreadsheet_id.as_str(), "values", range.as_str()])
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .bearer_auth(&self.config.access_token)
            .send()
            .with_context(|| format!("sheets request failed: {what}"))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY).rev().find(|index| body.is_char_boundary(*index)).unwrap_or(0);
                body.truncate(cut);
            }
            return Err(anyhow!("sheets API returned {} for {what}: {body}", status.as_u16()));
        }

        Ok(response)
    }
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl SheetStore for GoogleSheetsStore {
    fn read_range(&self, range: &A1Range) -> Result<Vec<Vec<String>>> {
        let url = self.values_url(range)?;
        tracing::debug!(%range, "reading sheet range");
        let response = self.send(self.http.get(url), &format!("read {range}"))?;
        let body: ValueRange =
            response.json().with_context(|| format!("failed to decode values of {range}"))?;
        Ok(body.values.into_iter().map(|row| row.into_iter().map(cell_text).collect()).collect())
    }

    fn write_range(&self, range: &A1Range, rows: &[Vec<CellValue>]) -> Result<()> {
        let mut url = self.values_url(range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "USER_ENTERED");
        tracing::debug!(%range, rows = rows.len(), "writing sheet range");
        let body = json!({
            "range": range.to_string(),
            "majorDimension": "ROWS",
            "values": rows,
        });
        self.send(self.http.put(url).json(&body), &format!("write {range}"))?;
        Ok(())
    }

    fn sheet_id(&self, tab: &str) -> Result<Option<i64>> {
        let mut url = self.spreadsheet_url(&[self.config.spreadsheet_id.as_str()])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties(sheetId,title)");
        let response = self.send(self.http.get(url), "read spreadsheet metadata")?;
        let metadata: SpreadsheetMetadata =
            response.json().context("failed to decode spreadsheet metadata")?;
        Ok(metadata
            .sheets
            .into_iter()
            .find(|sheet| sheet.properties.title == tab)
            .map(|sheet| sheet.properties.sheet_id))
    }

    fn delete_rows(&self, sheet_id: i64, start_index: u32, end_index: u32) -> Result<()> {
        let target = format!("{}:batchUpdate", self.config.spreadsheet_id);
        let url = self.spreadsheet_url(&[target.as_str()])?;
        tracing::debug!(sheet_id, start_index, end_index, "deleting sheet rows");
        let body = json!({
            "requests": [{
                "deleteDimension": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "ROWS",
                        "startIndex": start_index,
                        "endIndex": end_index,
                    }
                }
            }]
        });
        self.send(self.http.post(url).json(&body), "delete rows")?;
        Ok(())
    }
}
