//! Google Sheets v4 实现
//!
//! 基于 reqwest 的 REST 客户端，使用静态 Bearer 令牌认证。
//! 只读请求与幂等写入通过 backon 指数退避重试；追加请求不重试，避免重复行。

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::layout::{column_range, parse_start_row, row_range, table_range, COLUMNS};
use super::{AppendOutcome, RowUpdate, SheetStore};
use crate::config::SheetsConfig;
use crate::error::{SheetError, SheetResult};

/// 错误响应体在日志/错误信息中保留的最大长度
const MAX_ERROR_BODY: usize = 500;

/// 单元格按原文存储，不做数字、日期或公式解析
const VALUE_INPUT_OPTION: &str = "RAW";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: Option<String>,
    updated_rows: Option<usize>,
}

/// Google Sheets 存储实现
pub struct GoogleSheetsStore {
    base_url: Url,
    spreadsheet_id: String,
    sheet_name: String,
    sheet_gid: i64,
    access_token: String,
    http_retries: u32,
    http: Client,
}

impl GoogleSheetsStore {
    /// 创建 Google Sheets 存储实例
    pub fn new(config: &SheetsConfig) -> SheetResult<Self> {
        let missing = config.missing_credentials();
        if !missing.is_empty() {
            return Err(SheetError::Config(format!("missing {}", missing.join(", "))));
        }

        let base_url = Url::parse(config.api_base.trim())
            .map_err(|e| SheetError::Config(format!("invalid api_base: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SheetError::Config(format!(
                "invalid api_base: {}",
                config.api_base
            )));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url,
            spreadsheet_id: config
                .spreadsheet_id
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
            sheet_name: config.sheet_name.clone(),
            sheet_gid: config.sheet_gid,
            access_token: config
                .access_token
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
            http_retries: config.http_retries,
            http,
        })
    }

    /// `{base}/spreadsheets/{segments...}`，每段单独做百分号编码
    fn endpoint(&self, segments: &[&str]) -> SheetResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SheetError::Config(format!("invalid api_base: {}", self.base_url)))?
            .pop_if_empty()
            .push("spreadsheets")
            .extend(segments);
        Ok(url)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_times(self.http_retries as usize)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> SheetResult<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    async fn post_json<T: DeserializeOwned>(&self, url: Url, body: &Value) -> SheetResult<T> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> SheetResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(SheetError::Api {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| SheetError::Malformed(e.to_string()))
    }
}

fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetStore for GoogleSheetsStore {
    fn provider_name(&self) -> &'static str {
        "google"
    }

    async fn read_column(&self, column: &str, start_row: i64) -> SheetResult<Vec<String>> {
        let range = column_range(&self.sheet_name, column, start_row);
        let mut url = self.endpoint(&[self.spreadsheet_id.as_str(), "values", range.as_str()])?;
        url.query_pairs_mut().append_pair("majorDimension", "ROWS");

        let body: ValueRange = (|| async { self.get_json(url.clone()).await })
            .retry(&self.backoff())
            .when(|e: &SheetError| e.is_retryable())
            .notify(|e: &SheetError, dur: Duration| {
                warn!("[Sheets::Google] read {} failed, retrying in {:?}: {}", range, dur, e);
            })
            .await?;

        let cells: Vec<String> = body
            .values
            .iter()
            .map(|row| row.first().map(cell_to_string).unwrap_or_default())
            .collect();
        debug!("[Sheets::Google] read {} cells from {}", cells.len(), range);
        Ok(cells)
    }

    async fn batch_update(&self, updates: &[RowUpdate]) -> SheetResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&[self.spreadsheet_id.as_str(), "values:batchUpdate"])?;
        let data: Vec<Value> = updates
            .iter()
            .map(|u| {
                json!({
                    "range": row_range(&self.sheet_name, u.row),
                    "majorDimension": "ROWS",
                    "values": [u.values],
                })
            })
            .collect();
        let body = json!({
            "valueInputOption": VALUE_INPUT_OPTION,
            "data": data,
        });

        // 覆盖写入是幂等的，可以安全重试
        let _: Value = (|| async { self.post_json(url.clone(), &body).await })
            .retry(&self.backoff())
            .when(|e: &SheetError| e.is_retryable())
            .await?;
        debug!("[Sheets::Google] updated {} rows", updates.len());
        Ok(())
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> SheetResult<AppendOutcome> {
        if rows.is_empty() {
            return Err(SheetError::Other("append called with no rows".to_string()));
        }
        let target = format!("{}:append", table_range(&self.sheet_name));
        let mut url = self.endpoint(&[self.spreadsheet_id.as_str(), "values", target.as_str()])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", VALUE_INPUT_OPTION)
            .append_pair("insertDataOption", "INSERT_ROWS");
        let body = json!({
            "majorDimension": "ROWS",
            "values": rows,
        });

        let resp: AppendResponse = self.post_json(url, &body).await?;
        let updates = resp
            .updates
            .ok_or_else(|| SheetError::Malformed("append response without updates".into()))?;
        let range = updates.updated_range.unwrap_or_default();
        let start_row = parse_start_row(&range).ok_or_else(|| {
            SheetError::Malformed(format!("cannot parse updatedRange '{range}'"))
        })?;
        let row_count = updates.updated_rows.unwrap_or(rows.len());

        debug!(
            "[Sheets::Google] appended {} rows at {}",
            row_count, start_row
        );
        Ok(AppendOutcome {
            start_row,
            row_count,
        })
    }

    async fn copy_row_format(
        &self,
        source_row: i64,
        start_row: i64,
        count: usize,
    ) -> SheetResult<()> {
        if count == 0 {
            return Ok(());
        }
        let url = self.endpoint(&[format!("{}:batchUpdate", self.spreadsheet_id).as_str()])?;
        let width = COLUMNS.len() as i64;
        let body = json!({
            "requests": [{
                "copyPaste": {
                    "source": {
                        "sheetId": self.sheet_gid,
                        "startRowIndex": source_row - 1,
                        "endRowIndex": source_row,
                        "startColumnIndex": 0,
                        "endColumnIndex": width,
                    },
                    "destination": {
                        "sheetId": self.sheet_gid,
                        "startRowIndex": start_row - 1,
                        "endRowIndex": start_row - 1 + count as i64,
                        "startColumnIndex": 0,
                        "endColumnIndex": width,
                    },
                    "pasteType": "PASTE_FORMAT",
                    "pasteOrientation": "NORMAL",
                }
            }]
        });

        let _: Value = self.post_json(url, &body).await?;
        Ok(())
    }
}
