//! Durable contest store + HTTP fetch utilities for Contest Herald.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDateTime;
use herald_core::{ContestInfo, ContestRecord};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "herald-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding store file {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no record for uid {0}")]
    UnknownUid(String),
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Durable keyed mapping from contest uid to [`ContestRecord`], stored as one
/// pretty-printed JSON object so an independent tool can read it directly.
///
/// Every operation is an explicit load -> mutate -> commit transaction; the
/// commit writes a temp file in the store directory, fsyncs it, and atomically
/// renames it over the store path. A crash between any two operations leaves
/// the previous committed state intact.
#[derive(Debug, Clone)]
pub struct ContestStore {
    path: PathBuf,
}

impl ContestStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, ContestRecord>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn commit(&self, records: &BTreeMap<String, ContestRecord>) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(records).map_err(|source| StoreError::Encode {
                path: self.path.clone(),
                source,
            })?;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        if let Err(source) = write_and_sync(&mut file, &bytes).await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        Ok(())
    }

    /// Folds one adapter's result into the store: an existing uid gets its
    /// `contest` replaced with flags untouched, an unseen uid is inserted with
    /// all flags false. Never deletes, so one source's merge cannot drop
    /// another source's contests.
    pub async fn merge(&self, incoming: &[ContestInfo]) -> Result<MergeSummary, StoreError> {
        let mut records = self.load().await?;
        let mut summary = MergeSummary::default();
        for contest in incoming {
            match records.get_mut(&contest.uid) {
                Some(record) => {
                    info!(uid = %contest.uid, "updating contest");
                    record.contest = contest.clone();
                    summary.updated += 1;
                }
                None => {
                    info!(uid = %contest.uid, "inserting contest");
                    records.insert(contest.uid.clone(), ContestRecord::new(contest.clone()));
                    summary.inserted += 1;
                }
            }
        }
        self.commit(&records).await?;
        Ok(summary)
    }

    /// Removes every record whose start time is at or before `now` and
    /// returns the removed uids.
    pub async fn prune(&self, now: NaiveDateTime) -> Result<Vec<String>, StoreError> {
        let mut records = self.load().await?;
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.contest.start_time <= now)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in &expired {
            info!(%uid, "removing expired contest");
            records.remove(uid);
        }
        self.commit(&records).await?;
        Ok(expired)
    }

    /// Full snapshot for the notification-decision step.
    pub async fn records(&self) -> Result<BTreeMap<String, ContestRecord>, StoreError> {
        self.load().await
    }

    /// Atomically rewrites one record's three notification booleans.
    pub async fn set_flags(
        &self,
        uid: &str,
        notified_today: bool,
        notified_1hr: bool,
        notified_15min: bool,
    ) -> Result<(), StoreError> {
        let mut records = self.load().await?;
        let record = records
            .get_mut(uid)
            .ok_or_else(|| StoreError::UnknownUid(uid.to_string()))?;
        record.notified_today = notified_today;
        record.notified_1hr = notified_1hr;
        record.notified_15min = notified_15min;
        self.commit(&records).await?;
        Ok(())
    }
}

async fn write_and_sync(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("encoding request body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Timeout-bounded HTTP client shared by the source adapters and the chat
/// delivery channel. Every request is bounded by the configured timeout, so a
/// hung remote cannot stall an update cycle past the retry budget.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.request_with_retry(reqwest::Method::GET, url, None)
            .await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let bytes = serde_json::to_vec(body)?;
        self.request_with_retry(reqwest::Method::POST, url, Some(bytes))
            .await
    }

    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        json_body: Option<Vec<u8>>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut builder = self.client.request(method.clone(), url);
            if let Some(body) = &json_body {
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn contest(uid: &str, day: u32, hour: u32) -> ContestInfo {
        ContestInfo {
            uid: uid.to_string(),
            platform: "Codeforces".to_string(),
            name: format!("Round {uid}"),
            link: format!("https://codeforces.com/contest/{uid}"),
            start_time: NaiveDate::from_ymd_opt(2026, 3, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            duration_minutes: 120,
            remark: String::new(),
        }
    }

    #[tokio::test]
    async fn merge_inserts_new_records_with_flags_unset() {
        let dir = tempdir().expect("tempdir");
        let store = ContestStore::open(dir.path().join("store.json"));

        let summary = store
            .merge(&[contest("codeforces-1", 20, 20)])
            .await
            .expect("merge");
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 0);

        let records = store.records().await.expect("records");
        let record = &records["codeforces-1"];
        assert!(!record.notified_today);
        assert!(!record.notified_1hr);
        assert!(!record.notified_15min);
    }

    #[tokio::test]
    async fn merge_overwrites_contest_but_preserves_flags() {
        let dir = tempdir().expect("tempdir");
        let store = ContestStore::open(dir.path().join("store.json"));

        store
            .merge(&[contest("codeforces-1", 20, 20)])
            .await
            .expect("merge");
        store
            .set_flags("codeforces-1", true, true, false)
            .await
            .expect("set_flags");

        let mut moved = contest("codeforces-1", 21, 18);
        moved.remark = "Notice the unusual time!".to_string();
        let summary = store.merge(&[moved.clone()]).await.expect("second merge");
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.updated, 1);

        let records = store.records().await.expect("records");
        let record = &records["codeforces-1"];
        assert_eq!(record.contest, moved);
        assert!(record.notified_today);
        assert!(record.notified_1hr);
        assert!(!record.notified_15min);
    }

    #[tokio::test]
    async fn prune_removes_started_contests_and_reports_them() {
        let dir = tempdir().expect("tempdir");
        let store = ContestStore::open(dir.path().join("store.json"));

        store
            .merge(&[contest("codeforces-1", 10, 20), contest("codeforces-2", 20, 20)])
            .await
            .expect("merge");

        let now = NaiveDate::from_ymd_opt(2026, 3, 10)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap();
        let removed = store.prune(now).await.expect("prune");
        assert_eq!(removed, vec!["codeforces-1".to_string()]);

        let records = store.records().await.expect("records");
        assert!(!records.contains_key("codeforces-1"));
        assert!(records.contains_key("codeforces-2"));
    }

    #[tokio::test]
    async fn set_flags_on_unknown_uid_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = ContestStore::open(dir.path().join("store.json"));

        let err = store
            .set_flags("codeforces-404", true, false, false)
            .await
            .expect_err("must fail");
        assert!(matches!(err, StoreError::UnknownUid(uid) if uid == "codeforces-404"));
    }

    #[tokio::test]
    async fn committed_state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");

        {
            let store = ContestStore::open(&path);
            store
                .merge(&[contest("codeforces-1", 20, 20)])
                .await
                .expect("merge");
            store
                .set_flags("codeforces-1", true, false, false)
                .await
                .expect("set_flags");
        }

        let reopened = ContestStore::open(&path);
        let records = reopened.records().await.expect("records");
        assert!(records["codeforces-1"].notified_today);
        assert!(!records["codeforces-1"].notified_1hr);
    }

    #[tokio::test]
    async fn corrupt_store_file_surfaces_loudly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{ not json").expect("write corrupt file");

        let store = ContestStore::open(&path);
        let err = store.records().await.expect_err("must fail");
        assert!(err.is_corruption());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_server_side() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
