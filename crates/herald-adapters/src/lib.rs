//! Contest source contract + per-platform fetch/parse implementations.
//!
//! Each adapter is a thin fetch wrapper over a pure parse function, so the
//! parsing of every platform's payload is testable against fixture captures
//! without network access.

use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime, TimeZone, Timelike};
use herald_core::ContestInfo;
use herald_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "herald-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {platform} payload: {detail}")]
    Schema {
        platform: &'static str,
        detail: String,
    },
}

/// One external contest site. Implementations are an isolated failure
/// domain: any fetch or parse problem surfaces as a [`SourceError`] for the
/// caller to log, and never aborts the other sources.
#[async_trait]
pub trait ContestSource: Send + Sync {
    fn platform(&self) -> &'static str;

    async fn upcoming_contests(
        &self,
        http: &HttpFetcher,
    ) -> Result<Vec<ContestInfo>, SourceError>;
}

/// The closed set of supported platforms, in merge order.
pub fn default_sources() -> Vec<Box<dyn ContestSource>> {
    vec![
        Box::new(Codeforces),
        Box::new(CodeChef),
        Box::new(AtCoder),
        Box::new(LeetCode),
    ]
}

fn local_naive_from_epoch(
    platform: &'static str,
    epoch_seconds: i64,
) -> Result<NaiveDateTime, SourceError> {
    Local
        .timestamp_opt(epoch_seconds, 0)
        .single()
        .map(|dt| dt.naive_local())
        .ok_or_else(|| SourceError::Schema {
            platform,
            detail: format!("start epoch {epoch_seconds} out of range"),
        })
}

const CODEFORCES_URL: &str = "https://codeforces.com/api/contest.list";

#[derive(Debug, Clone, Copy)]
pub struct Codeforces;

#[derive(Debug, Deserialize)]
struct CodeforcesList {
    result: Vec<CodeforcesContest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeforcesContest {
    id: i64,
    name: String,
    phase: String,
    #[serde(default)]
    start_time_seconds: Option<i64>,
    duration_seconds: i64,
}

fn unusual_time_remark(start_time: NaiveDateTime) -> String {
    if start_time.hour() == 20 {
        String::new()
    } else {
        "Notice the unusual time!".to_string()
    }
}

pub fn parse_codeforces(body: &[u8]) -> Result<Vec<ContestInfo>, SourceError> {
    let list: CodeforcesList =
        serde_json::from_slice(body).map_err(|err| SourceError::Schema {
            platform: "Codeforces",
            detail: err.to_string(),
        })?;

    let mut upcoming = Vec::new();
    for contest in list.result {
        if contest.phase != "BEFORE" {
            continue;
        }
        let Some(start_epoch) = contest.start_time_seconds else {
            continue;
        };
        let start_time = local_naive_from_epoch("Codeforces", start_epoch)?;
        upcoming.push(ContestInfo {
            uid: format!("codeforces-{}", contest.id),
            platform: "Codeforces".to_string(),
            name: contest.name,
            link: format!("https://codeforces.com/contest/{}", contest.id),
            start_time,
            duration_minutes: contest.duration_seconds / 60,
            remark: unusual_time_remark(start_time),
        });
    }
    Ok(upcoming)
}

#[async_trait]
impl ContestSource for Codeforces {
    fn platform(&self) -> &'static str {
        "Codeforces"
    }

    async fn upcoming_contests(
        &self,
        http: &HttpFetcher,
    ) -> Result<Vec<ContestInfo>, SourceError> {
        let response = http.get_bytes(CODEFORCES_URL).await?;
        parse_codeforces(&response.body)
    }
}

const CODECHEF_URL: &str =
    "https://www.codechef.com/api/list/contests/all?sort_by=START&sorting_order=asc&offset=0&mode=all";

#[derive(Debug, Clone, Copy)]
pub struct CodeChef;

#[derive(Debug, Deserialize)]
struct CodeChefList {
    future_contests: Vec<CodeChefContest>,
}

#[derive(Debug, Deserialize)]
struct CodeChefContest {
    contest_code: String,
    contest_name: String,
    contest_start_date_iso: String,
    // The API serves the duration in minutes, as a string.
    contest_duration: String,
}

pub fn parse_codechef(body: &[u8]) -> Result<Vec<ContestInfo>, SourceError> {
    let schema = |detail: String| SourceError::Schema {
        platform: "CodeChef",
        detail,
    };
    let list: CodeChefList = serde_json::from_slice(body).map_err(|err| schema(err.to_string()))?;

    let mut upcoming = Vec::new();
    for contest in list.future_contests {
        // Offset-aware ISO timestamp; keep the wall-clock time and drop the
        // offset, matching the local-naive convention of the store.
        let start_time = chrono::DateTime::parse_from_rfc3339(&contest.contest_start_date_iso)
            .map_err(|err| {
                schema(format!(
                    "unparseable start time {:?}: {err}",
                    contest.contest_start_date_iso
                ))
            })?
            .naive_local();
        let duration_minutes: i64 = contest.contest_duration.trim().parse().map_err(|_| {
            schema(format!(
                "unparseable duration {:?}",
                contest.contest_duration
            ))
        })?;

        upcoming.push(ContestInfo {
            uid: format!("codechef-{}", contest.contest_code),
            platform: "CodeChef".to_string(),
            name: contest.contest_name,
            link: format!("https://www.codechef.com/{}", contest.contest_code),
            start_time,
            duration_minutes,
            remark: String::new(),
        });
    }
    Ok(upcoming)
}

#[async_trait]
impl ContestSource for CodeChef {
    fn platform(&self) -> &'static str {
        "CodeChef"
    }

    async fn upcoming_contests(
        &self,
        http: &HttpFetcher,
    ) -> Result<Vec<ContestInfo>, SourceError> {
        let response = http.get_bytes(CODECHEF_URL).await?;
        parse_codechef(&response.body)
    }
}

const ATCODER_URL: &str = "https://atcoder.jp/contests";

#[derive(Debug, Clone, Copy)]
pub struct AtCoder;

fn parse_hh_mm(text: &str) -> Option<i64> {
    let (hours, minutes) = text.split_once(':')?;
    let hours: i64 = hours.trim().parse().ok()?;
    let minutes: i64 = minutes.trim().parse().ok()?;
    Some(hours * 60 + minutes)
}

fn parse_timeanddate_link(href: &str) -> Result<NaiveDateTime, SourceError> {
    let schema = |detail: String| SourceError::Schema {
        platform: "AtCoder",
        detail,
    };
    let url = Url::parse(href).map_err(|err| schema(format!("bad start-time link: {err}")))?;
    let iso = url
        .query_pairs()
        .find(|(key, _)| key == "iso")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| schema(format!("start-time link without iso parameter: {href}")))?;
    let parsed = ["%Y%m%dT%H%M", "%Y%m%dT%H%M%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&iso, format).ok())
        .ok_or_else(|| schema(format!("unparseable iso start time {iso:?}")))?;
    // The iso value is JST wall time; the notification clock runs 3h30m behind.
    Ok(parsed - Duration::minutes(3 * 60 + 30))
}

pub fn parse_atcoder(body: &str) -> Result<Vec<ContestInfo>, SourceError> {
    let schema = |detail: String| SourceError::Schema {
        platform: "AtCoder",
        detail,
    };
    let document = Html::parse_document(body);
    let row_selector = Selector::parse("div#contest-table-upcoming table tbody tr")
        .map_err(|err| schema(err.to_string()))?;
    let cell_selector = Selector::parse("td").map_err(|err| schema(err.to_string()))?;
    let anchor_selector = Selector::parse("a").map_err(|err| schema(err.to_string()))?;
    let name_pattern = Regex::new(r"AtCoder (Beginner|Regular|Heuristic) Contest (\d+)")
        .map_err(|err| schema(err.to_string()))?;

    let mut upcoming = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<_> = row.select(&cell_selector).collect();
        if cells.len() != 4 {
            continue;
        }

        let name_anchor = cells[1]
            .select(&anchor_selector)
            .next()
            .ok_or_else(|| schema("contest row without name link".to_string()))?;
        let raw_name = name_anchor.text().collect::<String>();
        let raw_name = raw_name.split_whitespace().collect::<Vec<_>>().join(" ");
        let Some(captures) = name_pattern.captures(&raw_name) else {
            continue;
        };
        let contest_type = captures[1].to_string();
        let contest_nr = captures[2].to_string();

        let href = name_anchor
            .value()
            .attr("href")
            .ok_or_else(|| schema("name link without href".to_string()))?;
        let contest_id = href
            .rsplit_once("/contests/")
            .map(|(_, id)| id)
            .ok_or_else(|| schema(format!("unexpected contest link {href}")))?;

        let time_href = cells[0]
            .select(&anchor_selector)
            .next()
            .and_then(|anchor| anchor.value().attr("href"))
            .ok_or_else(|| schema("contest row without start-time link".to_string()))?;
        let start_time = parse_timeanddate_link(time_href)?;

        let duration_cell = cells[2].text().collect::<String>();
        let duration_minutes = parse_hh_mm(duration_cell.trim())
            .ok_or_else(|| schema(format!("unparseable duration {:?}", duration_cell.trim())))?;

        let remark = if contest_type == "Heuristic" {
            "This is a Heuristic contest!".to_string()
        } else {
            String::new()
        };

        upcoming.push(ContestInfo {
            uid: format!("atcoder-{contest_id}"),
            platform: "AtCoder".to_string(),
            name: format!("AtCoder {contest_type} Contest {contest_nr}"),
            link: format!("https://atcoder.jp/contests/{contest_id}"),
            start_time,
            duration_minutes,
            remark,
        });
    }
    Ok(upcoming)
}

#[async_trait]
impl ContestSource for AtCoder {
    fn platform(&self) -> &'static str {
        "AtCoder"
    }

    async fn upcoming_contests(
        &self,
        http: &HttpFetcher,
    ) -> Result<Vec<ContestInfo>, SourceError> {
        let response = http.get_bytes(ATCODER_URL).await?;
        let body = String::from_utf8_lossy(&response.body);
        parse_atcoder(&body)
    }
}

const LEETCODE_URL: &str = "https://leetcode.com/graphql/";
const LEETCODE_QUERY: &str =
    "query topTwoContests { topTwoContests { title titleSlug startTime duration } }";

#[derive(Debug, Clone, Copy)]
pub struct LeetCode;

#[derive(Debug, Deserialize)]
struct LeetCodeResponse {
    data: LeetCodeData,
}

#[derive(Debug, Deserialize)]
struct LeetCodeData {
    #[serde(rename = "topTwoContests")]
    top_two_contests: Vec<LeetCodeContest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeetCodeContest {
    title: String,
    title_slug: String,
    start_time: i64,
    duration: i64,
}

pub fn parse_leetcode(body: &[u8]) -> Result<Vec<ContestInfo>, SourceError> {
    let response: LeetCodeResponse =
        serde_json::from_slice(body).map_err(|err| SourceError::Schema {
            platform: "LeetCode",
            detail: err.to_string(),
        })?;

    let mut upcoming = Vec::new();
    for contest in response.data.top_two_contests {
        let remark = if contest.title.contains("Weekly") {
            "Contest is in morning!".to_string()
        } else {
            String::new()
        };
        upcoming.push(ContestInfo {
            uid: format!("leetcode-{}", contest.title_slug),
            platform: "LeetCode".to_string(),
            name: contest.title,
            link: format!("https://leetcode.com/contest/{}", contest.title_slug),
            start_time: local_naive_from_epoch("LeetCode", contest.start_time)?,
            duration_minutes: contest.duration / 60,
            remark,
        });
    }
    Ok(upcoming)
}

#[async_trait]
impl ContestSource for LeetCode {
    fn platform(&self) -> &'static str {
        "LeetCode"
    }

    async fn upcoming_contests(
        &self,
        http: &HttpFetcher,
    ) -> Result<Vec<ContestInfo>, SourceError> {
        let query = serde_json::json!({ "query": LEETCODE_QUERY });
        let response = http.post_json(LEETCODE_URL, &query).await?;
        parse_leetcode(&response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn codeforces_remark_flags_non_evening_starts() {
        assert_eq!(unusual_time_remark(at(20, 5)), "");
        assert_eq!(unusual_time_remark(at(17, 35)), "Notice the unusual time!");
    }

    #[test]
    fn hh_mm_durations_convert_to_minutes() {
        assert_eq!(parse_hh_mm("01:40"), Some(100));
        assert_eq!(parse_hh_mm("24:00"), Some(1440));
        assert_eq!(parse_hh_mm("100"), None);
        assert_eq!(parse_hh_mm("ab:cd"), None);
    }

    #[test]
    fn timeanddate_links_shift_jst_to_local_clock() {
        let start = parse_timeanddate_link(
            "https://www.timeanddate.com/worldclock/fixedtime.html?iso=20260314T2100&p1=248",
        )
        .expect("parse");
        assert_eq!(start, at(17, 30));
    }

    #[test]
    fn timeanddate_link_without_iso_parameter_is_schema_error() {
        let err = parse_timeanddate_link(
            "https://www.timeanddate.com/worldclock/fixedtime.html?p1=248",
        )
        .expect_err("must fail");
        assert!(matches!(err, SourceError::Schema { platform: "AtCoder", .. }));
    }
}
