//! Core contest model and notification state for Contest Herald.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "herald-core";

/// Normalized view of one upcoming contest as produced by a source adapter.
///
/// `uid` is stable across polls for the same real-world contest and follows
/// the `<platform-slug>-<platform-native-id>` convention, e.g.
/// `codeforces-1234` or `leetcode-weekly-contest-415`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestInfo {
    pub uid: String,
    pub platform: String,
    pub name: String,
    pub link: String,
    /// Naive local-clock start time; every comparison in the system runs
    /// against the local "now".
    pub start_time: NaiveDateTime,
    pub duration_minutes: i64,
    #[serde(default)]
    pub remark: String,
}

impl ContestInfo {
    /// Contest title prefixed with the platform name, unless the title
    /// already carries it.
    pub fn fullname(&self) -> String {
        if self.name.contains(&self.platform) {
            self.name.clone()
        } else {
            format!("{} {}", self.platform, self.name)
        }
    }

    /// Human-readable duration with zero components omitted, e.g.
    /// "1 day 2 hours 30 minutes".
    pub fn duration_text(&self) -> String {
        let (days, rest) = (
            self.duration_minutes / (24 * 60),
            self.duration_minutes % (24 * 60),
        );
        let (hours, minutes) = (rest / 60, rest % 60);

        let mut parts = Vec::new();
        for (amount, unit) in [(days, "day"), (hours, "hour"), (minutes, "minute")] {
            if amount > 0 {
                let plural = if amount > 1 { "s" } else { "" };
                parts.push(format!("{amount} {unit}{plural}"));
            }
        }
        if parts.is_empty() {
            return "0 minutes".to_string();
        }
        parts.join(" ")
    }
}

impl fmt::Display for ContestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.fullname())?;
        writeln!(f, "{}", self.start_time.format("%d %b %Y, %I:%M %p"))?;
        writeln!(f, "Duration: {}", self.duration_text())?;
        write!(f, "Link: {}", self.link)?;
        if !self.remark.is_empty() {
            write!(f, "\n**{}**", self.remark)?;
        }
        Ok(())
    }
}

/// Lead-time bucket a notification is produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Threshold {
    Today,
    OneHour,
    FifteenMinutes,
}

/// Store-owned wrapper pairing a contest with its per-threshold notification
/// state. Flags only ever transition false -> true, and a finer threshold
/// implies the coarser ones: `notified_15min` implies `notified_1hr` implies
/// `notified_today`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestRecord {
    pub contest: ContestInfo,
    #[serde(default)]
    pub notified_today: bool,
    #[serde(default)]
    pub notified_1hr: bool,
    #[serde(default)]
    pub notified_15min: bool,
}

impl ContestRecord {
    pub fn new(contest: ContestInfo) -> Self {
        Self {
            contest,
            notified_today: false,
            notified_1hr: false,
            notified_15min: false,
        }
    }

    /// Consumes the day-of threshold.
    pub fn mark_today(&mut self) {
        self.notified_today = true;
    }

    /// Consumes the one-hour threshold along with the day-of threshold it
    /// implies.
    pub fn mark_1hr(&mut self) {
        self.notified_1hr = true;
        self.notified_today = true;
    }

    /// Consumes the 15-minute threshold along with both coarser thresholds,
    /// so neither can separately re-fire.
    pub fn mark_15min(&mut self) {
        self.notified_15min = true;
        self.mark_1hr();
    }

    pub fn mark(&mut self, threshold: Threshold) {
        match threshold {
            Threshold::Today => self.mark_today(),
            Threshold::OneHour => self.mark_1hr(),
            Threshold::FifteenMinutes => self.mark_15min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn contest(platform: &str, name: &str, duration_minutes: i64) -> ContestInfo {
        ContestInfo {
            uid: "codeforces-1234".to_string(),
            platform: platform.to_string(),
            name: name.to_string(),
            link: "https://codeforces.com/contest/1234".to_string(),
            start_time: NaiveDate::from_ymd_opt(2026, 3, 14)
                .unwrap()
                .and_hms_opt(20, 0, 0)
                .unwrap(),
            duration_minutes,
            remark: String::new(),
        }
    }

    #[test]
    fn fullname_prefixes_platform_when_missing_from_title() {
        let info = contest("Codeforces", "Round 927 (Div. 3)", 135);
        assert_eq!(info.fullname(), "Codeforces Round 927 (Div. 3)");
    }

    #[test]
    fn fullname_keeps_title_that_already_names_the_platform() {
        let info = contest("AtCoder", "AtCoder Beginner Contest 340", 100);
        assert_eq!(info.fullname(), "AtCoder Beginner Contest 340");
    }

    #[test]
    fn duration_text_pluralizes_and_omits_zero_components() {
        assert_eq!(contest("X", "Y", 90).duration_text(), "1 hour 30 minutes");
        assert_eq!(contest("X", "Y", 60).duration_text(), "1 hour");
        assert_eq!(
            contest("X", "Y", 24 * 60 + 1).duration_text(),
            "1 day 1 minute"
        );
        assert_eq!(
            contest("X", "Y", 2 * 24 * 60 + 150).duration_text(),
            "2 days 2 hours 30 minutes"
        );
        assert_eq!(contest("X", "Y", 0).duration_text(), "0 minutes");
    }

    #[test]
    fn display_renders_full_card_with_remark() {
        let mut info = contest("Codeforces", "Round 927 (Div. 3)", 135);
        info.remark = "Notice the unusual time!".to_string();
        let card = info.to_string();
        assert_eq!(
            card,
            "Codeforces Round 927 (Div. 3)\n\
             14 Mar 2026, 08:00 PM\n\
             Duration: 2 hours 15 minutes\n\
             Link: https://codeforces.com/contest/1234\n\
             **Notice the unusual time!**"
        );
    }

    #[test]
    fn display_skips_remark_line_when_empty() {
        let card = contest("Codeforces", "Round 927 (Div. 3)", 135).to_string();
        assert!(card.ends_with("Link: https://codeforces.com/contest/1234"));
    }

    #[test]
    fn finer_marks_imply_coarser_flags() {
        let mut record = ContestRecord::new(contest("Codeforces", "Round", 120));
        record.mark_1hr();
        assert!(record.notified_today);
        assert!(record.notified_1hr);
        assert!(!record.notified_15min);

        let mut record = ContestRecord::new(contest("Codeforces", "Round", 120));
        record.mark_15min();
        assert!(record.notified_today);
        assert!(record.notified_1hr);
        assert!(record.notified_15min);
    }
}
