use regex::Regex;
use std::sync::LazyLock;

// Item progress as emitted by both scripts: "[12/345] [3.5%]".
static ITEM_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(\d+)/(\d+)\s*\]\s*\[\s*(\d+\.?\d*)%\s*\]").unwrap()
});
// Explicit percentage the scripts print at phase boundaries: "[PROGRESS] 40".
static EXPLICIT_PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[PROGRESS\]\s*(\d+(?:\.\d+)?)").unwrap());
// Listing-phase counters, update script only.
static LISTING_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[KRX_TOTAL\]\s*(\d+)").unwrap());
static LISTING_SAVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[KRX_SAVED\]\s*(\d+)").unwrap());
// Data-phase "(saved/total)" counter, update script only.
static ITEM_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)/(\d+)\)").unwrap());

/// Classification of one line of script output. Rules are evaluated in a
/// fixed priority order; anything unrecognized is a plain log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    ItemProgress { current: u64, total: u64, percent: f64 },
    ExplicitProgress(f64),
    ListingTotal(u64),
    ListingSaved(u64),
    ItemCount { saved: u64, total: u64 },
    FinalResult(serde_json::Value),
    Log,
}

pub fn classify(raw: &str) -> LineEvent {
    let line = raw.trim();

    if let Some(caps) = ITEM_PROGRESS.captures(line) {
        return LineEvent::ItemProgress {
            current: parse_u64(&caps[1]),
            total: parse_u64(&caps[2]),
            percent: parse_f64(&caps[3]),
        };
    }
    if let Some(caps) = EXPLICIT_PROGRESS.captures(line) {
        return LineEvent::ExplicitProgress(parse_f64(&caps[1]));
    }
    if let Some(caps) = LISTING_TOTAL.captures(line) {
        return LineEvent::ListingTotal(parse_u64(&caps[1]));
    }
    if let Some(caps) = LISTING_SAVED.captures(line) {
        return LineEvent::ListingSaved(parse_u64(&caps[1]));
    }
    if let Some(caps) = ITEM_COUNT.captures(line) {
        return LineEvent::ItemCount {
            saved: parse_u64(&caps[1]),
            total: parse_u64(&caps[2]),
        };
    }
    if line.starts_with('{') && line.ends_with('}') {
        // A malformed payload is demoted to a plain log line, never an error.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line)
            && value.is_object()
        {
            return LineEvent::FinalResult(value);
        }
    }
    LineEvent::Log
}

fn parse_u64(s: &str) -> u64 {
    s.trim().parse().unwrap_or(0)
}

fn parse_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

/// Running progress estimate for one task. The update script reports two
/// phases (listing fetch, then per-item data) whose counters are blended
/// 20/80; an explicit `[PROGRESS]` marker wins whenever it is greater. The
/// status board additionally clamps progress to be non-decreasing, so a
/// late low estimate here can never regress what clients see.
#[derive(Debug, Default)]
pub struct ProgressGauge {
    listing_total: u64,
    listing_saved: u64,
    item_total: u64,
    item_saved: u64,
    explicit: f64,
    current_item: u64,
}

impl ProgressGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &LineEvent) {
        match event {
            LineEvent::ItemProgress {
                current, percent, ..
            } => {
                self.current_item = self.current_item.max(*current);
                self.explicit = self.explicit.max(*percent);
            }
            LineEvent::ExplicitProgress(pct) => self.explicit = self.explicit.max(*pct),
            LineEvent::ListingTotal(n) => self.listing_total = *n,
            LineEvent::ListingSaved(n) => self.listing_saved = *n,
            LineEvent::ItemCount { saved, total } => {
                self.item_saved = *saved;
                self.item_total = *total;
                self.current_item = self.current_item.max(*saved);
            }
            LineEvent::FinalResult(_) | LineEvent::Log => {}
        }
    }

    pub fn percent(&self) -> f64 {
        let listing_pct = ratio(self.listing_saved, self.listing_total);
        let data_pct = ratio(self.item_saved, self.item_total);
        let weighted = (listing_pct * 0.2 + data_pct * 0.8).min(100.0);
        weighted.max(self.explicit).min(100.0)
    }

    pub fn current_item(&self) -> u64 {
        self.current_item
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_progress_line_is_recognized() {
        assert_eq!(
            classify("[ 12/345 ] [ 3.5% ] fetching 005930"),
            LineEvent::ItemProgress {
                current: 12,
                total: 345,
                percent: 3.5
            }
        );
    }

    #[test]
    fn explicit_progress_marker_is_recognized() {
        assert_eq!(classify("[PROGRESS] 40"), LineEvent::ExplicitProgress(40.0));
        assert_eq!(
            classify("phase done [PROGRESS] 62.5"),
            LineEvent::ExplicitProgress(62.5)
        );
    }

    #[test]
    fn listing_counters_are_recognized() {
        assert_eq!(classify("[KRX_TOTAL] 2600"), LineEvent::ListingTotal(2600));
        assert_eq!(classify("[KRX_SAVED] 1300"), LineEvent::ListingSaved(1300));
        assert_eq!(
            classify("saved batch (40/200)"),
            LineEvent::ItemCount {
                saved: 40,
                total: 200
            }
        );
    }

    #[test]
    fn standalone_json_object_is_a_final_result() {
        let event = classify(r#"{"patterns": 2, "top": ["005930"]}"#);
        match event {
            LineEvent::FinalResult(value) => assert_eq!(value["patterns"], 2),
            other => panic!("expected FinalResult, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_degrades_to_plain_log() {
        assert_eq!(classify("{not json at all"), LineEvent::Log);
        assert_eq!(classify("{\"unterminated\": "), LineEvent::Log);
        // A bare JSON array is not a map-shaped result.
        assert_eq!(classify("[1, 2, 3]"), LineEvent::Log);
    }

    #[test]
    fn ordinary_text_is_a_plain_log() {
        assert_eq!(classify("connecting to data source..."), LineEvent::Log);
        assert_eq!(classify(""), LineEvent::Log);
    }

    #[test]
    fn progress_rule_outranks_json_rule() {
        // Priority order is fixed: a line matching the progress shape is
        // progress even if later rules could also match.
        assert_eq!(
            classify("[1/2] [50%]"),
            LineEvent::ItemProgress {
                current: 1,
                total: 2,
                percent: 50.0
            }
        );
    }

    #[test]
    fn gauge_blends_phases_twenty_eighty() {
        let mut gauge = ProgressGauge::new();
        gauge.observe(&LineEvent::ListingTotal(100));
        gauge.observe(&LineEvent::ListingSaved(100));
        gauge.observe(&LineEvent::ItemCount {
            saved: 50,
            total: 100,
        });
        assert_eq!(gauge.percent(), 20.0 + 40.0);
    }

    #[test]
    fn explicit_marker_wins_when_greater() {
        let mut gauge = ProgressGauge::new();
        gauge.observe(&LineEvent::ListingTotal(100));
        gauge.observe(&LineEvent::ListingSaved(10));
        gauge.observe(&LineEvent::ExplicitProgress(75.0));
        assert_eq!(gauge.percent(), 75.0);
    }

    #[test]
    fn explicit_marker_never_lowers_the_gauge() {
        let mut gauge = ProgressGauge::new();
        gauge.observe(&LineEvent::ExplicitProgress(40.0));
        gauge.observe(&LineEvent::ExplicitProgress(25.0));
        assert_eq!(gauge.percent(), 40.0);
    }

    #[test]
    fn gauge_tracks_the_highest_item_seen() {
        let mut gauge = ProgressGauge::new();
        gauge.observe(&LineEvent::ItemProgress {
            current: 7,
            total: 100,
            percent: 7.0,
        });
        gauge.observe(&LineEvent::ItemCount {
            saved: 5,
            total: 100,
        });
        assert_eq!(gauge.current_item(), 7);
    }
}
