use serde::Deserialize;

fn default_data_period_years() -> u32 {
    3
}

fn default_top_n_count() -> u32 {
    20
}

/// Tunables for a pattern-analysis run. Every field participates in the
/// cache key so distinct parameterizations never share a cached result.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AnalysisParams {
    pub analysis_type: String,
    #[serde(default)]
    pub ma_periods: Vec<u32>,
    #[serde(default)]
    pub exclude_negatives: bool,
    #[serde(default = "default_data_period_years")]
    pub data_period_years: u32,
    #[serde(default = "default_top_n_count")]
    pub top_n_count: u32,
}

/// The two batch kinds the daemon can launch. `force` on an update is
/// forwarded to the script as `--force` (full re-fetch) and doubles as the
/// same-identity lock re-entry flag at the API layer.
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    ListingUpdate { workers: u32, force: bool },
    PatternAnalysis(AnalysisParams),
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::ListingUpdate { .. } => "update",
            JobKind::PatternAnalysis(_) => "analysis",
        }
    }

    pub fn is_analysis(&self) -> bool {
        matches!(self, JobKind::PatternAnalysis(_))
    }

    /// Cache key for cache-eligible kinds: the kind plus every tunable.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            JobKind::ListingUpdate { .. } => None,
            JobKind::PatternAnalysis(p) => {
                let periods = p
                    .ma_periods
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                Some(format!(
                    "analysis_{}_{}_{}_{}_{}",
                    p.analysis_type,
                    periods,
                    p.exclude_negatives,
                    p.data_period_years,
                    p.top_n_count
                ))
            }
        }
    }

    /// Argv passed to the script after the interpreter and script path.
    /// Values are forwarded unmodified; their semantics belong to the
    /// script.
    pub fn script_args(&self) -> Vec<String> {
        match self {
            JobKind::ListingUpdate { workers, force } => {
                let mut args = vec!["--workers".to_string(), workers.to_string()];
                if *force {
                    args.push("--force".to_string());
                }
                args
            }
            JobKind::PatternAnalysis(p) => {
                let mut args = vec![
                    "--analysis_type".to_string(),
                    p.analysis_type.clone(),
                    "--data_period_years".to_string(),
                    p.data_period_years.to_string(),
                    "--top_n_count".to_string(),
                    p.top_n_count.to_string(),
                ];
                if !p.ma_periods.is_empty() {
                    args.push("--ma_periods".to_string());
                    args.push(
                        p.ma_periods
                            .iter()
                            .map(|n| n.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                }
                if p.exclude_negatives {
                    args.push("--exclude_negatives".to_string());
                }
                args
            }
        }
    }
}
