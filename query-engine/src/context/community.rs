use common::utils::tokens::TokenCounter;
use graph_store::CommunityReport;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use tracing::warn;

use super::table::{section_banner, ContextTable, DEFAULT_COLUMN_DELIMITER};

#[derive(Debug, Clone)]
pub struct CommunityContextParams {
    pub use_community_summary: bool,
    pub column_delimiter: char,
    pub shuffle_data: bool,
    pub include_community_rank: bool,
    pub min_community_rank: f64,
    pub max_tokens: usize,
    /// With `single_batch` the first overflowing row ends packing; otherwise
    /// it opens the next batch.
    pub single_batch: bool,
    pub context_name: String,
    pub random_seed: u64,
}

impl Default for CommunityContextParams {
    fn default() -> Self {
        Self {
            use_community_summary: true,
            column_delimiter: DEFAULT_COLUMN_DELIMITER,
            shuffle_data: true,
            include_community_rank: false,
            min_community_rank: 0.0,
            max_tokens: 8000,
            single_batch: false,
            context_name: "Reports".to_string(),
            random_seed: 42,
        }
    }
}

/// Packs community reports into token-budgeted batches of delimited rows,
/// each batch under its own banner. Returns the batch texts and the table of
/// rows that made it into any batch.
pub fn build_community_context(
    reports: &[&CommunityReport],
    counter: &TokenCounter,
    params: &CommunityContextParams,
) -> (Vec<String>, ContextTable) {
    let mut columns = vec!["id", "title"];
    columns.push(if params.use_community_summary {
        "summary"
    } else {
        "content"
    });
    if params.include_community_rank {
        columns.push("rank");
    }
    let empty = ContextTable::new(&columns);

    let mut selected: Vec<&CommunityReport> = reports
        .iter()
        .copied()
        .filter(|report| report.rank >= params.min_community_rank)
        .collect();
    if selected.is_empty() {
        return (Vec::new(), empty);
    }
    if params.shuffle_data {
        let mut rng = StdRng::seed_from_u64(params.random_seed);
        selected.shuffle(&mut rng);
    }

    let banner = section_banner(&params.context_name);
    let base_tokens = counter.count(&format!("{banner}{}", empty.to_delimited(params.column_delimiter)));

    let mut batches: Vec<String> = Vec::new();
    let mut included = empty.clone();
    let mut batch = empty.clone();
    let mut batch_tokens = base_tokens;

    for report in selected {
        let row = report_row(report, params);
        let row_tokens = counter.count(&format!(
            "{}\n",
            row.join(&params.column_delimiter.to_string())
        ));

        if batch_tokens + row_tokens > params.max_tokens {
            if params.single_batch {
                if batch.is_empty() {
                    warn!(
                        context = %params.context_name,
                        "Community context budget too small for a single report"
                    );
                }
                break;
            }
            if !batch.is_empty() {
                batches.push(format!(
                    "{banner}{}",
                    batch.to_delimited(params.column_delimiter)
                ));
                batch = empty.clone();
                batch_tokens = base_tokens;
            }
        }

        batch_tokens += row_tokens;
        batch.push_row(row.clone());
        included.push_row(row);
    }

    if !batch.is_empty() {
        batches.push(format!(
            "{banner}{}",
            batch.to_delimited(params.column_delimiter)
        ));
    }

    (batches, included)
}

fn report_row(report: &CommunityReport, params: &CommunityContextParams) -> Vec<String> {
    let mut row = vec![
        report.short_id.clone().unwrap_or_default(),
        report.title.clone(),
        if params.use_community_summary {
            report.summary.clone()
        } else {
            report.full_content.clone()
        },
    ];
    if params.include_community_rank {
        row.push(format_rank(report.rank));
    }
    row
}

pub(crate) fn format_rank(rank: f64) -> String {
    if rank.fract() == 0.0 {
        format!("{}", rank as i64)
    } else {
        rank.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, title: &str, summary: &str, rank: f64) -> CommunityReport {
        CommunityReport {
            id: id.to_string(),
            short_id: Some(id.to_string()),
            community_id: id.to_string(),
            title: title.to_string(),
            summary: summary.to_string(),
            full_content: format!("{summary} (full)"),
            rank,
            attributes: None,
        }
    }

    fn counter() -> TokenCounter {
        TokenCounter::new("cl100k_base").unwrap()
    }

    #[test]
    fn test_single_batch_packs_prefix() {
        let reports = vec![
            report("1", "One", "first community summary", 5.0),
            report("2", "Two", "second community summary", 4.0),
        ];
        let refs: Vec<&CommunityReport> = reports.iter().collect();
        let params = CommunityContextParams {
            shuffle_data: false,
            single_batch: true,
            ..CommunityContextParams::default()
        };
        let (batches, table) = build_community_context(&refs, &counter(), &params);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].starts_with("-----Reports-----\n"));
        assert!(batches[0].contains("id|title|summary"));
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_multiple_batches_when_budget_is_tight() {
        let reports: Vec<CommunityReport> = (0..6)
            .map(|i| {
                report(
                    &i.to_string(),
                    &format!("Community {i}"),
                    "a fairly long community report summary used for batching",
                    1.0,
                )
            })
            .collect();
        let refs: Vec<&CommunityReport> = reports.iter().collect();
        let params = CommunityContextParams {
            shuffle_data: false,
            max_tokens: 60,
            ..CommunityContextParams::default()
        };
        let (batches, table) = build_community_context(&refs, &counter(), &params);
        assert!(batches.len() > 1);
        assert_eq!(table.rows.len(), 6);
        for batch in &batches {
            assert!(batch.starts_with("-----Reports-----\n"));
        }
    }

    #[test]
    fn test_min_rank_filters_reports() {
        let reports = vec![
            report("1", "Low", "low rank", 1.0),
            report("2", "High", "high rank", 9.0),
        ];
        let refs: Vec<&CommunityReport> = reports.iter().collect();
        let params = CommunityContextParams {
            shuffle_data: false,
            min_community_rank: 5.0,
            ..CommunityContextParams::default()
        };
        let (batches, table) = build_community_context(&refs, &counter(), &params);
        assert_eq!(table.rows.len(), 1);
        assert!(batches[0].contains("High"));
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let reports: Vec<CommunityReport> = (0..8)
            .map(|i| report(&i.to_string(), &format!("C{i}"), "summary", 1.0))
            .collect();
        let refs: Vec<&CommunityReport> = reports.iter().collect();
        let params = CommunityContextParams::default();
        let (first, _) = build_community_context(&refs, &counter(), &params);
        let (second, _) = build_community_context(&refs, &counter(), &params);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_reports_yield_empty_context() {
        let (batches, table) = build_community_context(&[], &counter(), &CommunityContextParams::default());
        assert!(batches.is_empty());
        assert!(table.is_empty());
        assert_eq!(table.columns, vec!["id", "title", "summary"]);
    }
}
