use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use trendscout_core::{RecommendationDetail, Run};

pub fn report_file_name(run: &Run) -> String {
    format!("report_{}.md", run.started_at.format("%Y%m%d_%H%M"))
}

pub fn render_markdown(run: &Run, details: &[RecommendationDetail]) -> String {
    let mut lines = vec![
        "# Trend to Catalog Report".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.id),
        format!("- Region: {}", run.region),
        format!("- Status: {}", run.status),
        format!("- Started: {}", run.started_at.to_rfc3339()),
        format!(
            "- Finished: {}",
            run.finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        ),
    ];
    if let Some(message) = &run.error_message {
        lines.push(format!("- Error: {message}"));
    }
    lines.push(String::new());
    lines.push("## Recommendations".to_string());
    lines.push(String::new());

    if details.is_empty() {
        lines.push("_No eligible candidates this run._".to_string());
    } else {
        lines.push("| Rank | Keyword | Model | Score | Verdict | Creator | License |".to_string());
        lines.push("|---:|---|---|---:|---|---|---|".to_string());
        for detail in details {
            let rec = &detail.recommendation;
            let title = detail.title.as_deref().unwrap_or(&rec.model_id);
            let model = match &detail.url {
                Some(url) => format!("[{}]({url})", cell(title)),
                None => cell(title),
            };
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                rec.rank,
                cell(&rec.keyword),
                model,
                detail
                    .total_score
                    .map(|s| format!("{s:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
                detail
                    .verdict
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                cell(detail.creator.as_deref().unwrap_or("-")),
                cell(detail.license.as_deref().filter(|l| !l.is_empty()).unwrap_or("-")),
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

pub async fn write_report(
    reports_dir: &Path,
    run: &Run,
    details: &[RecommendationDetail],
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(report_file_name(run));
    fs::write(&path, render_markdown(run, details))
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
