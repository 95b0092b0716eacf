//! `rumah run` command.
//!
//! Wires the production pipeline, forwards Ctrl-C to its cancellation
//! token, and prints one summary per source: a text block by default, or
//! a JSON array with `--json`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tracing::warn;

use rumah_harness_core::models::RunSummary;

use crate::config::Config;
use crate::ingest::Pipeline;
use crate::progress::{format_number, ProgressMode};

/// Parse a `--since` value (`YYYY-MM-DD`).
pub fn parse_since(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid --since date '{}', expected YYYY-MM-DD", s))
    })
    .transpose()
}

pub async fn run_cmd(
    config: &Config,
    target: &str,
    queries: &[String],
    since: Option<&str>,
    json: bool,
    progress: ProgressMode,
) -> Result<()> {
    let since = parse_since(since)?;
    if target != "all" && !config.sources.contains_key(target) {
        let known: Vec<&str> = config.sources.keys().map(String::as_str).collect();
        bail!(
            "Unknown source: '{}'. Available: all, {}",
            target,
            known.join(", ")
        );
    }
    if target == "all" && !queries.is_empty() {
        bail!("--query applies to a single source, not 'all'");
    }

    let pipeline = Pipeline::from_config(config.clone())
        .await?
        .with_progress(Arc::from(progress.reporter()));

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });

    let results = if target == "all" {
        pipeline.run_all(since).await
    } else {
        vec![(
            target.to_string(),
            pipeline.run_pipeline(target, queries, since).await,
        )]
    };

    let mut summaries = Vec::new();
    let mut failures = Vec::new();
    for (source, result) in results {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => failures.push(format!("{}: {}", source, e)),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for summary in &summaries {
            print_summary(summary);
        }
    }

    if !failures.is_empty() {
        bail!("run failed: {}", failures.join("; "));
    }
    Ok(())
}

fn print_summary(s: &RunSummary) {
    println!("Run summary: {}", s.source_id);
    println!("  records:     {}", format_number(s.records_seen));
    println!("  new:         {}", format_number(s.new));
    println!("  updated:     {}", format_number(s.updated));
    println!("  duplicates:  {}", format_number(s.duplicates));
    println!("  skipped:     {}", format_number(s.skipped));
    println!("  errors:      {}", s.errors.len());
    for e in s.errors.iter().take(20) {
        println!("    [{}] {}", e.kind, e.context);
    }
    if s.errors.len() > 20 {
        println!("    ... {} more", s.errors.len() - 20);
    }
    println!();
}
