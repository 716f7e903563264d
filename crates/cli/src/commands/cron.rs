//! Offline cron expression checker

use agent_lib::scheduler::{CronField, CronSet};
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::output::{print_info, print_json, print_table, print_warning, OutputFormat};

/// `--count` is user input; larger lists grow as they fill
const MAX_PREALLOCATED: usize = 1024;

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: String,
    #[tabled(rename = "Values")]
    values: String,
}

#[derive(Debug, Serialize)]
pub struct CronReport {
    pub expression: String,
    pub zone: &'static str,
    pub fields: BTreeMap<&'static str, Vec<u32>>,
    pub next: Vec<DateTime<FixedOffset>>,
}

/// Parse `expr` and compute up to `count` fire times after `from`
pub fn evaluate(expr: &str, count: usize, utc: bool, from: DateTime<Utc>) -> Result<CronReport> {
    let cron =
        CronSet::parse(expr).with_context(|| format!("Invalid cron expression {:?}", expr))?;

    let fields = CronField::ALL
        .iter()
        .map(|f| (f.name(), cron.values(*f)))
        .collect();

    let next = if utc {
        fire_times(&cron, count, from.naive_utc(), |t| {
            Some(Utc.from_utc_datetime(&t).fixed_offset())
        })
    } else {
        fire_times(&cron, count, from.with_timezone(&Local).naive_local(), |t| {
            // minutes skipped by a DST jump never fire
            Local
                .from_local_datetime(&t)
                .earliest()
                .map(|at| at.fixed_offset())
        })
    };

    Ok(CronReport {
        expression: expr.to_string(),
        zone: if utc { "utc" } else { "local" },
        fields,
        next,
    })
}

fn fire_times<F>(
    cron: &CronSet,
    count: usize,
    from: NaiveDateTime,
    localize: F,
) -> Vec<DateTime<FixedOffset>>
where
    F: Fn(NaiveDateTime) -> Option<DateTime<FixedOffset>>,
{
    let mut times = Vec::with_capacity(count.min(MAX_PREALLOCATED));
    let mut cursor = from;
    while times.len() < count {
        let Some(next) = cron.next_after(cursor) else {
            break;
        };
        if let Some(at) = localize(next) {
            times.push(at);
        }
        cursor = next;
    }
    times
}

/// Compress sorted values into ranges for display, e.g. `0-5,10,20-22`
fn describe(values: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = values.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if end == start {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(",")
}

pub fn explain(expr: &str, count: usize, utc: bool, format: OutputFormat) -> Result<()> {
    let report = evaluate(expr, count, utc, Utc::now())?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{} {}", "Expression:".bold(), report.expression.cyan());
            print_table(
                CronField::ALL
                    .iter()
                    .map(|f| FieldRow {
                        field: f.name().to_string(),
                        values: describe(&report.fields[f.name()]),
                    })
                    .collect(),
            );

            if report.next.is_empty() {
                print_warning("Expression never fires");
                return Ok(());
            }
            print_info(&format!(
                "Next {} runs ({} time):",
                report.next.len(),
                report.zone
            ));
            for at in &report.next {
                println!("  {}", at.format("%a %Y-%m-%d %H:%M %:z"));
            }
        }
    }

    Ok(())
}
