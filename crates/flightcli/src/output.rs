use std::fmt::Display;

use anyhow::{Context, Result};
use clap::ValueEnum;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, cell, row};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Prints one row per lookup, followed by a summary.
    Table,
    /// Prints the entire report as JSON.
    Json,
}

/// The outcome of a single lookup.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Ok { value: String },
    Error { error: String },
}

impl<T: Display, E: Display> From<&Result<T, E>> for Outcome {
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Ok {
                value: value.to_string(),
            },
            Err(error) => Outcome::Error {
                error: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReportRow {
    pub key: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Everything a command did, in the order the lookups were issued.
#[derive(Debug, Serialize)]
pub struct Report {
    pub command: &'static str,
    pub rows: Vec<ReportRow>,
    /// The number of loader invocations, e.g. requests or connects.
    pub loads: usize,
    /// What `loads` counts, used as the label in the summary.
    #[serde(skip)]
    pub loads_label: &'static str,
}

impl Report {
    pub fn new(command: &'static str, loads_label: &'static str) -> Self {
        Self {
            command,
            rows: Vec::new(),
            loads: 0,
            loads_label,
        }
    }

    pub fn push(&mut self, key: impl ToString, outcome: Outcome) {
        self.rows.push(ReportRow {
            key: key.to_string(),
            outcome,
        });
    }

    pub fn failures(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| matches!(row.outcome, Outcome::Error { .. }))
            .count()
    }
}

pub fn print(report: &Report, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            render_table(report).printstd();
            println!();
            println!("{}: {}", report.loads_label, report.loads);
        }
        OutputFormat::Json => println!("{}", render_json(report)?),
    }
    Ok(())
}

fn render_table(report: &Report) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Key", "Status", "Result"]);

    for row in &report.rows {
        match &row.outcome {
            Outcome::Ok { value } => table.add_row(row![r->row.key, "ok", value]),
            Outcome::Error { error } => table.add_row(row![r->row.key, Fr->"error", error]),
        };
    }

    table
}

fn render_json(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to serialize report")
}
