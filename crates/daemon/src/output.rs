//! Output formatting for the CLI commands

use crate::reconciler::{NodeReport, TickReport};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use divisora_common::Node;
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for Node {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "ADDRESS", "STATUS", "LAST ACTIVITY", "RTT"]
    }

    fn row(&self) -> Vec<String> {
        let last_activity = self
            .status
            .last_activity
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        let rtt = self
            .status
            .response_time_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());

        vec![
            self.meta.name.clone(),
            self.base_url(),
            self.status.state.to_string(),
            last_activity,
            rtt,
        ]
    }
}

impl TableDisplay for NodeReport {
    fn headers() -> Vec<&'static str> {
        vec!["NODE", "STATUS", "NETWORKS", "CUBICLES", "SKIPPED", "ORPHANED", "FAILURES"]
    }

    fn row(&self) -> Vec<String> {
        let failures: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.operation, f.message))
            .collect();

        vec![
            self.node.clone(),
            self.state.to_string(),
            self.networks_created.join(", "),
            self.cubicles_created.join(", "),
            self.skipped
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            self.orphaned.join(", "),
            failures.join("\n"),
        ]
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }

            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
    }
}

/// Print the outcome of a single tick
pub fn print_tick(report: &TickReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if report.skipped {
                println!("Tick {} skipped: another tick is running", report.tick);
                return;
            }
            if let Some(e) = &report.error {
                println!("Tick {} failed: {}", report.tick, e);
                return;
            }
            print_list(&report.nodes, format);
            println!(
                "{} created, {} failures across {} nodes",
                report.created(),
                report.failed(),
                report.nodes.len()
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
    }
}
