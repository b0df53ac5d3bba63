//! Output formatting for canboot (table, json)

use canboot_uds::{Candidate, NodeReading, Notification, Severity, UdsIdentifiers};
use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Where and how results are rendered
///
/// Human-readable messages go to stdout in table mode and to stderr in json
/// mode, so json output stays parseable.
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    fn message(&self, line: ColoredString) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Table => println!("{}", line),
            OutputFormat::Json => eprintln!("{}", line),
        }
    }

    pub fn success(&self, msg: &str) {
        self.message(msg.green());
    }

    pub fn info(&self, msg: &str) {
        self.message(msg.normal());
    }

    /// Always shown, even when quiet
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Echo bootloader status lines
    pub fn status(&self, notification: &Notification) {
        if let Notification::Status { severity, message } = notification {
            match severity {
                Severity::Info => self.info(message),
                Severity::Success => self.success(message),
                Severity::Error => self.error(message),
            }
        }
    }

    /// Rows as a table or a json array
    pub fn print<T: Tabled + Serialize>(&self, rows: &[T]) {
        match self.format {
            OutputFormat::Table if rows.is_empty() => self.info("Nothing heard on the bus"),
            OutputFormat::Table => println!("{}", Table::new(rows)),
            OutputFormat::Json => println!("{}", to_json(rows)),
        }
    }

    /// Labelled values; json keys are the labels in snake_case
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
                for (key, value) in pairs {
                    let label = format!("{:>width$}", key, width = width);
                    println!("{}: {}", label.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (json_key(k), serde_json::Value::String(v.clone())))
                    .collect();
                println!("{}", to_json(&map));
            }
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn json_key(label: &str) -> String {
    label.to_lowercase().replace(' ', "_")
}

/// Identifier pair as key-value rows
pub fn identifier_pairs(identifiers: &UdsIdentifiers) -> Vec<(&'static str, String)> {
    vec![
        ("TX ID", identifiers.tx.to_string()),
        ("RX ID", identifiers.rx.to_string()),
        ("ECU address", format!("0x{:02X}", identifiers.ecu_address())),
        ("Tester address", format!("0x{:02X}", identifiers.tester_address())),
    ]
}

// =============================================================================
// Display types
// =============================================================================

/// Node display for detect command
#[derive(Debug, Tabled, Serialize)]
pub struct CandidateRow {
    #[tabled(rename = "Address")]
    pub address: String,
    #[tabled(rename = "UDS frames")]
    pub uds: u64,
    #[tabled(rename = "Frames")]
    pub total: u64,
    #[tabled(rename = "Tester")]
    pub tester: String,
}

impl From<&Candidate> for CandidateRow {
    fn from(c: &Candidate) -> Self {
        Self {
            address: format!("0x{:02X}", c.address),
            uds: c.uds,
            total: c.total,
            tester: format!("0x{:02X}", c.tester),
        }
    }
}

/// Node telemetry for collect command
#[derive(Debug, Tabled, Serialize)]
pub struct ReadingRow {
    #[tabled(rename = "Node")]
    pub node: String,
    #[tabled(rename = "Period")]
    pub period: u32,
    #[tabled(rename = "Fuel level")]
    pub fuel_level: u32,
    #[tabled(rename = "Temperature")]
    pub temperature: String,
    #[tabled(rename = "Fuel reads")]
    pub fuel_count: u64,
    #[tabled(rename = "Temperature reads")]
    pub temperature_count: u64,
}

impl From<&NodeReading> for ReadingRow {
    fn from(r: &NodeReading) -> Self {
        Self {
            node: format!("0x{:02X}", r.address),
            period: r.period,
            fuel_level: r.fuel_level,
            temperature: format!("{:.1}", r.temperature),
            fuel_count: r.fuel_count,
            temperature_count: r.temperature_count,
        }
    }
}
