use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One reply received by `send`.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyRecord {
    pub seq: u64,
    pub text: String,
    pub round_trip_ms: f64,
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    event: &'a str,
    seq: u64,
    size: usize,
    text: &'a str,
    round_trip_ms: f64,
    timestamp: String,
}

/// Print replies. JSON is one object per line; table and pretty summarize.
pub fn print_replies(replies: &[ReplyRecord], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for reply in replies {
                let out = ReplyOutput {
                    event: "echo-reply",
                    seq: reply.seq,
                    size: reply.text.len(),
                    text: &reply.text,
                    round_trip_ms: reply.round_trip_ms,
                    timestamp: now_unix_seconds(),
                };
                println!(
                    "{}",
                    serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "SIZE", "RTT (ms)", "TEXT"]);
            for reply in replies {
                table.add_row(vec![
                    reply.seq.to_string(),
                    reply.text.len().to_string(),
                    format!("{:.3}", reply.round_trip_ms),
                    text_preview(&reply.text),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for reply in replies {
                println!(
                    "seq={} size={} rtt={:.3}ms text={}",
                    reply.seq,
                    reply.text.len(),
                    reply.round_trip_ms,
                    text_preview(&reply.text)
                );
            }
        }
    }
}

fn text_preview(text: &str) -> String {
    const LIMIT: usize = 64;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(LIMIT).collect();
    format!("{head}… ({} bytes)", text.len())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
