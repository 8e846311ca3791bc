//! Alert rendering for the DingTalk robot schemas

use crate::types::{AtInfo, BodySchema, MarkdownBody, OutboundAlert, TextBody};
use std::fmt::Write;

/// Title of every markdown alert
pub const MARKDOWN_TITLE: &str = "Error report";

/// Structured fields of a log alert
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlert<'a> {
    pub machine_name: Option<&'a str>,
    pub game_platform: &'a str,
    pub node_name: &'a str,
    pub file_path: &'a str,
    pub message: &'a str,
}

/// Render a structured log alert in the requested schema
pub fn render_log_alert(alert: &LogAlert<'_>, schema: BodySchema, at: AtInfo) -> OutboundAlert {
    match schema {
        BodySchema::Text => OutboundAlert::Text {
            text: TextBody {
                content: text_content(alert),
            },
            at,
        },
        BodySchema::Markdown => OutboundAlert::Markdown {
            markdown: MarkdownBody {
                title: MARKDOWN_TITLE.to_string(),
                text: markdown_content(alert),
            },
            at,
        },
    }
}

/// Render a raw alarm: text schema, content as-is
pub fn render_raw_alarm(text: &str, at: AtInfo) -> OutboundAlert {
    OutboundAlert::Text {
        text: TextBody {
            content: text.to_string(),
        },
        at,
    }
}

fn text_content(alert: &LogAlert<'_>) -> String {
    let mut out = format!(
        "{} platform {} node error report",
        alert.game_platform, alert.node_name
    );
    if let Some(machine) = alert.machine_name {
        let _ = write!(out, "\nmachine: {}", machine);
    }
    let _ = write!(out, "\nfile: {}\n{}", alert.file_path, alert.message);
    out
}

fn markdown_content(alert: &LogAlert<'_>) -> String {
    let mut out = format!(
        "\n\n## {} platform {} node error report\n\n",
        alert.game_platform, alert.node_name
    );
    if let Some(machine) = alert.machine_name {
        let _ = write!(out, "machine: **{}**\n\n", machine);
    }
    let _ = write!(
        out,
        "file: **{}**\n\n```lua\n{}\n```",
        alert.file_path, alert.message
    );
    out
}
