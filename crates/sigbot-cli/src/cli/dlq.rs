//! Dead-letter queue commands: inspect, replay.

use anyhow::{Result, bail};
use chrono::Utc;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use sigbot_core::dlq::{DeadLetterQueue, payload_to_frame};
use sigbot_core::ingest::ReplayBuffer;
use sigbot_types::dlq::{DeadLetter, DlqEntry};
use sigbot_types::message::ReplayEntry;

use crate::state::AppState;

const PAYLOAD_PREVIEW_CHARS: usize = 60;

/// List every stored dead letter.
pub async fn inspect(state: &AppState, json: bool) -> Result<()> {
    let entries = state.dead_letter_queue().inspect().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!(
            "  {} Dead-letter queue '{}' is empty.",
            style("i").blue().bold(),
            style(&state.config.dlq.name).bold()
        );
        println!();
        return Ok(());
    }

    println!();
    println!("{}", entries_table(&entries, Utc::now()));
    println!();
    println!(
        "  {} entr{} in '{}'",
        style(entries.len()).bold(),
        if entries.len() == 1 { "y" } else { "ies" },
        state.config.dlq.name
    );
    println!();
    Ok(())
}

fn entries_table(entries: &[DlqEntry], now: chrono::DateTime<Utc>) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("ID").fg(Color::White),
        Cell::new("Reason").fg(Color::White),
        Cell::new("Retries").fg(Color::White),
        Cell::new("Next retry").fg(Color::White),
        Cell::new("Payload").fg(Color::White),
    ]);

    for entry in entries {
        let next_retry = if entry.is_ready(now) {
            Cell::new("ready").fg(Color::Green)
        } else {
            Cell::new(entry.next_retry_at.format("%Y-%m-%d %H:%M:%S").to_string()).fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(entry.id).fg(Color::DarkGrey),
            Cell::new(entry.reason.as_deref().unwrap_or("-")).fg(Color::Cyan),
            Cell::new(entry.retry_count),
            next_retry,
            Cell::new(preview(&entry.payload.to_string())),
        ]);
    }
    table
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PAYLOAD_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(PAYLOAD_PREVIEW_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

/// Counts from one `dlq replay` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub moved: usize,
    pub pending: usize,
    pub discarded: usize,
}

/// Move due dead letters into the durable ingest queue.
///
/// The next `sigbot run` recovers them from there before it starts
/// listening. Entries that cannot be written to the ingest queue go back to
/// the DLQ with their retry count. Moved frames keep the retry count as their
/// attempt count, so a failure after replay is counted against it.
pub async fn replay_into(dlq: &DeadLetterQueue, buffer: &ReplayBuffer) -> Result<ReplayReport> {
    let (ready, summary) = dlq.replay_detailed().await?;
    let mut report = ReplayReport {
        moved: 0,
        pending: summary.pending,
        discarded: summary.discarded,
    };

    let mut remaining = ready.into_iter();
    while let Some(entry) = remaining.next() {
        let frame = ReplayEntry {
            raw: payload_to_frame(&entry.payload),
            enqueued_at: Utc::now(),
            attempts: entry.retry_count,
        };
        if let Err(e) = buffer.append_entry(&frame).await {
            tracing::error!(error = %e, "ingest queue write failed, returning entries to the DLQ");
            for entry in std::iter::once(entry).chain(remaining) {
                dlq.send_with(restore(entry)).await?;
                report.pending += 1;
            }
            return Err(e.into());
        }
        report.moved += 1;
    }
    Ok(report)
}

fn restore(entry: DlqEntry) -> DeadLetter {
    let mut letter = DeadLetter::new(entry.payload).with_retry_count(entry.retry_count.saturating_sub(1));
    letter.reason = entry.reason;
    letter.metadata = entry.metadata;
    letter
}

pub async fn replay(state: &AppState, json: bool) -> Result<()> {
    let Some(buffer) = state.replay_buffer() else {
        bail!("ingest.durable_queue_enabled is false; replayed entries would have nowhere to go");
    };
    let report = replay_into(&state.dead_letter_queue(), &buffer).await?;

    if json {
        println!(
            "{}",
            json!({
                "moved": report.moved,
                "pending": report.pending,
                "discarded": report.discarded,
                "ingest_queue": buffer.key(),
            })
        );
        return Ok(());
    }

    println!();
    println!(
        "  {} Moved {} dead letter(s) to '{}'",
        style("✓").green().bold(),
        style(report.moved).bold(),
        buffer.key()
    );
    println!("  Still waiting: {}", report.pending);
    if report.discarded > 0 {
        println!("  Discarded (retries exhausted): {}", style(report.discarded).yellow());
    }
    if report.moved > 0 {
        println!(
            "  {}",
            style("They are processed on the next `sigbot run`.").dim()
        );
    }
    println!();
    Ok(())
}
