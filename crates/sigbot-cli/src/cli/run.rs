//! `sigbot run`: connect to the gateway and process messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use console::style;
use tokio_util::sync::CancellationToken;

use sigbot_core::BotRuntime;
use sigbot_core::dispatch::{Command, MessageContext, MiddlewareDyn, Next};
use sigbot_core::parser::EnvelopeParser;
use sigbot_infra::transport::WebSocketTransport;
use sigbot_observe::metrics_export::MetricsExporter;
use sigbot_types::error::HandlerError;

use crate::state::AppState;

/// Endpoint name the demo reply is guarded under.
const REPLY_ENDPOINT: &str = "reply";

pub struct RunOptions {
    pub export_metrics: bool,
    pub metrics_interval: Duration,
}

pub async fn run(state: AppState, options: RunOptions) -> Result<()> {
    state.config.validate_for_run()?;

    let transport = WebSocketTransport::new(&state.config.account.service_url, &state.config.account.phone_number)
        .context("building gateway transport")?;
    let url = transport.url().to_string();

    let runtime = BotRuntime::new(
        state.config.clone(),
        state.storage.clone(),
        Arc::new(transport),
        Arc::new(EnvelopeParser::new()),
    )?;
    runtime.register(ping_command()?)?;
    runtime.use_middleware(logging_middleware());

    let shutdown = runtime.shutdown_token();
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = crate::shutdown_signal() => {
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        }
    });

    let exporter = options.export_metrics.then(|| Arc::new(MetricsExporter::stdout(options.metrics_interval)));
    let export_task = exporter.clone().map(|exporter| {
        let metrics = runtime.runtime_metrics().clone();
        let stop = shutdown.clone();
        tokio::spawn(export_loop(exporter, options.metrics_interval, stop, move || metrics.snapshot()))
    });

    println!(
        "  {} sigbot listening on {}",
        style("⚡").bold(),
        style(&url).cyan()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let outcome = runtime.run().await;

    shutdown.cancel();
    if let Err(e) = signals.await {
        tracing::debug!(error = %e, "signal task ended abnormally");
    }
    if let Some(task) = export_task {
        if let Err(e) = task.await {
            tracing::debug!(error = %e, "metrics export task ended abnormally");
        }
    }
    if let Some(exporter) = exporter {
        exporter.record(&runtime.metrics());
        exporter.shutdown();
    }

    let snapshot = runtime.metrics();
    println!(
        "\n  Stopped after {} message(s); {} dead letter(s) stored.",
        snapshot.messages_processed, snapshot.dlq.backlog
    );
    outcome.context("runtime stopped with an error")
}

/// `!ping` answers `pong`. No REST client is wired in, so the reply is
/// logged; it still goes through the outbound guard.
fn ping_command() -> Result<Command> {
    let command = Command::builder("ping")
        .trigger("!ping")
        .handler(|ctx: MessageContext| async move {
            let sender = ctx.sender().to_string();
            let conversation = ctx.conversation_id().to_string();
            ctx.outbound()
                .call(REPLY_ENDPOINT, async move {
                    tracing::info!(to = %sender, conversation = %conversation, "pong");
                    Ok::<(), HandlerError>(())
                })
                .await
        })
        .build()?;
    Ok(command)
}

fn logging_middleware() -> Arc<dyn MiddlewareDyn> {
    Arc::new(|ctx: MessageContext, next: Next| async move {
        let started = Instant::now();
        let command = ctx.command.clone();
        let worker_id = ctx.worker_id;
        let sender = ctx.sender().to_string();
        let queue_latency_ms = ctx.queue_latency.as_millis() as u64;

        let result = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => tracing::info!(
                worker_id,
                command = %command,
                sender = %sender,
                queue_latency_ms,
                elapsed_ms,
                "command handled"
            ),
            Err(e) => tracing::warn!(
                worker_id,
                command = %command,
                sender = %sender,
                elapsed_ms,
                error = %e,
                "command failed"
            ),
        }
        result
    })
}

/// Record a snapshot every `every` until `stop` fires.
async fn export_loop<F>(exporter: Arc<MetricsExporter>, every: Duration, stop: CancellationToken, snapshot: F)
where
    F: Fn() -> sigbot_types::metrics::MetricsSnapshot,
{
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                exporter.record(&snapshot());
            }
        }
    }
}
