//! Raw traffic inspection.
//!
//! Subscribes to a pattern and prints every message until shutdown. Payloads
//! that parse as JSON are pretty-printed; anything else is shown verbatim.

use std::future::Future;
use std::io::Write;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bus::{BusClient, BusMessage};
use crate::error::Result;

/// Render one message for the terminal.
#[must_use]
pub fn format_message(message: &BusMessage, received_at: DateTime<Utc>) -> String {
    let text = message.payload_text();
    let payload = serde_json::from_str::<serde_json::Value>(text.trim())
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| text.into_owned());
    format!(
        "[{}] Topic: {}\n  Payload: {}",
        received_at.format("%H:%M:%S"),
        message.channel,
        payload
    )
}

/// Print messages on `pattern` to `out` until `shutdown` resolves or the bus
/// stops delivering. Returns the number of messages shown.
pub async fn watch<B, S, W>(bus: &mut B, pattern: &str, shutdown: S, out: &mut W) -> Result<u64>
where
    B: BusClient + ?Sized,
    S: Future<Output = ()> + Send,
    W: Write + Send,
{
    let shown = print_until(bus, pattern, shutdown, out).await;
    if let Err(e) = bus.disconnect().await {
        warn!(error = %e, "Bus disconnect failed");
    }
    shown
}

async fn print_until<B, S, W>(bus: &mut B, pattern: &str, shutdown: S, out: &mut W) -> Result<u64>
where
    B: BusClient + ?Sized,
    S: Future<Output = ()> + Send,
    W: Write + Send,
{
    let mut rx = bus.subscribe(pattern).await?;
    info!(pattern, "Listening on {pattern} (Ctrl+C to stop)");

    tokio::pin!(shutdown);
    let mut shown = 0u64;
    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => break,
            message = rx.recv() => {
                let Some(message) = message else {
                    warn!("Bus delivery stopped");
                    break;
                };
                writeln!(out, "\n{}", format_message(&message, Utc::now()))?;
                out.flush()?;
                shown += 1;
            }
        }
    }
    Ok(shown)
}
