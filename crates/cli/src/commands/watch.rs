// `tandem watch`: live workspace events with catch-up after every (re)connect.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tandem_common::replay::ReplayCache;
use tracing::{debug, info, warn};

use super::events::{describe_event, fetch_page, MAX_PAGE};
use crate::client::{ApiClient, ApiError};
use crate::output::{self, OutputFormat};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Only print events of this stream (its stored history is shown first).
    #[arg(long)]
    stream: Option<String>,

    /// Upper bound for the reconnect delay, in seconds.
    #[arg(long, default_value_t = 30)]
    max_backoff_secs: u64,
}

pub async fn run(client: &ApiClient, args: WatchArgs, format: OutputFormat) -> Result<()> {
    let cache = ReplayCache::default();
    let print = move |event: &tandem_common::protocol::events::StreamEvent| {
        if let Err(error) = output::print_output(format, event, describe_event) {
            warn!(error = %error, "failed to write event");
        }
    };
    match &args.stream {
        Some(stream_id) => cache.subscribe_to_stream("watch", stream_id.clone(), print),
        None => cache.subscribe("watch", print),
    };

    let max_backoff = Duration::from_secs(args.max_backoff_secs.max(1));
    tokio::select! {
        result = follow(client, &cache, args.stream.as_deref(), max_backoff) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("watch interrupted");
            Ok(())
        }
    }
}

/// Reconnects forever; only authentication and permission failures end the watch.
async fn follow(
    client: &ApiClient,
    cache: &ReplayCache,
    stream: Option<&str>,
    max_backoff: Duration,
) -> Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match session(client, cache, stream).await {
            Ok(()) => {
                info!("event stream closed by server; reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(error) if is_fatal(&error) => return Err(error),
            Err(error) => {
                warn!(error = %format!("{error:#}"), retry_in = ?backoff, "event stream failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, max_backoff);
    }
}

async fn session(client: &ApiClient, cache: &ReplayCache, stream: Option<&str>) -> Result<()> {
    // Subscribe before catching up so nothing written in between is missed; the cache drops
    // whichever copy of an event arrives second.
    let response = client.open_event_stream().await?;
    info!("connected to event stream");
    catch_up(client, cache, stream).await?;

    let mut frames = response.bytes_stream().eventsource();
    while let Some(frame) = frames.next().await {
        let frame = frame.context("event stream interrupted")?;
        if !cache.ingest_frame(&frame.event, &frame.data) {
            debug!(event = %frame.event, id = %frame.id, "frame not applied");
        }
    }
    Ok(())
}

/// Reads every cached stream, snapshot-only streams and the watched one included, from its
/// last known sequence.
async fn catch_up(client: &ApiClient, cache: &ReplayCache, stream: Option<&str>) -> Result<()> {
    let mut stream_ids = cache.known_stream_ids();
    if let Some(stream_id) = stream {
        if !stream_ids.iter().any(|known| known == stream_id) {
            stream_ids.push(stream_id.to_string());
        }
    }

    for stream_id in stream_ids {
        let mut since = cache.last_sequence(&stream_id).unwrap_or(0);
        loop {
            let page = fetch_page(client, &stream_id, Some(since), Some(MAX_PAGE)).await?;
            let fetched = page.events.len();
            for event in page.events {
                since = since.max(event.sequence);
                cache.ingest(event);
            }
            if fetched < MAX_PAGE {
                break;
            }
        }
    }
    Ok(())
}

fn is_fatal(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<ApiError>())
        .any(|api_error| matches!(api_error.status, 400 | 401 | 403 | 404))
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
