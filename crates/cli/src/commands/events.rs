// `tandem events`: catch-up read of one stream.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use tandem_common::protocol::events::{EventPayload, StreamEvent};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

/// Largest page the server returns for one catch-up read.
pub const MAX_PAGE: usize = 1000;

#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Stream id (message id, `job_<id>`, `lock_<workspace>_<type>_<id>`, ...).
    pub stream_id: String,

    /// Only events with a sequence greater than this.
    #[arg(long)]
    since: Option<i64>,

    /// Maximum number of events (server caps at 1000).
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub stream_id: String,
    pub events: Vec<StreamEvent>,
}

pub async fn run(client: &ApiClient, args: EventsArgs, format: OutputFormat) -> Result<()> {
    if args.stream_id.trim().is_empty() {
        bail!("stream id must not be empty");
    }
    let page = fetch_page(client, &args.stream_id, args.since, args.limit).await?;
    output::print_output(format, &page, format_human)?;
    Ok(())
}

/// `GET /streams/events/{stream_id}?since=&limit=`.
pub async fn fetch_page(
    client: &ApiClient,
    stream_id: &str,
    since: Option<i64>,
    limit: Option<usize>,
) -> Result<EventsPage> {
    let mut query = Vec::new();
    if let Some(since) = since {
        query.push(("since", since.to_string()));
    }
    if let Some(limit) = limit {
        query.push(("limit", limit.to_string()));
    }
    let path = format!("/streams/events/{}", encode_segment(stream_id));
    client
        .get(&path, &query)
        .await
        .with_context(|| format!("failed to read events of stream `{stream_id}`"))
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect::<String>().replace('+', "%20")
}

fn format_human(page: &EventsPage) -> String {
    if page.events.is_empty() {
        return format!("no events on stream {}", page.stream_id);
    }
    page.events.iter().map(describe_event).collect::<Vec<_>>().join("\n")
}

/// One-line rendering of an event for terminals.
pub fn describe_event(event: &StreamEvent) -> String {
    let summary = match &event.event {
        EventPayload::JobUpdate(update) => {
            let mut line = format!("job {} {}", update.job_id, update.status);
            if let Some(progress) = update.progress {
                line.push_str(&format!(" ({:.0}%)", progress * 100.0));
            }
            line
        }
        EventPayload::OrganizationUpdate(update)
        | EventPayload::FolderUpdate(update)
        | EventPayload::UsecaseUpdate(update) => {
            format!("{} {}", update.id, wire_label(&update.action))
        }
        EventPayload::LockUpdate(update) => {
            let holder = update
                .lock
                .as_ref()
                .map(|lock| format!(" by {}", lock.locked_by_user_id))
                .unwrap_or_default();
            format!(
                "{}/{} {}{holder}",
                update.object_type,
                update.object_id,
                wire_label(&update.action)
            )
        }
        EventPayload::PresenceUpdate(update) => format!(
            "{}/{} {} viewing",
            update.object_type,
            update.object_id,
            update.users.len()
        ),
        EventPayload::Status(status) => match &status.message {
            Some(message) => format!("{}: {message}", status.state),
            None => status.state.clone(),
        },
        EventPayload::ReasoningDelta(delta) | EventPayload::ContentDelta(delta) => {
            format!("{:?}", delta.delta)
        }
        EventPayload::ToolCallStart(start) => {
            format!("{} {}({})", start.tool_call_id, start.name, start.args)
        }
        EventPayload::ToolCallDelta(delta) => format!("{} {:?}", delta.tool_call_id, delta.delta),
        EventPayload::ToolCallResult(result) => {
            format!("{} -> {}", result.tool_call_id, result.result)
        }
        EventPayload::Error(failure) => match &failure.code {
            Some(code) => format!("{code}: {}", failure.message),
            None => failure.message.clone(),
        },
        EventPayload::Done(done) => done.reason.clone().unwrap_or_else(|| "done".to_string()),
        EventPayload::Ping(_) => String::new(),
    };
    format!("[{} #{}] {}: {summary}", event.stream_id, event.sequence, event.event_type())
}

fn wire_label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| value.as_str().map(str::to_owned))
        .unwrap_or_default()
}
