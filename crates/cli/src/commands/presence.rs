// `tandem presence`: who is viewing an object.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tandem_common::types::{ObjectRef, PresenceEntry};

use super::lock::ObjectArgs;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct PresenceArgs {
    #[command(subcommand)]
    action: PresenceAction,
}

#[derive(Debug, Subcommand)]
enum PresenceAction {
    /// Record a heartbeat for yourself on the object
    Ping(ObjectArgs),
    /// List users seen on the object recently
    List(ObjectArgs),
    /// Remove your presence from the object
    Leave(ObjectArgs),
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    users: Vec<PresenceEntry>,
}

#[derive(Debug, Deserialize)]
struct LeftResponse {
    left: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResult {
    pub object: ObjectRef,
    pub users: Vec<PresenceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
}

pub async fn run(client: &ApiClient, args: PresenceArgs, format: OutputFormat) -> Result<()> {
    let result = match args.action {
        PresenceAction::Ping(target) => {
            let response: UsersResponse = client
                .post("/locks/presence", &target.object())
                .await
                .context("presence ping failed")?;
            PresenceResult { object: target.object(), users: response.users, left: None }
        }
        PresenceAction::List(target) => {
            let response: UsersResponse = client
                .get("/locks/presence", &target.query())
                .await
                .context("presence lookup failed")?;
            PresenceResult { object: target.object(), users: response.users, left: None }
        }
        PresenceAction::Leave(target) => {
            let response: LeftResponse = client
                .post("/locks/presence/leave", &target.object())
                .await
                .context("presence leave failed")?;
            PresenceResult { object: target.object(), users: Vec::new(), left: Some(response.left) }
        }
    };

    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn format_human(result: &PresenceResult) -> String {
    format_human_at(result, Utc::now())
}

fn format_human_at(result: &PresenceResult, now: DateTime<Utc>) -> String {
    let object = format!("{}/{}", result.object.object_type, result.object.object_id);
    if let Some(left) = result.left {
        return if left {
            format!("left {object}")
        } else {
            format!("not present on {object}")
        };
    }
    if result.users.is_empty() {
        return format!("nobody is viewing {object}");
    }

    let mut msg = format!("{} viewing {object}:", result.users.len());
    for entry in &result.users {
        let ago = (now - entry.last_seen_at).num_seconds().max(0);
        msg.push_str(&format!("\n  {} (seen {ago}s ago)", entry.user_id));
    }
    msg
}
