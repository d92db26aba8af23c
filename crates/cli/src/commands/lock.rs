// `tandem lock`: exclusive object locks and unlock hand-over.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tandem_common::types::{Lock, ObjectRef};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct LockArgs {
    #[command(subcommand)]
    action: LockAction,
}

#[derive(Debug, Subcommand)]
enum LockAction {
    /// Take the lock, or refresh it if you already hold it
    Acquire(ObjectArgs),
    /// Give up a lock you hold
    Release(ObjectArgs),
    /// Ask the current holder to hand the lock over
    Request(ObjectArgs),
    /// Hand your lock to the user who requested it
    Accept(ObjectArgs),
    /// Remove the lock regardless of holder (workspace admins)
    Force(ObjectArgs),
    /// Show the active lock, if any
    Show(ObjectArgs),
}

/// Identifies one object in the workspace.
#[derive(Debug, Clone, Args)]
pub struct ObjectArgs {
    /// Object type (e.g. `organization`, `folder`, `usecase`).
    #[arg(long = "type")]
    pub object_type: String,

    /// Object id.
    #[arg(long = "id")]
    pub object_id: String,
}

impl ObjectArgs {
    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(self.object_type.clone(), self.object_id.clone())
    }

    pub fn query(&self) -> [(&'static str, String); 2] {
        [("objectType", self.object_type.clone()), ("objectId", self.object_id.clone())]
    }
}

#[derive(Debug, Deserialize)]
struct LockResponse {
    lock: Option<Lock>,
}

#[derive(Debug, Deserialize)]
struct ReleasedResponse {
    released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockCommand {
    Acquire,
    Release,
    Request,
    Accept,
    Force,
    Show,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResult {
    pub command: LockCommand,
    pub object: ObjectRef,
    pub lock: Option<Lock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<bool>,
}

pub async fn run(client: &ApiClient, args: LockArgs, format: OutputFormat) -> Result<()> {
    let result = call_lock(client, args.action).await?;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_lock(client: &ApiClient, action: LockAction) -> Result<LockResult> {
    let (command, target) = match &action {
        LockAction::Acquire(target) => (LockCommand::Acquire, target),
        LockAction::Release(target) => (LockCommand::Release, target),
        LockAction::Request(target) => (LockCommand::Request, target),
        LockAction::Accept(target) => (LockCommand::Accept, target),
        LockAction::Force(target) => (LockCommand::Force, target),
        LockAction::Show(target) => (LockCommand::Show, target),
    };
    let object = target.object();

    let (lock, released) = match command {
        LockCommand::Acquire => {
            let response: LockResponse =
                client.post("/locks", &object).await.context("lock acquire failed")?;
            (response.lock, None)
        }
        LockCommand::Request => {
            let response: LockResponse = client
                .post("/locks/request-unlock", &object)
                .await
                .context("unlock request failed")?;
            (response.lock, None)
        }
        LockCommand::Accept => {
            let response: LockResponse = client
                .post("/locks/accept-unlock", &object)
                .await
                .context("unlock accept failed")?;
            (response.lock, None)
        }
        LockCommand::Show => {
            let response: LockResponse =
                client.get("/locks", &target.query()).await.context("lock lookup failed")?;
            (response.lock, None)
        }
        LockCommand::Release => {
            let response: ReleasedResponse =
                client.delete("/locks", &target.query()).await.context("lock release failed")?;
            (None, Some(response.released))
        }
        LockCommand::Force => {
            let response: ReleasedResponse = client
                .post("/locks/force-unlock", &object)
                .await
                .context("force unlock failed")?;
            (None, Some(response.released))
        }
    };

    Ok(LockResult { command, object, lock, released })
}

fn label(object: &ObjectRef) -> String {
    format!("{}/{}", object.object_type, object.object_id)
}

fn describe_lock(lock: &Lock, now: DateTime<Utc>) -> String {
    let remaining = (lock.expires_at - now).num_seconds().max(0);
    let mut msg = format!(
        "held by {} since {}, expires in {remaining}s",
        lock.locked_by_user_id,
        lock.locked_at.format("%H:%M:%S")
    );
    if let Some(requester) = lock.pending_unlock_requested_by_user_id {
        msg.push_str(&format!("\n  Unlock requested by {requester}"));
    }
    msg
}

fn format_human(result: &LockResult) -> String {
    format_human_at(result, Utc::now())
}

fn format_human_at(result: &LockResult, now: DateTime<Utc>) -> String {
    let object = label(&result.object);
    match (result.command, &result.lock, result.released) {
        (LockCommand::Acquire, Some(lock), _) => {
            format!("locked {object}: {}", describe_lock(lock, now))
        }
        (LockCommand::Request, Some(lock), _) => format!(
            "unlock requested for {object}; waiting for {} to accept",
            lock.locked_by_user_id
        ),
        (LockCommand::Accept, Some(lock), _) => {
            format!("handed {object} to {}", lock.locked_by_user_id)
        }
        (LockCommand::Show, Some(lock), _) => format!("{object} {}", describe_lock(lock, now)),
        (LockCommand::Release, _, Some(true)) => format!("released {object}"),
        (LockCommand::Release, _, _) => format!("{object} was not locked by you; nothing released"),
        (LockCommand::Force, _, Some(true)) => format!("force-unlocked {object}"),
        (LockCommand::Force, _, _) => format!("{object} was not locked"),
        (_, None, _) => format!("{object} is not locked"),
    }
}
