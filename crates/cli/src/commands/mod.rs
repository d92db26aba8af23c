// CLI subcommand dispatch.

use std::future::Future;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::client::ApiClient;
use crate::config::ConnectionArgs;
use crate::output::OutputFormat;

pub mod events;
pub mod lock;
pub mod presence;
pub mod watch;

#[derive(Subcommand)]
pub enum Command {
    /// Acquire, release, hand over or inspect an object lock
    Lock(lock::LockArgs),
    /// Announce, list or leave presence on an object
    Presence(presence::PresenceArgs),
    /// Read a stream's persisted events
    Events(events::EventsArgs),
    /// Follow live workspace events, catching up after reconnects
    Watch(watch::WatchArgs),
}

pub fn run(cmd: Command, connection: &ConnectionArgs, format: OutputFormat) -> Result<()> {
    let client = ApiClient::new(connection.resolve()?)?;
    match cmd {
        Command::Lock(args) => block_on(lock::run(&client, args, format)),
        Command::Presence(args) => block_on(presence::run(&client, args, format)),
        Command::Events(args) => block_on(events::run(&client, args, format)),
        Command::Watch(args) => block_on(watch::run(&client, args, format)),
    }
}

fn block_on<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(future)
}
