//! CLI: argument parsing and subcommand dispatch for the Control API.
//! `cli.rs` parses and dispatches; handlers print and return an exit
//! code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use channel_isolator::config::NodeNetwork;
use channel_isolator::control::ControlApi;
use channel_isolator::model::ChannelId;

#[derive(Parser)]
#[command(name = "channel-isolator")]
#[command(version)]
#[command(about = "Per-channel isolation policy enforcer for a Lightning Network node", long_about = None)]
pub struct Cli {
    /// Path to the node's data directory.
    #[arg(long, global = true)]
    pub node_dir: Option<PathBuf>,

    /// Which chain the node is running on.
    #[arg(long, global = true)]
    pub network: Option<NodeNetwork>,

    /// Path to the isolation policy database.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Print query results as JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Begin isolating a channel: refuse all forwards into it except explicit exceptions.
    Isolate {
        channel_id: u64,
        #[arg(long)]
        alias: Option<String>,
    },
    /// End isolation for a channel.
    Stop { channel_id: u64 },
    /// Allow forwards from `allowed_chan` into an isolated channel.
    AddException {
        isolated_chan: u64,
        allowed_chan: u64,
        #[arg(long)]
        alias: Option<String>,
    },
    /// Revoke a previously added exception.
    RemoveException { isolated_chan: u64, allowed_chan: u64 },
    /// List currently active isolation sessions.
    List,
    /// List exceptions for the active session on a channel.
    Exceptions { channel_id: u64 },
    /// List all sessions, optionally filtered to one channel.
    History {
        #[arg(long)]
        channel: Option<u64>,
    },
    /// List attempts for a session, most recent first.
    Attempts {
        session_id: i64,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print aggregate counters.
    Stats,
}

/// Runs one subcommand against the Control API and returns the process
/// exit code.
pub async fn dispatch(command: Commands, control: &ControlApi, json: bool) -> i32 {
    let result = run(command, control, json).await;
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

async fn run(command: Commands, control: &ControlApi, json: bool) -> channel_isolator::error::Result<()> {
    match command {
        Commands::Isolate { channel_id, alias } => {
            let session_id = control.isolate(ChannelId(channel_id), alias).await?;
            println!("isolated channel {channel_id} (session {session_id})");
        }
        Commands::Stop { channel_id } => {
            let session_id = control.stop(ChannelId(channel_id)).await?;
            println!("ended session {session_id} for channel {channel_id}");
        }
        Commands::AddException { isolated_chan, allowed_chan, alias } => {
            control
                .add_exception(ChannelId(isolated_chan), ChannelId(allowed_chan), alias)
                .await?;
            println!("allowed channel {allowed_chan} to forward into {isolated_chan}");
        }
        Commands::RemoveException { isolated_chan, allowed_chan } => {
            control
                .remove_exception(ChannelId(isolated_chan), ChannelId(allowed_chan))
                .await?;
            println!("removed exception: {allowed_chan} -> {isolated_chan}");
        }
        Commands::List => {
            let sessions = control.list().await?;
            print_sessions(&sessions, json);
        }
        Commands::Exceptions { channel_id } => {
            let exceptions = control.exceptions(ChannelId(channel_id)).await?;
            if json {
                print_json(&exceptions);
            } else if exceptions.is_empty() {
                println!("(no exceptions)");
            } else {
                for e in exceptions {
                    println!(
                        "{}  allowed={}  alias={}  created_at={}",
                        e.session_id,
                        e.allowed_channel_id,
                        e.alias.as_deref().unwrap_or(""),
                        e.created_at
                    );
                }
            }
        }
        Commands::History { channel } => {
            let sessions = control.history(channel.map(ChannelId)).await?;
            print_sessions(&sessions, json);
        }
        Commands::Attempts { session_id, limit } => {
            let attempts = control.attempts(session_id, limit).await?;
            if json {
                print_json(&attempts);
            } else if attempts.is_empty() {
                println!("(no attempts)");
            } else {
                for a in attempts {
                    println!(
                        "{}  {}  in={} out={}  amt_msat={}  {} ({})",
                        a.attempt_id,
                        a.observed_at,
                        a.incoming_channel_id,
                        a.outgoing_channel_id,
                        a.amount_msat,
                        a.decision.as_str(),
                        a.reason.as_str()
                    );
                }
            }
        }
        Commands::Stats => {
            let s = control.stats().await?;
            if json {
                print_json(&s);
            } else {
                println!("total_sessions={}", s.total_sessions);
                println!("active_sessions={}", s.active_sessions);
                println!("total_attempts={}", s.total_attempts);
                println!("resumed={}", s.resumed);
                println!("failed={}", s.failed);
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("error serializing output: {e}"),
    }
}

fn print_sessions(sessions: &[channel_isolator::model::Session], json: bool) {
    if json {
        print_json(sessions);
        return;
    }
    if sessions.is_empty() {
        println!("(no sessions)");
        return;
    }
    for s in sessions {
        println!(
            "{}  channel={}  alias={}  status={}  started_at={}  ended_at={}",
            s.session_id,
            s.channel_id,
            s.alias.as_deref().unwrap_or(""),
            s.status.as_str(),
            s.started_at,
            s.ended_at.map(|t| t.to_string()).unwrap_or_default()
        );
    }
}
