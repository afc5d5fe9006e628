use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use lineup_kernel::adapters::file::FileSnapshotStore;
use lineup_kernel::config::LineupConfig;
use lineup_kernel::registry::QueueRegistry;
use lineup_kernel::service::{DisplayUser, IdentityLookup, LookupError, QueueService, UserLookup};
use lineup_kernel::versioned::Sequence;

/// Lineup queue CLI
#[derive(Parser, Debug)]
#[command(name = "lineup")]
#[command(about = "Versioned waiting queues", long_about = None)]
struct Cli {
    /// Path to config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root filename for persistent state (overrides the config)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Path to a JSON object mapping user ids to display names
    #[arg(long)]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// A subcommand, or one request line of `serve` such as
/// `{"op": "remove", "channel": "C1", "position": 0, "token": 3}`.
#[derive(Subcommand, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    /// Answer line-delimited JSON requests from stdin until it closes
    #[serde(skip)]
    Serve,
    /// Create a queue for a channel
    Create {
        channel: String,
        #[arg(long)]
        admin_channel: Option<String>,
    },
    /// Delete a channel's queue
    Delete { channel: String },
    /// List channels that have a queue
    Channels,
    /// Join a queue
    Enqueue {
        channel: String,
        user: String,
        #[arg(long, default_value = "")]
        #[serde(default)]
        metadata: String,
    },
    /// Serve the front of a queue, or the participant at --place
    Dequeue {
        channel: String,
        #[arg(long, default_value_t = 0)]
        #[serde(default)]
        place: usize,
        /// Sequence observed when --place was chosen
        #[arg(long, default_value_t = 0)]
        #[serde(default)]
        token: Sequence,
    },
    /// Show a queue
    List { channel: String },
    /// Show a participant's position
    Find { channel: String, user: String },
    /// Remove the participant at a position
    Remove {
        channel: String,
        position: usize,
        #[arg(long)]
        token: Sequence,
    },
    /// Move a participant to a new position
    Move {
        channel: String,
        from: usize,
        to: usize,
        #[arg(long)]
        token: Sequence,
    },
}

/// User directory loaded from a JSON file.
struct DirectoryLookup {
    names: HashMap<String, String>,
}

impl DirectoryLookup {
    fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read_to_string(path).with_context(|| format!("reading directory {path:?}"))?;
        let names =
            serde_json::from_str(&data).with_context(|| format!("parsing directory {path:?}"))?;
        Ok(Self { names })
    }
}

impl UserLookup for DirectoryLookup {
    fn lookup(&self, id: &str) -> Result<DisplayUser, LookupError> {
        self.names
            .get(id)
            .map(|name| DisplayUser {
                id: id.to_string(),
                name: name.clone(),
            })
            .ok_or_else(|| LookupError {
                id: id.to_string(),
                reason: "not in directory".into(),
            })
    }
}

#[derive(Debug, Serialize)]
struct FindOutput {
    position: usize,
    sequence: Sequence,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ----------------------------
    // Load configuration
    // ----------------------------
    let mut config = match &cli.config {
        Some(path) => LineupConfig::load(path)?,
        None => LineupConfig::default_config(),
    };
    if let Some(state) = cli.state {
        config.state_path = Some(state);
    }

    tracing_subscriber::fmt()
        .with_max_level(config.log_level()?)
        .with_writer(std::io::stderr)
        .init();

    // ----------------------------
    // Recover queues
    // ----------------------------
    let users: Arc<dyn UserLookup> = match &cli.directory {
        Some(path) => Arc::new(DirectoryLookup::load(path)?),
        None => Arc::new(IdentityLookup),
    };

    // Held until exit, so no other lineup process touches the state meanwhile.
    let _lock = match &config.state_path {
        Some(state) => Some(lock_state(state)?),
        None => {
            warn!("no state path configured, queues will not outlive this process");
            None
        }
    };
    let registry = QueueRegistry::new(config.state_path.map(FileSnapshotStore::new), users);
    registry.recover().context("recovering persisted state")?;

    // ----------------------------
    // Output
    // ----------------------------
    match cli.command {
        Command::Serve => {
            info!("serving requests from stdin");
            serve(&registry, io::stdin().lock(), io::stdout().lock())?;
        }
        command => {
            let output = run(&registry, command)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Take the exclusive lock `<state>.lock`, waiting for whoever holds it.
///
/// Snapshots are replaced by rename, so the lock lives in a separate file.
fn lock_state(state: &Path) -> Result<File> {
    let mut path = state.as_os_str().to_owned();
    path.push(".lock");
    let path = PathBuf::from(path);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening lock {path:?}"))?;
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            info!(?path, "state is in use by another lineup process, waiting");
            file.lock_exclusive().with_context(|| format!("locking {path:?}"))?;
        }
        Err(err) => return Err(err).with_context(|| format!("locking {path:?}")),
    }
    Ok(file)
}

/// Answer one JSON request per input line with one JSON reply per output
/// line. Sequences stay valid across requests, so stale tokens are caught.
fn serve(registry: &QueueRegistry, input: impl BufRead, mut output: impl Write) -> Result<()> {
    for line in input.lines() {
        let line = line.context("reading request")?;
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => match run(registry, command) {
                Ok(value) => json!({ "ok": value }),
                Err(err) => json!({ "error": format!("{err:#}") }),
            },
            Err(err) => json!({ "error": format!("invalid request: {err}") }),
        };
        serde_json::to_writer(&mut output, &reply)?;
        writeln!(output)?;
        output.flush()?;
    }
    Ok(())
}

fn run(registry: &QueueRegistry, command: Command) -> Result<serde_json::Value> {
    let queue = |channel: &str| -> Result<Arc<QueueService>> {
        registry.lookup(channel).ok_or_else(|| {
            anyhow!("no queue exists for channel {channel}, use `lineup create {channel}`")
        })
    };

    let value = match command {
        Command::Serve => bail!("already serving"),
        Command::Create {
            channel,
            admin_channel,
        } => {
            registry.create(&channel, admin_channel)?;
            serde_json::to_value(registry.state())?
        }
        Command::Delete { channel } => {
            registry.delete(&channel)?;
            serde_json::to_value(registry.state())?
        }
        Command::Channels => serde_json::to_value(registry.state())?,
        Command::Enqueue {
            channel,
            user,
            metadata,
        } => serde_json::to_value(queue(&channel)?.enqueue(&user, &metadata)?)?,
        Command::Dequeue {
            channel,
            place,
            token,
        } => {
            let queue = queue(&channel)?;
            let response = if place == 0 {
                queue.dequeue_front()?
            } else {
                queue.dequeue_at(place, token)?
            };
            serde_json::to_value(response)?
        }
        Command::List { channel } => serde_json::to_value(queue(&channel)?.list_users())?,
        Command::Find { channel, user } => {
            let stamped = queue(&channel)?.find(&user);
            serde_json::to_value(FindOutput {
                position: stamped.value?,
                sequence: stamped.sequence,
            })?
        }
        Command::Remove {
            channel,
            position,
            token,
        } => serde_json::to_value(queue(&channel)?.remove_at(position, token)?)?,
        Command::Move {
            channel,
            from,
            to,
            token,
        } => serde_json::to_value(queue(&channel)?.move_at(from, to, token)?)?,
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(None, Arc::new(IdentityLookup))
    }

    fn enqueue(channel: &str, user: &str) -> Command {
        Command::Enqueue {
            channel: channel.into(),
            user: user.into(),
            metadata: String::new(),
        }
    }

    #[test]
    fn commands_require_an_existing_queue() {
        let registry = registry();
        let err = run(&registry, enqueue("C1", "U1")).unwrap_err();
        assert!(err.to_string().contains("no queue exists"));
    }

    #[test]
    fn enqueue_list_and_move() {
        let registry = registry();
        run(
            &registry,
            Command::Create {
                channel: "C1".into(),
                admin_channel: None,
            },
        )
        .unwrap();
        run(&registry, enqueue("C1", "U1")).unwrap();
        run(&registry, enqueue("C1", "U2")).unwrap();

        let listed = run(&registry, Command::List { channel: "C1".into() }).unwrap();
        assert_eq!(listed["sequence"], 2);
        assert_eq!(listed["users"][1]["user"]["name"], "U2");

        let moved = run(
            &registry,
            Command::Move {
                channel: "C1".into(),
                from: 1,
                to: 0,
                token: 2,
            },
        )
        .unwrap();
        assert_eq!(moved["sequence"], 3);
        assert!(moved["conflict"].is_null());

        let found = run(
            &registry,
            Command::Find {
                channel: "C1".into(),
                user: "U2".into(),
            },
        )
        .unwrap();
        assert_eq!(found["position"], 0);
    }

    #[test]
    fn stale_token_is_reported_not_failed() {
        let registry = registry();
        registry.create("C1", None).unwrap();
        run(&registry, enqueue("C1", "U1")).unwrap();

        let removed = run(
            &registry,
            Command::Remove {
                channel: "C1".into(),
                position: 0,
                token: 0,
            },
        )
        .unwrap();
        assert_eq!(removed["conflict"]["current"], 1);
        assert_eq!(removed["conflict"]["attempted"], 0);
    }

    fn serve_lines(registry: &QueueRegistry, requests: &[&str]) -> Vec<serde_json::Value> {
        let input = io::Cursor::new(requests.join("\n"));
        let mut output = Vec::new();
        serve(registry, input, &mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn serve_rejects_a_token_from_before_another_removal() {
        let registry = registry();
        let replies = serve_lines(
            &registry,
            &[
                r#"{"op": "create", "channel": "C1"}"#,
                r#"{"op": "enqueue", "channel": "C1", "user": "U1"}"#,
                r#"{"op": "enqueue", "channel": "C1", "user": "U2"}"#,
                r#"{"op": "enqueue", "channel": "C1", "user": "U3"}"#,
                r#"{"op": "list", "channel": "C1"}"#,
                r#"{"op": "remove", "channel": "C1", "position": 0, "token": 3}"#,
                "",
                r#"{"op": "remove", "channel": "C1", "position": 0, "token": 3}"#,
                r#"{"op": "list", "channel": "C1"}"#,
            ],
        );

        assert_eq!(replies.len(), 8);
        assert_eq!(replies[4]["ok"]["sequence"], 3);
        assert!(replies[5]["ok"]["conflict"].is_null());
        assert_eq!(replies[6]["ok"]["conflict"]["current"], 4);
        assert_eq!(replies[6]["ok"]["conflict"]["attempted"], 3);

        let names: Vec<_> = replies[7]["ok"]["users"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["user"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["U2", "U3"]);
    }

    #[test]
    fn serve_reports_bad_requests_and_keeps_going() {
        let registry = registry();
        let replies = serve_lines(
            &registry,
            &[
                "not json",
                r#"{"op": "serve"}"#,
                r#"{"op": "list", "channel": "C9"}"#,
                r#"{"op": "channels"}"#,
            ],
        );

        assert!(replies[0]["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request"));
        assert!(replies[1]["error"].is_string());
        assert!(replies[2]["error"]
            .as_str()
            .unwrap()
            .contains("no queue exists"));
        assert_eq!(replies[3]["ok"]["queues"], json!([]));
    }

    #[test]
    fn state_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");

        let held = lock_state(&state).unwrap();
        let other = File::open(dir.path().join("state.lock")).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        assert!(other.try_lock_exclusive().is_ok());
    }
}
