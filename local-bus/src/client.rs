use std::borrow::Cow;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::broadcast,
};
use tracing::warn;

use crate::{
    cli::{Cli, Command},
    error::BusError,
    event::BusEvent,
    runtime::{Bus, BusChannels, BusHandle},
};

const QUERY_COMMAND: &str = "/query ";

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.bus_config().context("invalid bus configuration")?;
    let BusChannels { handle, mut events } = Bus::board(config)
        .await
        .with_context(|| format!("failed to board bus '{}'", cli.bus))?;

    let session = Session {
        handle,
        mode: cli.command.clone(),
        json: cli.json,
        timeout: cli.query_timeout(),
    };

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let result = run_client_loop(&session, &mut events, &mut stdin, &mut input).await;
    session.handle.shutdown().await?;
    result
}

struct Session {
    handle: BusHandle,
    mode: Command,
    json: bool,
    timeout: Duration,
}

async fn run_client_loop(
    session: &Session,
    events: &mut broadcast::Receiver<BusEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        select! {
            event = events.recv() => {
                if !handle_bus_event(event, session).await? {
                    break;
                }
            }
            // Partial input survives a cancelled `read_line`; clear after a full line.
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, session).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_bus_event(
    event: Result<BusEvent, broadcast::error::RecvError>,
    session: &Session,
) -> Result<bool> {
    let event = match event {
        Ok(event) => event,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            write_stderr(&format!("!!! missed {skipped} bus events")).await?;
            return Ok(true);
        }
        Err(broadcast::error::RecvError::Closed) => {
            session.print(&Record::Closed).await?;
            return Ok(false);
        }
    };

    if let (
        Command::Respond(args),
        BusEvent::QueryReceived {
            id,
            payload,
            dispatched: false,
        },
    ) = (&session.mode, &event)
    {
        let mut answer = args.prefix.as_bytes().to_vec();
        answer.extend_from_slice(payload);
        session.handle.send_query_response(*id, answer).await?;
    }

    session.print(&Record::from_event(&event)).await?;
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &Session,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        session.print(&Record::Leaving).await?;
        return Ok(false);
    }

    let query = match (&session.mode, text.strip_prefix(QUERY_COMMAND)) {
        (Command::Inspect, _) => Some(text),
        (_, Some(query)) => Some(query),
        _ => None,
    };

    match query {
        Some(query) => ask(session, query).await?,
        None => session.handle.send_message(text.to_string()).await?,
    }
    Ok(true)
}

async fn ask(session: &Session, query: &str) -> Result<()> {
    match session
        .handle
        .send_query(query.to_string(), session.timeout)
        .await
    {
        Ok(answer) => session.print(&Record::Answer { payload: lossy(&answer) }).await?,
        Err(BusError::QueryTimeout { id, .. }) => {
            session
                .print(&Record::Timeout { id: id.to_string() })
                .await?
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// One line of output, in text or JSON form.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
    Role { role: String },
    Message { payload: Cow<'a, str> },
    Query {
        id: String,
        payload: Cow<'a, str>,
        dispatched: bool,
    },
    Answer { payload: Cow<'a, str> },
    Timeout { id: String },
    Leaving,
    Closed,
}

impl<'a> Record<'a> {
    fn from_event(event: &'a BusEvent) -> Self {
        match event {
            BusEvent::MessageReceived { payload } => Record::Message {
                payload: lossy(payload),
            },
            BusEvent::QueryReceived {
                id,
                payload,
                dispatched,
            } => Record::Query {
                id: id.to_string(),
                payload: lossy(payload),
                dispatched: *dispatched,
            },
            BusEvent::RoleChanged { role } => Record::Role {
                role: role.to_string(),
            },
        }
    }

    /// Plain-text rendering. Responses to our own queries are already shown
    /// as the answer line, so they render as nothing.
    fn text(&self) -> Option<String> {
        match self {
            Record::Role { role } => Some(format!("*** role {role}")),
            Record::Message { payload } => Some(payload.to_string()),
            Record::Query {
                dispatched: true, ..
            } => None,
            Record::Query { id, payload, .. } => Some(format!("? {id} {payload}")),
            Record::Answer { payload } => Some(format!("= {payload}")),
            Record::Timeout { .. } => Some("*** query timed out".to_string()),
            Record::Leaving => Some("*** leaving bus".to_string()),
            Record::Closed => Some("*** bus closed".to_string()),
        }
    }
}

impl Session {
    async fn print(&self, record: &Record<'_>) -> Result<()> {
        let line = if self.json {
            Some(serde_json::to_string(record).context("failed to encode event")?)
        } else {
            record.text()
        };
        if let Some(line) = line {
            write_stdout(&line).await?;
        }
        Ok(())
    }
}

fn lossy(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
