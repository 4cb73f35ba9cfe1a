//! Terminal client: joins a server and multiplexes stdin with the wire.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::select;
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{RecvOutcome, Session, SessionReader, POLL_TIMEOUT};

/// How long to wait for the server's verdict on our `join`.
const JOIN_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (session, mut reader) = Session::from_stream(stream);
    join(&session, &mut reader, &args.username).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&session, &mut reader, &mut stdin, &mut input).await?;
    session.shutdown().await;

    Ok(())
}

/// Send `join` and wait for the server's `welcome` or rejection.
async fn join(session: &Arc<Session>, reader: &mut SessionReader, username: &str) -> Result<()> {
    session
        .send(&ClientMessage::Join {
            username: username.to_string(),
        })
        .await?;

    match reader.recv::<ServerMessage>(JOIN_REPLY_TIMEOUT).await? {
        RecvOutcome::Frame(ServerMessage::Welcome { message, users, .. }) => {
            write_stdout(&format!("*** {message}")).await?;
            let others: Vec<String> = users
                .into_iter()
                .filter(|user| user != username)
                .collect();
            if !others.is_empty() {
                write_stdout(&format!("*** currently online: {}", others.join(", "))).await?;
            }
            Ok(())
        }
        RecvOutcome::Frame(ServerMessage::Error { message }) => {
            bail!("server rejected join: {message}")
        }
        RecvOutcome::Frame(other) => bail!("unexpected handshake response: {other:?}"),
        RecvOutcome::Timeout => bail!("no response from server"),
        RecvOutcome::Closed => bail!("server closed the connection during join"),
    }
}

async fn run_client_loop(
    session: &Arc<Session>,
    reader: &mut SessionReader,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            outcome = reader.recv::<ServerMessage>(POLL_TIMEOUT) => {
                match outcome? {
                    RecvOutcome::Frame(message) => render_server_message(message).await?,
                    RecvOutcome::Timeout => continue,
                    RecvOutcome::Closed => {
                        write_stdout("*** server closed the connection").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, session).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &Arc<Session>,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if text.eq_ignore_ascii_case("/ping") {
        session.send(&ClientMessage::Ping).await?;
        return Ok(true);
    }

    session
        .send(&ClientMessage::Chat {
            message: text.to_string(),
        })
        .await?;
    Ok(true)
}

async fn render_server_message(message: ServerMessage) -> io::Result<()> {
    match message {
        ServerMessage::Chat {
            username,
            message,
            timestamp,
        } => {
            write_stdout(&format!(
                "[{}] {username}: {message}",
                format_clock(timestamp)
            ))
            .await
        }
        ServerMessage::UserJoined { message, .. } | ServerMessage::UserLeft { message, .. } => {
            write_stdout(&format!("*** {message}")).await
        }
        ServerMessage::Pong => {
            // Liveness reply to /ping; nothing to show.
            debug!("pong");
            Ok(())
        }
        ServerMessage::Error { message } => write_stderr(&format!("!!! {message}")).await,
        ServerMessage::Welcome { message, .. } => {
            // Only expected during the handshake; harmless if repeated.
            write_stdout(&format!("*** {message}")).await
        }
    }
}

/// Render epoch seconds as a UTC wall-clock time.
fn format_clock(timestamp: f64) -> String {
    let seconds_of_day = (timestamp.max(0.0) as u64) % 86_400;
    format!(
        "{:02}:{:02}:{:02}",
        seconds_of_day / 3600,
        (seconds_of_day / 60) % 60,
        seconds_of_day % 60
    )
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_formats_as_utc_wall_time() {
        assert_eq!(format_clock(0.0), "00:00:00");
        assert_eq!(format_clock(45_296.5), "12:34:56");
        // A full day wraps around.
        assert_eq!(format_clock(86_400.0 + 61.0), "00:01:01");
    }
}
