//! # chat
//!
//! Terminal client for the chat relay.
//!
//! ```bash
//! CHAT_HOST=127.0.0.1:6000 chat
//! ```
//!
//! Type `@name message` to message one user, anything else to message
//! everyone. Ctrl-C announces that you went offline and quits.

mod session;

use anyhow::{bail, Context, Result};
use clap::Parser;
use relay_protocol::{codec, read_message, ChatMessage, HeaderRetry};
use session::{Incoming, Session};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat relay client", long_about = None)]
struct Args {
    /// Node to connect to.
    #[arg(long, env = "CHAT_HOST", default_value = "127.0.0.1:6000")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let stream = TcpStream::connect(&args.host)
        .await
        .with_context(|| format!("Failed to connect to {}", args.host))?;
    debug!(host = %args.host, "Connected");
    let (mut reader, mut writer) = stream.into_split();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    prompt("\nName:> ")?;
    let name = match input.next_line().await? {
        Some(line) => line.trim().to_string(),
        None => return Ok(()),
    };
    if name.is_empty() {
        bail!("A username is required");
    }
    let session = Session::new(name);
    send(&mut writer, &session.online()).await?;
    debug!(user = %session.name(), "Announced");

    // Reads run in their own task; a header read must not be cut short by
    // keyboard input.
    let (frames_tx, mut frames) = mpsc::channel(64);
    tokio::spawn(async move {
        let retry = HeaderRetry::default();
        loop {
            match read_message(&mut reader, &retry).await {
                Ok(frame) => {
                    if frames_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Read ended");
                    return;
                }
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        prompt(&format!("\n{}", session.prompt()))?;

        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    println!("\n*** server closed the connection");
                    break;
                };
                match session.incoming(&frame) {
                    Ok(Incoming::Show(message)) => println!("\n{}", message),
                    Ok(Incoming::NameTaken(user)) => bail!(
                        "Username '{}' is currently connected. Please try a different username on next run.",
                        user
                    ),
                    Err(e) => warn!(error = %e, "Discarding malformed message"),
                }
            }
            line = input.next_line() => {
                let Some(line) = line? else { break };
                if let Some(message) = session.outgoing(&line) {
                    send(&mut writer, &message).await?;
                }
            }
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                send(&mut writer, &session.offline()).await?;
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Shutdown failed");
    }
    Ok(())
}

async fn send(writer: &mut OwnedWriteHalf, message: &ChatMessage) -> Result<()> {
    let data = codec::encode(message)?;
    writer
        .write_all(&data)
        .await
        .context("Failed to send message")?;
    Ok(())
}

fn prompt(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", text)?;
    stdout.flush()?;
    Ok(())
}
