use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tidepool_proto::SignalingMessage;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "tidepool-relay", version)]
#[command(about = "Tidepool signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Interface to bind (overrides TIDEPOOL_RELAY_HOST)
    #[arg(long, env = "TIDEPOOL_RELAY_HOST")]
    pub host: Option<IpAddr>,

    /// Port to listen on (overrides TIDEPOOL_RELAY_PORT)
    #[arg(long, env = "TIDEPOOL_RELAY_PORT")]
    pub port: Option<u16>,
}

impl Cli {
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay as an endpoint and print every frame it receives
    Probe {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3000")]
        url: String,

        /// Endpoint identifier to sign in with
        #[arg(long)]
        id: String,

        /// Ask to watch this stream after signing in
        #[arg(long)]
        watch: Option<String>,

        /// Announce a stream under the probe's own identifier
        #[arg(long)]
        start_streaming: bool,

        /// How long to listen before disconnecting
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

pub async fn run_probe(
    url: String,
    id: String,
    watch: Option<String>,
    start_streaming: bool,
    seconds: u64,
) -> Result<()> {
    debug!("connecting probe `{}` to {}", id, url);
    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(url.as_str()))
        .await
        .with_context(|| format!("timed out connecting to {url}"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut sink, mut stream) = ws_stream.split();

    let mut outgoing = vec![SignalingMessage::sign_in(&id)];
    if let Some(stream_id) = watch.as_deref() {
        outgoing.push(SignalingMessage::watch_stream(stream_id, &id));
    }
    if start_streaming {
        outgoing.push(SignalingMessage::start_streaming(&id));
    }
    for message in outgoing {
        let text = message.encode().context("failed to encode probe frame")?;
        sink.send(Message::Text(text))
            .await
            .context("failed to send probe frame")?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match SignalingMessage::decode(&text) {
                    Ok(message) => println!("{}", serde_json::to_string_pretty(&message)?),
                    Err(err) => warn!(error = %err, "relay sent an undecodable frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    println!("relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("probe connection failed"),
            },
        }
    }

    let _ = sink.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_override_environment_config() {
        let cli = Cli::parse_from(["tidepool-relay", "--host", "127.0.0.1", "--port", "4100"]);
        let mut config = RelayConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:4100");
        assert!(cli.command.is_none());
    }

    #[test_timeout::timeout]
    fn probe_subcommand_parses() {
        let cli = Cli::parse_from([
            "tidepool-relay",
            "probe",
            "--id",
            "viewer-1",
            "--watch",
            "streamer",
        ]);
        match cli.command {
            Some(Commands::Probe {
                url,
                id,
                watch,
                start_streaming,
                seconds,
            }) => {
                assert_eq!(url, "ws://127.0.0.1:3000");
                assert_eq!(id, "viewer-1");
                assert_eq!(watch.as_deref(), Some("streamer"));
                assert!(!start_streaming);
                assert_eq!(seconds, 30);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
