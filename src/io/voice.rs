//! Voice command listener
//!
//! A speech-to-text engine pushes transcripts over TCP, one per line.
//! Keyword matching turns a transcript into a Voice intent:
//! - open: contains both "open" and "garage"
//! - close: contains "close" or "shut", together with "garage"
//!
//! A line longer than `MAX_TRANSCRIPT_BYTES` drops the connection.

use crate::domain::types::{Action, Intent};
use crate::infra::metrics::Metrics;
use crate::services::controller::DoorController;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest transcript line accepted, newline excluded
pub const MAX_TRANSCRIPT_BYTES: u64 = 1024;

/// Map a transcript to an action, if it names one
pub fn parse_voice_command(transcript: &str) -> Option<Action> {
    let lowered = transcript.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |word: &str| words.iter().any(|w| *w == word);

    if !has("garage") {
        return None;
    }
    if has("open") {
        Some(Action::Open)
    } else if has("close") || has("shut") {
        Some(Action::Close)
    } else {
        None
    }
}

/// Accept transcript connections until shutdown
pub async fn start_voice_listener(
    addr: SocketAddr,
    controller: Arc<DoorController>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "voice_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("voice_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let controller = controller.clone();
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            handle_transcripts(socket, addr, controller, metrics).await;
                        });
                    }
                    Err(e) => {
                        metrics.record_adapter_error();
                        error!(error = %e, "voice_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_transcripts(
    socket: TcpStream,
    addr: SocketAddr,
    controller: Arc<DoorController>,
    metrics: Arc<Metrics>,
) {
    debug!(peer = %addr, "voice_connection_accepted");
    let mut reader = BufReader::new(socket);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_TRANSCRIPT_BYTES + 1)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') && buf.len() as u64 > MAX_TRANSCRIPT_BYTES {
                    metrics.record_adapter_error();
                    warn!(peer = %addr, max_bytes = MAX_TRANSCRIPT_BYTES, "voice_transcript_too_long");
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                let transcript = line.trim();
                if transcript.is_empty() {
                    continue;
                }
                match parse_voice_command(transcript) {
                    Some(action) => {
                        info!(transcript = %transcript, action = %action, "voice_command_recognized");
                        controller.submit(Intent::voice(action));
                    }
                    None => debug!(transcript = %transcript, "voice_no_command"),
                }
            }
            Err(e) => {
                metrics.record_adapter_error();
                debug!(peer = %addr, error = %e, "voice_connection_error");
                break;
            }
        }
    }

    debug!(peer = %addr, "voice_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DoorState;
    use crate::services::auth::{AuthGate, StaticPolicy};
    use crate::services::controller::ControllerSettings;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_open_keywords() {
        assert_eq!(parse_voice_command("Open the garage"), Some(Action::Open));
        assert_eq!(parse_voice_command("garage, open up!"), Some(Action::Open));
        assert_eq!(parse_voice_command("open the door"), None);
    }

    #[test]
    fn test_close_keywords() {
        assert_eq!(parse_voice_command("close the garage door"), Some(Action::Close));
        assert_eq!(parse_voice_command("SHUT GARAGE"), Some(Action::Close));
        assert_eq!(parse_voice_command("close the window"), None);
    }

    #[test]
    fn test_substrings_do_not_match() {
        assert_eq!(parse_voice_command("reopened garages"), None);
        assert_eq!(parse_voice_command(""), None);
    }

    fn controller(metrics: &Arc<Metrics>) -> Arc<DoorController> {
        let policy = StaticPolicy::new(None, Vec::<String>::new());
        DoorController::new(
            ControllerSettings::default(),
            AuthGate::new(Arc::new(policy)),
            metrics.clone(),
        )
    }

    /// Serve one connection on loopback and return the client side
    async fn connect_one(
        controller: &Arc<DoorController>,
        metrics: &Arc<Metrics>,
    ) -> (TcpStream, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let controller = controller.clone();
        let metrics = metrics.clone();
        let server = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            handle_transcripts(socket, peer, controller, metrics).await;
        });
        (TcpStream::connect(addr).await.unwrap(), server)
    }

    #[tokio::test]
    async fn test_transcripts_over_tcp_reach_controller() {
        let metrics = Arc::new(Metrics::new());
        let controller = controller(&metrics);
        let (mut client, server) = connect_one(&controller, &metrics).await;

        client.write_all(b"hello there\nplease open the garage\n").await.unwrap();
        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();

        assert_eq!(controller.current_state(), DoorState::Open);
        assert_eq!(metrics.report().adapter_errors, 0);
    }

    #[tokio::test]
    async fn test_oversized_transcript_drops_connection() {
        let metrics = Arc::new(Metrics::new());
        let controller = controller(&metrics);
        let (mut client, server) = connect_one(&controller, &metrics).await;

        // No newline, so the open command behind it is never read
        let mut flood = vec![b'a'; MAX_TRANSCRIPT_BYTES as usize * 4];
        flood.extend_from_slice(b" open the garage\n");
        client.write_all(&flood).await.unwrap();

        // Server side returns without the client closing
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();

        assert_eq!(controller.current_state(), DoorState::Closed);
        assert_eq!(metrics.report().adapter_errors, 1);
        assert_eq!(metrics.intents_from(crate::domain::types::Source::Voice), 0);
    }

    #[tokio::test]
    async fn test_transcript_at_limit_is_accepted() {
        let metrics = Arc::new(Metrics::new());
        let controller = controller(&metrics);
        let (mut client, server) = connect_one(&controller, &metrics).await;

        let command = b"open the garage ";
        let mut line = vec![b' '; MAX_TRANSCRIPT_BYTES as usize - command.len()];
        line.extend_from_slice(command);
        line.push(b'\n');
        client.write_all(&line).await.unwrap();
        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();

        assert_eq!(controller.current_state(), DoorState::Open);
        assert_eq!(metrics.report().adapter_errors, 0);
    }

    #[tokio::test]
    async fn test_listener_binds_configured_address() {
        let metrics = Arc::new(Metrics::new());
        let controller = controller(&metrics);

        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(start_voice_listener(addr, controller.clone(), metrics, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"shut the garage\nopen the garage\n").await.unwrap();
        client.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.current_state(), DoorState::Open);

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap().unwrap();
    }
}
