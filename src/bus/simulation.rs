use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::Sender;

use super::InboundFrame;
use crate::telegram::AboutTelegram;

/// One line of a simulation or replay file: telegram=|HEX| with an
/// optional trailing comment. Underscores inside the hex are cosmetic.
pub fn parse_simulation_line(line: &str) -> Option<Vec<u8>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let rest = line.strip_prefix("telegram=")?;
    let rest = rest.trim_start_matches('|');
    let end = rest.find('|').unwrap_or(rest.len());
    let hex_part: String = rest[..end].chars().filter(|c| *c != '_').collect();
    match hex::decode(hex_part) {
        Ok(frame) => Some(frame),
        Err(_) => {
            warn!("bad hex in simulation line: {line}");
            None
        }
    }
}

/// Replays telegram lines from a file, stdin, or a recorded simulation.
/// Simulated frames carry the simulated flag so downstream side effects
/// can tell them apart from live radio traffic.
pub struct Simulation {
    pub alias: String,
    pub path: Option<String>,
    frame_tx: Sender<InboundFrame>,
    done: Arc<AtomicBool>,
}

impl Simulation {
    pub fn new(alias: &str, path: Option<&str>, frame_tx: Sender<InboundFrame>) -> Simulation {
        Simulation {
            alias: alias.to_string(),
            path: path.map(|p| p.to_string()),
            frame_tx,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the replay task. The handle stays behind so the bus manager
    /// can see when the input is exhausted.
    pub fn start(&self) {
        let alias = self.alias.clone();
        let path = self.path.clone();
        let frame_tx = self.frame_tx.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            match path {
                Some(path) => {
                    info!("({alias}) replaying {path}");
                    match tokio::fs::File::open(&path).await {
                        Ok(file) => {
                            let mut lines = BufReader::new(file).lines();
                            while let Ok(Some(line)) = lines.next_line().await {
                                feed(&alias, &frame_tx, &line).await;
                            }
                        }
                        Err(e) => warn!("({alias}) cannot open {path}: {e}"),
                    }
                }
                None => {
                    info!("({alias}) reading telegrams from stdin");
                    let mut lines = BufReader::new(tokio::io::stdin()).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        feed(&alias, &frame_tx, &line).await;
                    }
                }
            }
            debug!("({alias}) simulation input exhausted");
            done.store(true, Ordering::SeqCst);
        });
    }

    pub fn is_closed(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

async fn feed(alias: &str, frame_tx: &Sender<InboundFrame>, line: &str) {
    if let Some(frame) = parse_simulation_line(line) {
        let mut about = AboutTelegram::new(alias, 0);
        about.simulated = true;
        let _ = frame_tx.send((about, frame)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_piped_hex_lines() {
        let frame = parse_simulation_line("telegram=|2E44931578563412330333637A2A0020|").unwrap();
        assert_eq!(frame[0], 0x2e);
        assert_eq!(frame.len(), 16);
    }

    #[test]
    fn underscores_and_comments_are_tolerated() {
        let frame = parse_simulation_line("telegram=|2E449315_78563412|").unwrap();
        assert_eq!(frame.len(), 8);
        assert!(parse_simulation_line("# just a comment").is_none());
        assert!(parse_simulation_line("").is_none());
        assert!(parse_simulation_line("telegram=|zzzz|").is_none());
    }
}
