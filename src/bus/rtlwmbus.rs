use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::Sender;

use super::{BusError, InboundFrame};
use crate::linkmode::{LinkMode, LinkModeSet};
use crate::telegram::AboutTelegram;

pub fn capabilities() -> LinkModeSet {
    LinkModeSet::empty()
        .with(LinkMode::C1)
        .with(LinkMode::T1)
        .with(LinkMode::S1)
}

const EXIT_MESSAGE: &str = "rtl_wmbus: exiting";

/// What one line from the pipeline contained.
#[derive(Debug, PartialEq)]
pub enum Line {
    /// Telegrams plus the packet rssi; one line can carry several frames.
    Telegrams { frames: Vec<Vec<u8>>, rssi_dbm: i32 },
    /// The child announced it is going down and must be restarted.
    Exiting,
    /// CRC failed at the SDR level, or chatter on stderr.
    Ignored,
}

/// MODE;CRC_OK;3OUTOF6OK;TIMESTAMP;PACKET_RSSI;CURRENT_RSSI;ID;0x<hex>
/// with any number of further ;0x<hex> telegrams on the same line.
pub fn parse_line(line: &str) -> Line {
    if line.contains(EXIT_MESSAGE) {
        return Line::Exiting;
    }
    lazy_static! {
        static ref GOOD: Regex = Regex::new(r"^[CTS]1;1;").unwrap();
        static ref ANY_MODE: Regex = Regex::new(r"^[CTS]1;").unwrap();
    }
    let direct_hex = line.starts_with("0x");
    if !direct_hex {
        if !ANY_MODE.is_match(line) {
            return Line::Ignored;
        }
        if !GOOD.is_match(line) {
            debug!("(rtlwmbus) telegram received but crc checks failed, dropped");
            return Line::Ignored;
        }
    }

    let fields: Vec<&str> = line.split(';').collect();
    let mut rssi_dbm = 0;
    if !direct_hex && fields.len() > 4 {
        if let Ok(rssi) = fields[4].parse::<f64>() {
            rssi_dbm = rssi as i32;
        }
    }

    let mut frames = Vec::new();
    for f in fields {
        if let Some(hexpart) = f.strip_prefix("0x") {
            match hex::decode(hexpart.trim()) {
                Ok(frame) => frames.push(frame),
                Err(_) => debug!("(rtlwmbus) bad hex on line, skipping one telegram"),
            }
        }
    }
    if frames.is_empty() {
        return Line::Ignored;
    }
    Line::Telegrams { frames, rssi_dbm }
}

/// A software defined radio pipeline: an rtl_sdr | rtl_wmbus child whose
/// stdout carries one telegram per text line. The child is restarted when
/// it reports that it is exiting.
pub struct RtlWmbus {
    pub alias: String,
    pub command: String,
    child: Option<Child>,
    frame_tx: Sender<InboundFrame>,
    configured_modes: LinkModeSet,
}

impl RtlWmbus {
    pub fn new(alias: &str, command: &str, frame_tx: Sender<InboundFrame>) -> RtlWmbus {
        RtlWmbus {
            alias: alias.to_string(),
            command: command.to_string(),
            child: None,
            frame_tx,
            configured_modes: capabilities(),
        }
    }

    /// Spawn the pipeline and the line pump task.
    pub async fn start(&mut self) -> Result<(), BusError> {
        info!("({}) starting: {}", self.alias, self.command);
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .stdout(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| BusError::SpawnFailed(self.command.clone(), e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BusError::SpawnFailed(self.command.clone(), "no stdout".to_string()))?;
        let alias = self.alias.clone();
        let frame_tx = self.frame_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_line(&line) {
                    Line::Telegrams { frames, rssi_dbm } => {
                        for frame in frames {
                            let about = AboutTelegram::new(&alias, rssi_dbm);
                            if frame_tx.send((about, frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Line::Exiting => {
                        warn!("({alias}) rtl_wmbus is exiting, bus needs a restart");
                        return;
                    }
                    Line::Ignored => {}
                }
            }
            debug!("({alias}) pipeline stdout closed");
        });

        self.child = Some(child);
        Ok(())
    }

    /// The child is gone when its stdout pump stopped or it exited.
    pub fn is_closed(&mut self) -> bool {
        match &mut self.child {
            None => true,
            Some(c) => matches!(c.try_wait(), Ok(Some(_)) | Err(_)),
        }
    }

    pub fn link_modes(&self) -> LinkModeSet {
        self.configured_modes
    }

    pub fn capabilities(&self) -> LinkModeSet {
        capabilities()
    }

    /// The sdr decodes all modes it hears, nothing to configure.
    pub async fn set_link_modes(&mut self, _lms: LinkModeSet) -> Result<(), BusError> {
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut c) = self.child.take() {
            let _ = c.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_line_yields_one_telegram() {
        let l = parse_line("C1;1;1;2019-02-09 07:14:18.000;117;102;94740459;0x4944334455");
        match l {
            Line::Telegrams { frames, rssi_dbm } => {
                assert_eq!(frames, vec![vec![0x49, 0x44, 0x33, 0x44, 0x55]]);
                assert_eq!(rssi_dbm, 117);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multiple_telegrams_on_one_line() {
        let l = parse_line("T1;1;1;2019-02-09 07:14:18.000;90;80;123;0x1122;0x3344");
        match l {
            Line::Telegrams { frames, .. } => {
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[1], vec![0x33, 0x44]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failed_crc_lines_are_dropped() {
        assert_eq!(
            parse_line("T1;0;0;2019-02-09 07:14:18.000;90;80;123;0x1122"),
            Line::Ignored
        );
    }

    #[test]
    fn stderr_chatter_is_ignored_and_exit_detected() {
        assert_eq!(parse_line("Found Rafael Micro R820T tuner"), Line::Ignored);
        assert_eq!(parse_line("rtl_wmbus: exiting"), Line::Exiting);
    }
}
