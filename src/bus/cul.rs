use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::Sender;

use super::serial::{CommandExchange, SerialPort};
use super::{spawn_reader, BusError, FrameEvent, InboundFrame};
use crate::linkmode::{LinkMode, LinkModeSet};

pub fn capabilities() -> LinkModeSet {
    LinkModeSet::empty()
        .with(LinkMode::C1)
        .with(LinkMode::T1)
        .with(LinkMode::S1)
}

/// Each received telegram is a text line: 'b' (t1 frame a) or "bY" (c1
/// frame b), hex payload, four hex chars of lqi and rssi, crlf. Anything
/// else on a line is command output.
#[derive(Default)]
pub struct Framer;

impl Framer {
    pub fn consume(&mut self, buffer: &mut Vec<u8>) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        loop {
            let Some(eol) = buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let eof_len = if eol > 0 && buffer[eol - 1] == b'\r' { 2 } else { 1 };
            let line: Vec<u8> = buffer[..eol + 1 - eof_len].to_vec();
            buffer.drain(..eol + 1);

            if line.first() != Some(&b'b') {
                /* Text response to one of the ascii commands. */
                events.push(FrameEvent::Response { payload: line });
                continue;
            }
            if line.len() < 6 {
                debug!("(cul) short line, ignored");
                continue;
            }

            /* Reception was started with X21, so the last four hex chars
               are one lqi and one raw rssi byte. */
            let Ok(lqi_rssi) = hex::decode(&line[line.len() - 4..]) else {
                warn!("(cul) the lqi and rssi hex string is not properly formatted");
                continue;
            };
            let lqi = lqi_rssi[0] >> 1;
            let rssi_raw = lqi_rssi[1] as i8;
            /* Per the cc1101 datasheet page 44. */
            let rssi_dbm = rssi_raw as i32 / 2 - 74;
            debug!("(cul) lqi {lqi} rssi raw {rssi_raw}");

            let hex_from = if line.get(1) == Some(&b'Y') { 2 } else { 1 };
            let hex_part = &line[hex_from..line.len() - 4];
            if hex_part.len() % 2 == 1 {
                warn!("(cul) odd hex length, your cul firmware drops bytes of long telegrams");
            }
            match hex::decode(hex_part) {
                Ok(frame) => events.push(FrameEvent::Telegram { bytes: frame, rssi_dbm }),
                Err(_) => debug!("(cul) bad hex in telegram line"),
            }
        }
        events
    }
}

pub struct Cul {
    pub alias: String,
    port: SerialPort,
    exchange: Arc<CommandExchange>,
    configured_modes: LinkModeSet,
}

impl Cul {
    pub async fn open(
        alias: &str,
        path: &str,
        frame_tx: Sender<InboundFrame>,
    ) -> Result<Cul, BusError> {
        let (port, bytes_rx) = SerialPort::open(path, 38400)?;
        let exchange = Arc::new(CommandExchange::new());
        let mut framer = Framer;
        spawn_reader(
            alias.to_string(),
            bytes_rx,
            frame_tx,
            exchange.response_sender(),
            move |buf| framer.consume(buf),
        );
        Ok(Cul {
            alias: alias.to_string(),
            port,
            exchange,
            configured_modes: LinkModeSet::empty(),
        })
    }

    /// "V" prints the firmware version, eg "V 1.67 nanoCUL868".
    pub async fn get_device_id(&mut self) -> Result<String, BusError> {
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, b"V\r\n", Duration::from_millis(500))
            .await?;
        let version = String::from_utf8_lossy(&rsp).trim().to_string();
        if !version.starts_with('V') {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        Ok(version)
    }

    pub fn link_modes(&self) -> LinkModeSet {
        self.configured_modes
    }

    pub fn capabilities(&self) -> LinkModeSet {
        capabilities()
    }

    /// brc/brt/brs select the radio mode, X21 starts reporting with raw
    /// lqi and rssi appended.
    pub async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), BusError> {
        let Some(first) = lms.modes().first().copied() else {
            return Ok(());
        };
        let cmd: &[u8] = match first {
            LinkMode::C1 => b"brc\r\n",
            LinkMode::T1 => b"brt\r\n",
            LinkMode::S1 => b"brs\r\n",
            _ => return Err(BusError::UnsupportedLinkModes(self.alias.clone(), lms.hr())),
        };
        self.port.send(cmd)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.port.send(b"X21\r\n")?;
        self.configured_modes = LinkModeSet::empty().with(first);
        Ok(())
    }

    pub async fn send_telegram(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        /* Send as a hex line prefixed with bs. */
        let mut line = b"bs".to_vec();
        line.extend_from_slice(hex::encode_upper(bytes).as_bytes());
        line.extend_from_slice(b"\r\n");
        self.port.send(&line)?;
        Ok(())
    }

    pub fn close(&self) {
        self.port.close();
    }

    pub fn is_closed(&self) -> bool {
        self.port.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t1_line_is_decoded_with_rssi() {
        let mut framer = Framer;
        /* Payload 442d2c, lqi 0x28, rssi 0xa0 (-48 raw). */
        let mut buffer = b"b442D2C28A0\r\n".to_vec();
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Telegram { bytes, rssi_dbm } => {
                assert_eq!(bytes, &vec![0x44, 0x2d, 0x2c]);
                assert_eq!(*rssi_dbm, (0xa0u8 as i8) as i32 / 2 - 74);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn by_prefix_marks_c1_frame_b() {
        let mut framer = Framer;
        let mut buffer = b"bY44332228A0\r\n".to_vec();
        let events = framer.consume(&mut buffer);
        match &events[0] {
            FrameEvent::Telegram { bytes, .. } => assert_eq!(bytes, &vec![0x44, 0x33, 0x22]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn version_lines_are_responses() {
        let mut framer = Framer;
        let mut buffer = b"V 1.67 nanoCUL868\r\nb442D2C28A0\r\n".to_vec();
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FrameEvent::Response { .. }));
        assert!(matches!(events[1], FrameEvent::Telegram { .. }));
    }

    #[test]
    fn partial_line_waits() {
        let mut framer = Framer;
        let mut buffer = b"b442D2C".to_vec();
        assert!(framer.consume(&mut buffer).is_empty());
        assert_eq!(buffer.len(), 7);
    }
}
