use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc::Sender;

use super::serial::{CommandExchange, SerialPort};
use super::{spawn_reader, BusError, FrameEvent, InboundFrame};
use crate::linkmode::{LinkMode, LinkModeSet};
use crate::telegram::is_valid_c_field;

pub const SOF: u8 = 0xff;

pub const CMD_DATA_REQ: u8 = 0x00;
pub const CMD_DATA_IND: u8 = 0x03;
pub const CMD_SET_MODE_REQ: u8 = 0x04;
pub const CMD_RESET_REQ: u8 = 0x05;
pub const CMD_SET_REQ: u8 = 0x09;
pub const CMD_GET_REQ: u8 = 0x0a;
pub const CMD_SERIALNO_REQ: u8 = 0x0b;
pub const CMD_FACTORYRESET_REQ: u8 = 0x11;

pub fn capabilities() -> LinkModeSet {
    /* The amb3665 is the 169 MHz n-mode sibling. */
    LinkModeSet::empty()
        .with(LinkMode::N1a)
        .with(LinkMode::N1b)
        .with(LinkMode::N1c)
        .with(LinkMode::N1d)
        .with(LinkMode::N1e)
        .with(LinkMode::N1f)
}

/// Xor of all bytes in the range, the module's checksum.
pub fn xor_checksum(msg: &[u8]) -> u8 {
    msg.iter().fold(0u8, |acc, b| acc ^ b)
}

fn rssi_to_dbm(raw: u8) -> i32 {
    let raw = raw as i32;
    if raw >= 128 {
        (raw - 256) / 2 - 74
    } else {
        raw / 2 - 74
    }
}

pub fn build_command(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![SOF, cmd, payload.len() as u8];
    msg.extend_from_slice(payload);
    msg.push(xor_checksum(&msg));
    msg
}

/// Command responses are SOF framed with an xor checksum; in the raw
/// reception mode a telegram is just a plausible dll length and c-field,
/// closed by one rssi byte.
pub struct Framer {
    pub rssi_expected: bool,
}

impl Framer {
    pub fn consume(&mut self, buffer: &mut Vec<u8>) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        loop {
            if buffer.len() < 2 {
                break;
            }
            if buffer[0] == SOF {
                if buffer.len() < 3 {
                    break;
                }
                let msgid = buffer[1];
                let payload_len = buffer[2] as usize;
                /* Only the data indication carries a trailing rssi byte. */
                let rssi_len = if self.rssi_expected && msgid == 0x80 | CMD_DATA_IND { 1 } else { 0 };
                let frame_length = 4 + payload_len + rssi_len;
                if buffer.len() < frame_length {
                    break;
                }
                let cs = xor_checksum(&buffer[..frame_length - 1]);
                if buffer[frame_length - 1] != cs {
                    debug!(
                        "(amb3665) checksum error {:02x} (should {:02x})",
                        buffer[frame_length - 1],
                        cs
                    );
                }
                let rssi_dbm = if rssi_len == 1 {
                    rssi_to_dbm(buffer[frame_length - 2])
                } else {
                    0
                };
                let payload = buffer[3..3 + payload_len].to_vec();
                buffer.drain(..frame_length);
                if msgid == 0x80 | CMD_DATA_IND {
                    /* The indication payload is the frame without its
                       length byte. */
                    let mut frame = Vec::with_capacity(payload.len() + 1);
                    frame.push(payload.len() as u8);
                    frame.extend_from_slice(&payload);
                    events.push(FrameEvent::Telegram { bytes: frame, rssi_dbm });
                } else {
                    let mut r = vec![msgid];
                    r.extend_from_slice(&payload);
                    events.push(FrameEvent::Response { payload: r });
                }
                continue;
            }

            /* Raw mode: resync until a byte pair looks like a dll length
               plus a valid c-field. */
            let mut offset = 0;
            while buffer[offset] < 10 || !is_valid_c_field(buffer[offset + 1]) {
                offset += 1;
                if offset + 2 >= buffer.len() {
                    /* No sensible telegram in the buffer, flush all but the
                       last byte which may start the next frame. */
                    debug!("(amb3665) no sensible telegram found, clearing buffer");
                    let last = buffer[buffer.len() - 1];
                    buffer.clear();
                    buffer.push(last);
                    return events;
                }
            }
            let payload_len = buffer[offset] as usize;
            let rssi_len = if self.rssi_expected { 1 } else { 0 };
            let frame_length = offset + 1 + payload_len + rssi_len;
            if buffer.len() < frame_length {
                break;
            }
            if offset > 0 {
                debug!("(amb3665) out of sync, skipping {offset} bytes");
            }
            let rssi_dbm = if rssi_len == 1 {
                rssi_to_dbm(buffer[frame_length - 1])
            } else {
                0
            };
            let frame = buffer[offset..offset + 1 + payload_len].to_vec();
            buffer.drain(..frame_length);
            events.push(FrameEvent::Telegram { bytes: frame, rssi_dbm });
        }
        events
    }
}

/// An amber amb3665 dongle.
pub struct Amb3665 {
    pub alias: String,
    port: SerialPort,
    exchange: Arc<CommandExchange>,
    configured_modes: LinkModeSet,
}

impl Amb3665 {
    pub async fn open(
        alias: &str,
        path: &str,
        frame_tx: Sender<InboundFrame>,
    ) -> Result<Amb3665, BusError> {
        let (port, bytes_rx) = SerialPort::open(path, 9600)?;
        let exchange = Arc::new(CommandExchange::new());
        let mut framer = Framer { rssi_expected: true };
        spawn_reader(
            alias.to_string(),
            bytes_rx,
            frame_tx,
            exchange.response_sender(),
            move |buf| framer.consume(buf),
        );
        Ok(Amb3665 {
            alias: alias.to_string(),
            port,
            exchange,
            configured_modes: LinkModeSet::empty(),
        })
    }

    pub async fn get_device_id(&mut self) -> Result<String, BusError> {
        let req = build_command(CMD_SERIALNO_REQ, &[]);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_millis(500))
            .await?;
        if rsp.first() != Some(&(0x80 | CMD_SERIALNO_REQ)) || rsp.len() < 5 {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        Ok(hex::encode(&rsp[1..5]))
    }

    pub async fn reset(&mut self) -> Result<(), BusError> {
        let req = build_command(CMD_RESET_REQ, &[]);
        let _ = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_secs(3))
            .await?;
        Ok(())
    }

    pub fn link_modes(&self) -> LinkModeSet {
        self.configured_modes
    }

    pub fn capabilities(&self) -> LinkModeSet {
        capabilities()
    }

    pub async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), BusError> {
        let Some(first) = lms.modes().first().copied() else {
            return Ok(());
        };
        let mode = match first {
            LinkMode::N1a => 0x01u8,
            LinkMode::N1b => 0x02,
            LinkMode::N1c => 0x03,
            LinkMode::N1d => 0x04,
            LinkMode::N1e => 0x05,
            LinkMode::N1f => 0x06,
            _ => return Err(BusError::UnsupportedLinkModes(self.alias.clone(), lms.hr())),
        };
        /* Volatile mode change, byte 0 selects non-persistent. */
        let req = build_command(CMD_SET_MODE_REQ, &[mode]);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_millis(500))
            .await?;
        if rsp.first() != Some(&(0x80 | CMD_SET_MODE_REQ)) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        self.configured_modes = LinkModeSet::empty().with(first);
        Ok(())
    }

    pub async fn send_telegram(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        let payload = if bytes.len() > 1 { &bytes[1..] } else { bytes };
        let req = build_command(CMD_DATA_REQ, payload);
        self.port.send(&req)?;
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
    fn checksum_is_plain_xor() {
        assert_eq!(xor_checksum(&[0xff, 0x0b, 0x00]), 0xff ^ 0x0b);
        let cmd = build_command(CMD_SERIALNO_REQ, &[]);
        assert_eq!(cmd, vec![0xff, 0x0b, 0x00, 0xff ^ 0x0b]);
    }

    #[test]
    fn data_indication_with_rssi() {
        let mut framer = Framer { rssi_expected: true };
        let payload = [0x44u8, 0x2d, 0x2c];
        let mut msg = vec![SOF, 0x80 | CMD_DATA_IND, payload.len() as u8];
        msg.extend_from_slice(&payload);
        msg.push(100); // Raw rssi.
        msg.push(xor_checksum(&msg));
        let mut buffer = msg;
        let events = framer.consume(&mut buffer);
        match &events[0] {
            FrameEvent::Telegram { bytes, rssi_dbm } => {
                assert_eq!(bytes, &vec![3, 0x44, 0x2d, 0x2c]);
                assert_eq!(*rssi_dbm, 100 / 2 - 74);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn raw_mode_resyncs_to_valid_c_field() {
        let mut framer = Framer { rssi_expected: true };
        /* Garbage, then a 11 byte frame (len 0x0a + rssi). */
        let mut buffer = vec![0x01, 0x02];
        buffer.extend_from_slice(&[
            0x0a, 0x44, 0x2d, 0x2c, 0x36, 0x36, 0x36, 0x36, 0x35, 0x04, 0x8d, 200,
        ]);
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Telegram { bytes, rssi_dbm } => {
                assert_eq!(bytes[0], 0x0a);
                assert_eq!(bytes.len(), 11);
                assert_eq!(*rssi_dbm, (200 - 256) / 2 - 74);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn hopeless_buffer_keeps_only_last_byte() {
        let mut framer = Framer { rssi_expected: false };
        let mut buffer = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let events = framer.consume(&mut buffer);
        assert!(events.is_empty());
        assert_eq!(buffer, vec![0x05]);
    }
}
