use std::sync::Arc;
use std::time::Duration;

use crc16::{State, X_25};
use log::debug;
use tokio::sync::mpsc::Sender;

use super::serial::{CommandExchange, SerialPort};
use super::{spawn_reader, BusError, FrameEvent, InboundFrame};
use crate::linkmode::{LinkMode, LinkModeSet};

/* Slip framing bytes. */
pub const SLIP_END: u8 = 0xc0;
pub const SLIP_ESC: u8 = 0xdb;
pub const SLIP_ESC_END: u8 = 0xdc;
pub const SLIP_ESC_ESC: u8 = 0xdd;

pub const SAP_DEVMGMT_ID: u8 = 0x01;
pub const SAP_WMBUSGW_ID: u8 = 0x06;

pub const DEVMGMT_MSG_PING_REQ: u8 = 0x01;
pub const DEVMGMT_MSG_PING_RSP: u8 = 0x02;
pub const DEVMGMT_MSG_GET_DEVICE_INFO_REQ: u8 = 0x03;
pub const DEVMGMT_MSG_GET_DEVICE_INFO_RSP: u8 = 0x04;
pub const DEVMGMT_MSG_RESET_REQ: u8 = 0x07;
pub const DEVMGMT_MSG_RESET_RSP: u8 = 0x08;
pub const WMBUSGW_GET_ACTIVE_CONFIGURATION_REQ: u8 = 0x01;
pub const WMBUSGW_GET_ACTIVE_CONFIGURATION_RSP: u8 = 0x02;
pub const WMBUSGW_SET_ACTIVE_CONFIGURATION_REQ: u8 = 0x03;
pub const WMBUSGW_SET_ACTIVE_CONFIGURATION_RSP: u8 = 0x04;
pub const WMBUSGW_GET_WMBUS_ADDRESS_REQ: u8 = 0x05;
pub const WMBUSGW_GET_WMBUS_ADDRESS_RSP: u8 = 0x06;
pub const WMBUSGW_TX_MESSAGE_REQ: u8 = 0x07;
pub const WMBUSGW_RX_MESSAGE_IND: u8 = 0x08;

pub fn capabilities() -> LinkModeSet {
    LinkModeSet::empty()
        .with(LinkMode::C1)
        .with(LinkMode::C2)
        .with(LinkMode::T1)
        .with(LinkMode::T2)
        .with(LinkMode::S1)
}

/// Wrap endpoint, msg id and body with the crc16-ccitt (initial 0xFFFF,
/// final complement, appended little endian) and slip escape the result.
pub fn build_request(endpoint_id: u8, msg_id: u8, body: &[u8]) -> Vec<u8> {
    let mut plain = vec![endpoint_id, msg_id];
    plain.extend_from_slice(body);
    let crc = State::<X_25>::calculate(&plain);
    plain.push((crc & 0xff) as u8);
    plain.push((crc >> 8) as u8);

    let mut out = vec![SLIP_END];
    for b in plain {
        match b {
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
    out
}

/// Undo the slip framing of the first complete frame in the buffer.
/// Returns the unescaped message and how many buffer bytes it covered.
fn remove_slip_framing(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let start = data.iter().position(|b| *b == SLIP_END)?;
    let mut msg = Vec::new();
    let mut i = start + 1;
    while i < data.len() {
        match data[i] {
            SLIP_END => {
                if msg.is_empty() {
                    /* Back to back END bytes, keep scanning. */
                    i += 1;
                    continue;
                }
                return Some((msg, i + 1));
            }
            SLIP_ESC => {
                if i + 1 >= data.len() {
                    return None;
                }
                match data[i + 1] {
                    SLIP_ESC_END => msg.push(SLIP_END),
                    SLIP_ESC_ESC => msg.push(SLIP_ESC),
                    other => msg.push(other),
                }
                i += 2;
            }
            other => {
                msg.push(other);
                i += 1;
            }
        }
    }
    None
}

/// The iu880b and iu891a share this framing: a slip envelope around
/// endpoint, msg id, status, payload and a trailing crc.
#[derive(Default)]
pub struct Framer;

impl Framer {
    pub fn consume(&mut self, buffer: &mut Vec<u8>) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        while let Some((msg, consumed)) = remove_slip_framing(buffer) {
            buffer.drain(..consumed);
            if msg.len() < 5 {
                debug!("(iu880b) runt frame, {} bytes", msg.len());
                continue;
            }
            let crc = State::<X_25>::calculate(&msg[..msg.len() - 2]);
            let crc_lo = (crc & 0xff) as u8;
            let crc_hi = (crc >> 8) as u8;
            if msg[msg.len() - 2] != crc_lo || msg[msg.len() - 1] != crc_hi {
                debug!(
                    "(iu880b) bad crc got {:02x}{:02x} expected {:02x}{:02x}",
                    msg[msg.len() - 1],
                    msg[msg.len() - 2],
                    crc_hi,
                    crc_lo
                );
                continue;
            }
            let endpoint_id = msg[0];
            let msg_id = msg[1];
            let payload = &msg[2..msg.len() - 2];

            if endpoint_id == SAP_WMBUSGW_ID && msg_id == WMBUSGW_RX_MESSAGE_IND {
                if payload.len() < 10 {
                    continue;
                }
                let rssi_dbm = payload[7] as i8 as i32;
                events.push(FrameEvent::Telegram {
                    bytes: payload[8..].to_vec(),
                    rssi_dbm,
                });
            } else {
                let mut r = vec![msg_id];
                r.extend_from_slice(payload);
                events.push(FrameEvent::Response { payload: r });
            }
        }
        events
    }
}

/// IU880B / IU891A dongle with the slip framed gateway protocol.
pub struct Iu880b {
    pub alias: String,
    port: SerialPort,
    exchange: Arc<CommandExchange>,
    configured_modes: LinkModeSet,
    woken_up: bool,
}

impl Iu880b {
    pub async fn open(
        alias: &str,
        path: &str,
        frame_tx: Sender<InboundFrame>,
    ) -> Result<Iu880b, BusError> {
        let (port, bytes_rx) = SerialPort::open(path, 115200)?;
        let exchange = Arc::new(CommandExchange::new());
        let mut framer = Framer;
        spawn_reader(
            alias.to_string(),
            bytes_rx,
            frame_tx,
            exchange.response_sender(),
            move |buf| framer.consume(buf),
        );
        Ok(Iu880b {
            alias: alias.to_string(),
            port,
            exchange,
            configured_modes: LinkModeSet::empty(),
            woken_up: false,
        })
    }

    /// Thirty 0xC0 bytes wake the dongle before its first command.
    fn wakeup(&mut self) -> Result<(), BusError> {
        if self.woken_up {
            return Ok(());
        }
        self.port.send(&[SLIP_END; 30])?;
        self.woken_up = true;
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<(), BusError> {
        self.wakeup()?;
        let req = build_request(SAP_DEVMGMT_ID, DEVMGMT_MSG_PING_REQ, &[]);
        let rsp = self
            .exchange
            .send_and_wait_retrying(&mut self.port, &req, Duration::from_millis(500), 4)
            .await?;
        if rsp.first() != Some(&DEVMGMT_MSG_PING_RSP) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<(), BusError> {
        self.wakeup()?;
        let req = build_request(SAP_DEVMGMT_ID, DEVMGMT_MSG_RESET_REQ, &[]);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_secs(3))
            .await?;
        if rsp.first() != Some(&DEVMGMT_MSG_RESET_RSP) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        Ok(())
    }

    pub async fn get_device_id(&mut self) -> Result<String, BusError> {
        self.wakeup()?;
        let req = build_request(SAP_WMBUSGW_ID, WMBUSGW_GET_WMBUS_ADDRESS_REQ, &[]);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_millis(500))
            .await?;
        if rsp.first() != Some(&WMBUSGW_GET_WMBUS_ADDRESS_RSP) || rsp.len() < 6 {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        Ok(hex::encode(&rsp[2..6]))
    }

    pub fn link_modes(&self) -> LinkModeSet {
        self.configured_modes
    }

    pub fn capabilities(&self) -> LinkModeSet {
        capabilities()
    }

    pub async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), BusError> {
        if !capabilities().covers(lms) {
            return Err(BusError::UnsupportedLinkModes(self.alias.clone(), lms.hr()));
        }
        self.wakeup()?;
        let Some(first) = lms.modes().first().copied() else {
            return Ok(());
        };
        let mode = match first {
            LinkMode::S1 => 1u8,
            LinkMode::T1 => 2,
            LinkMode::T2 => 3,
            LinkMode::C1 => 4,
            LinkMode::C2 => 5,
            _ => return Err(BusError::UnsupportedLinkModes(self.alias.clone(), lms.hr())),
        };
        /* Forward all received telegrams and raise rx/tx indications. */
        let body = [mode, 0x06, 0x00];
        let req = build_request(SAP_WMBUSGW_ID, WMBUSGW_SET_ACTIVE_CONFIGURATION_REQ, &body);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_millis(1500))
            .await?;
        if rsp.first() != Some(&WMBUSGW_SET_ACTIVE_CONFIGURATION_RSP) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        self.configured_modes = LinkModeSet::empty().with(first);
        Ok(())
    }

    pub async fn send_telegram(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.wakeup()?;
        let req = build_request(SAP_WMBUSGW_ID, WMBUSGW_TX_MESSAGE_REQ, bytes);
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
    fn request_roundtrips_through_framer() {
        let req = build_request(SAP_DEVMGMT_ID, DEVMGMT_MSG_PING_RSP, &[0x00]);
        let mut framer = Framer;
        let mut buffer = req;
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Response { payload } => {
                assert_eq!(payload[0], DEVMGMT_MSG_PING_RSP);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn escaped_bytes_survive() {
        let body = [SLIP_END, SLIP_ESC, 0x42];
        let req = build_request(SAP_DEVMGMT_ID, 0x10, &body);
        let mut framer = Framer;
        let mut buffer = req;
        let events = framer.consume(&mut buffer);
        match &events[0] {
            FrameEvent::Response { payload } => {
                assert_eq!(&payload[1..], &body);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_crc_is_dropped() {
        let mut req = build_request(SAP_DEVMGMT_ID, DEVMGMT_MSG_PING_RSP, &[]);
        let n = req.len();
        req[n - 2] ^= 0xff; // Flip a crc byte inside the slip envelope.
        let mut framer = Framer;
        let mut buffer = req;
        assert!(framer.consume(&mut buffer).is_empty());
    }

    #[test]
    fn rx_indication_extracts_rssi_and_frame() {
        /* Config header of 8 bytes with rssi at offset 7, then the frame. */
        let mut body = vec![0u8; 8];
        body[7] = (-77i8) as u8;
        body.extend_from_slice(&[0x1e, 0x44, 0x2d, 0x2c]);
        let req = build_request(SAP_WMBUSGW_ID, WMBUSGW_RX_MESSAGE_IND, &body);
        let mut framer = Framer;
        let mut buffer = req;
        let events = framer.consume(&mut buffer);
        match &events[0] {
            FrameEvent::Telegram { bytes, rssi_dbm } => {
                assert_eq!(*rssi_dbm, -77);
                assert_eq!(bytes[0], 0x1e);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
