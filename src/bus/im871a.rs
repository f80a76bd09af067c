use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::serial::{CommandExchange, SerialPort};
use super::{spawn_reader, BusError, FrameEvent, InboundFrame};
use crate::linkmode::{LinkMode, LinkModeSet};
use tokio::sync::mpsc::Sender;

pub const SOF: u8 = 0xa5;

pub const DEVMGMT_ID: u8 = 0x01;
pub const RADIOLINK_ID: u8 = 0x02;
pub const RADIOLINKTEST_ID: u8 = 0x03;
pub const HWTEST_ID: u8 = 0x04;

pub const DEVMGMT_MSG_PING_REQ: u8 = 0x01;
pub const DEVMGMT_MSG_PING_RSP: u8 = 0x02;
pub const DEVMGMT_MSG_SET_CONFIG_REQ: u8 = 0x03;
pub const DEVMGMT_MSG_SET_CONFIG_RSP: u8 = 0x04;
pub const DEVMGMT_MSG_GET_CONFIG_REQ: u8 = 0x05;
pub const DEVMGMT_MSG_GET_CONFIG_RSP: u8 = 0x06;
pub const DEVMGMT_MSG_RESET_REQ: u8 = 0x07;
pub const DEVMGMT_MSG_RESET_RSP: u8 = 0x08;
pub const DEVMGMT_MSG_GET_DEVICEINFO_REQ: u8 = 0x10;
pub const DEVMGMT_MSG_GET_DEVICEINFO_RSP: u8 = 0x11;
pub const RADIOLINK_MSG_WMBUSMSG_REQ: u8 = 0x01;
pub const RADIOLINK_MSG_WMBUSMSG_IND: u8 = 0x03;

/// Radio mode values from the HCI specification.
fn radio_mode(lm: LinkMode) -> Option<u8> {
    match lm {
        LinkMode::S1 => Some(1),
        LinkMode::S1m => Some(2),
        LinkMode::S2 => Some(3),
        LinkMode::T1 => Some(4),
        LinkMode::T2 => Some(5),
        LinkMode::C1 => Some(7),
        LinkMode::C2 => Some(9),
        _ => None,
    }
}

pub fn capabilities() -> LinkModeSet {
    LinkModeSet::empty()
        .with(LinkMode::C1)
        .with(LinkMode::C2)
        .with(LinkMode::T1)
        .with(LinkMode::T2)
        .with(LinkMode::S1)
        .with(LinkMode::S1m)
        .with(LinkMode::S2)
}

enum Status {
    Partial,
    Full { length: usize, endpoint: u8, msgid: u8, payload_from: usize, payload_len: usize, rssi_dbm: i32 },
    Garbage,
}

/// Hci frame: SOF, ctrl nibble + endpoint, msg id, length, payload, then
/// optional timestamp, rssi and crc16 trailers flagged in the ctrl nibble.
fn check_frame(data: &[u8]) -> Status {
    if data.is_empty() {
        return Status::Partial;
    }
    if data[0] != SOF {
        return Status::Garbage;
    }
    if data.len() < 4 {
        return Status::Partial;
    }
    let ctrlbits = data[1] >> 4;
    let has_timestamp = ctrlbits & 2 == 2;
    let has_rssi = ctrlbits & 4 == 4;
    let has_crc16 = ctrlbits & 8 == 8;
    let endpoint = data[1] & 0x0f;
    if !matches!(endpoint, DEVMGMT_ID | RADIOLINK_ID | RADIOLINKTEST_ID | HWTEST_ID) {
        return Status::Garbage;
    }
    let msgid = data[2];
    let valid = match endpoint {
        DEVMGMT_ID => (1..=0x27).contains(&msgid),
        RADIOLINK_ID => (1..=0x05).contains(&msgid),
        RADIOLINKTEST_ID => (1..=0x07).contains(&msgid),
        _ => (1..=0x02).contains(&msgid),
    };
    if !valid {
        return Status::Garbage;
    }
    let payload_len = data[3] as usize;
    let length = 4
        + payload_len
        + if has_timestamp { 4 } else { 0 }
        + if has_rssi { 1 } else { 0 }
        + if has_crc16 { 2 } else { 0 };
    if data.len() < length {
        return Status::Partial;
    }
    let rssi_dbm = if has_rssi {
        /* Per the datasheet the rssi byte maps to dbm in half db steps. */
        let raw = data[4 + payload_len + if has_timestamp { 4 } else { 0 }] as i32;
        raw / 2 - 130
    } else {
        0
    };
    Status::Full { length, endpoint, msgid, payload_from: 4, payload_len, rssi_dbm }
}

/// Stateless scanner over the accumulated byte buffer, resyncing byte by
/// byte when garbage precedes the next SOF.
#[derive(Default)]
pub struct Framer;

impl Framer {
    pub fn consume(&mut self, buffer: &mut Vec<u8>) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        loop {
            match check_frame(buffer) {
                Status::Partial => break,
                Status::Garbage => {
                    buffer.remove(0);
                    continue;
                }
                Status::Full { length, endpoint, msgid, payload_from, payload_len, rssi_dbm } => {
                    let payload = buffer[payload_from..payload_from + payload_len].to_vec();
                    buffer.drain(..length);
                    match (endpoint, msgid) {
                        (RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_IND) => {
                            /* The module strips the length byte, put it back
                               so the decoder sees a whole frame. */
                            let mut frame = Vec::with_capacity(payload.len() + 1);
                            frame.push(payload.len() as u8);
                            frame.extend_from_slice(&payload);
                            events.push(FrameEvent::Telegram { bytes: frame, rssi_dbm });
                        }
                        (DEVMGMT_ID, id) => {
                            let mut r = vec![id];
                            r.extend_from_slice(&payload);
                            events.push(FrameEvent::Response { payload: r });
                        }
                        _ => {
                            debug!("(im871a) unhandled endpoint {endpoint:02x} msg {msgid:02x}");
                        }
                    }
                }
            }
        }
        events
    }
}

pub fn build_command(endpoint: u8, msgid: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![SOF, endpoint, msgid, payload.len() as u8];
    msg.extend_from_slice(payload);
    msg
}

/// An IM871A dongle bound to one tty.
pub struct Im871a {
    pub alias: String,
    port: SerialPort,
    exchange: Arc<CommandExchange>,
    configured_modes: LinkModeSet,
}

impl Im871a {
    pub async fn open(
        alias: &str,
        path: &str,
        frame_tx: Sender<InboundFrame>,
    ) -> Result<Im871a, BusError> {
        let (port, bytes_rx) = SerialPort::open(path, 57600)?;
        let exchange = Arc::new(CommandExchange::new());
        let mut framer = Framer;
        spawn_reader(
            alias.to_string(),
            bytes_rx,
            frame_tx,
            exchange.response_sender(),
            move |buf| framer.consume(buf),
        );
        Ok(Im871a {
            alias: alias.to_string(),
            port,
            exchange,
            configured_modes: LinkModeSet::empty(),
        })
    }

    pub async fn ping(&mut self) -> Result<(), BusError> {
        let req = build_command(DEVMGMT_ID, DEVMGMT_MSG_PING_REQ, &[]);
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
        let req = build_command(DEVMGMT_ID, DEVMGMT_MSG_RESET_REQ, &[]);
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
        let req = build_command(DEVMGMT_ID, DEVMGMT_MSG_GET_DEVICEINFO_REQ, &[]);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_millis(500))
            .await?;
        if rsp.first() != Some(&DEVMGMT_MSG_GET_DEVICEINFO_RSP) || rsp.len() < 9 {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        /* Module type, firmware and a 4 byte device id. */
        Ok(hex::encode(&rsp[5..9]))
    }

    pub fn link_modes(&self) -> LinkModeSet {
        self.configured_modes
    }

    pub fn capabilities(&self) -> LinkModeSet {
        capabilities()
    }

    /// The im871a listens in a single radio mode at a time.
    pub async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), BusError> {
        let Some(first) = lms.modes().first().copied() else {
            return Ok(());
        };
        if lms.count() > 1 {
            debug!("(im871a) only one link mode at a time, using {first}");
        }
        let Some(mode) = radio_mode(first) else {
            return Err(BusError::UnsupportedLinkModes(self.alias.clone(), lms.hr()));
        };
        /* Field 2 of the first config block selects the radio mode,
           written non-permanently. */
        let body = [0u8, 2u8, mode, 0u8];
        let req = build_command(DEVMGMT_ID, DEVMGMT_MSG_SET_CONFIG_REQ, &body);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &req, Duration::from_millis(1500))
            .await?;
        if rsp.first() != Some(&DEVMGMT_MSG_SET_CONFIG_RSP) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        self.configured_modes = LinkModeSet::empty().with(first);
        Ok(())
    }

    pub async fn send_telegram(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        /* The module expects the frame without its length byte. */
        let payload = if bytes.len() > 1 { &bytes[1..] } else { bytes };
        let req = build_command(RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_REQ, payload);
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
    fn telegram_indication_gets_length_prepended() {
        let mut framer = Framer;
        /* ctrl 0 endpoint RADIOLINK, msg WMBUSMSG_IND, 3 byte payload. */
        let mut buffer = vec![0xa5, 0x02, 0x03, 0x03, 0x44, 0x2d, 0x2c];
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Telegram { bytes, .. } => assert_eq!(bytes, &vec![3, 0x44, 0x2d, 0x2c]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut framer = Framer;
        let mut buffer = vec![0x00, 0xff, 0xa5, 0x01, 0x02, 0x00];
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FrameEvent::Response { .. }));
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut framer = Framer;
        let mut buffer = vec![0xa5, 0x02, 0x03, 0x10, 0x44];
        assert!(framer.consume(&mut buffer).is_empty());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn rssi_trailer_is_decoded() {
        let mut framer = Framer;
        /* ctrl nibble 4 = rssi attached. */
        let mut buffer = vec![0xa5, 0x42, 0x03, 0x02, 0x11, 0x22, 120];
        let events = framer.consume(&mut buffer);
        match &events[0] {
            FrameEvent::Telegram { rssi_dbm, .. } => assert_eq!(*rssi_dbm, 120 / 2 - 130),
            other => panic!("unexpected {other:?}"),
        }
    }
}
