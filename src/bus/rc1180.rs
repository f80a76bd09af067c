use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::Sender;

use super::serial::{CommandExchange, SerialPort};
use super::{spawn_reader, BusError, FrameEvent, InboundFrame};
use crate::linkmode::{LinkMode, LinkModeSet};
use crate::telegram::is_valid_c_field;

/// The full configuration memory dump is 256 bytes plus the '>' prompt.
pub const CONFIG_DUMP_LEN: usize = 257;
pub const PROMPT: u8 = b'>';

pub fn capabilities() -> LinkModeSet {
    LinkModeSet::empty().with(LinkMode::T1).with(LinkMode::T2)
}

pub fn rssi_to_dbm(raw: u8) -> i32 {
    let raw = raw as i32;
    if raw >= 128 {
        (raw - 256) / 2 - 74
    } else {
        raw / 2 - 74
    }
}

/// Radiocrafts RC1180 configuration block, 256 bytes of registers
/// terminated by the prompt.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub id: u32,
    pub mfct: u16,
    pub media: u8,
    pub version: u8,
    pub rssi_mode: u8,
    pub uart_baud_rate: u8,
    pub data_interface: u8,
    pub uart_flow_ctrl: u8,
}

impl Config {
    pub fn decode(bytes: &[u8]) -> Option<Config> {
        if bytes.len() != CONFIG_DUMP_LEN {
            return None;
        }
        Some(Config {
            /* Radio address registers at the start of the memory. */
            id: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            mfct: u16::from_le_bytes([bytes[0x19], bytes[0x1a]]),
            media: bytes[0x1d],
            version: bytes[0x1e],
            rssi_mode: bytes[5],
            uart_baud_rate: bytes[0x30],
            data_interface: bytes[0x35],
            uart_flow_ctrl: bytes[0x34],
        })
    }

    pub fn appends_rssi(&self) -> bool {
        self.rssi_mode == 1
    }

    pub fn dongle_id(&self) -> String {
        format!("{:08x}", self.id)
    }
}

/// Baud rate register values, 5 means the factory default 19200.
pub fn baud_register(baud: u32) -> Option<u8> {
    match baud {
        2400 => Some(2),
        4800 => Some(3),
        9600 => Some(4),
        19200 => Some(5),
        38400 => Some(6),
        57600 => Some(7),
        115200 => Some(8),
        _ => None,
    }
}

/// Parse a baud override, silently falling back to 19200 on bad input.
pub fn configured_baud_rate(fq: Option<&str>) -> u32 {
    match fq {
        None => 19200,
        Some(s) => match s.parse::<u32>() {
            Ok(b) if baud_register(b).is_some() => b,
            _ => {
                warn!("(rc1180) unable to use baud rate \"{}\", using default 19200", fq.unwrap_or(""));
                19200
            }
        },
    }
}

/// In data mode the module emits raw frames, one length byte ahead,
/// optionally post-fixed with an rssi byte.
pub struct Framer {
    pub rssi_expected: bool,
    /// Collecting a 257 byte config dump after a '0' command. Shared with
    /// the command side which flips it before requesting the dump.
    pub expecting_config_dump: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Framer {
    pub fn consume(&mut self, buffer: &mut Vec<u8>) -> Vec<FrameEvent> {
        use std::sync::atomic::Ordering;
        let mut events = Vec::new();
        loop {
            if self.expecting_config_dump.load(Ordering::SeqCst) {
                if buffer.len() < CONFIG_DUMP_LEN {
                    break;
                }
                if buffer[CONFIG_DUMP_LEN - 1] != PROMPT {
                    debug!("(rc1180) config dump not terminated by the prompt");
                }
                let dump = buffer[..CONFIG_DUMP_LEN].to_vec();
                buffer.drain(..CONFIG_DUMP_LEN);
                self.expecting_config_dump.store(false, Ordering::SeqCst);
                events.push(FrameEvent::Response { payload: dump });
                continue;
            }
            if buffer.is_empty() {
                break;
            }
            if buffer[0] == PROMPT {
                /* Prompt after entering command mode or a register write. */
                buffer.remove(0);
                events.push(FrameEvent::Response { payload: vec![PROMPT] });
                continue;
            }
            if buffer.len() < 2 {
                break;
            }
            if (buffer[0] as usize) < 10 || !is_valid_c_field(buffer[1]) {
                /* Garbage before a frame, resync byte by byte. */
                buffer.remove(0);
                continue;
            }
            let payload_len = buffer[0] as usize;
            let rssi_len = if self.rssi_expected { 1 } else { 0 };
            let frame_length = 1 + payload_len + rssi_len;
            if buffer.len() < frame_length {
                break;
            }
            let rssi_dbm = if rssi_len == 1 {
                rssi_to_dbm(buffer[frame_length - 1])
            } else {
                0
            };
            let frame = buffer[..1 + payload_len].to_vec();
            buffer.drain(..frame_length);
            events.push(FrameEvent::Telegram { bytes: frame, rssi_dbm });
        }
        events
    }
}

pub struct Rc1180 {
    pub alias: String,
    port: SerialPort,
    exchange: Arc<CommandExchange>,
    configured_modes: LinkModeSet,
    dump_flag: Arc<std::sync::atomic::AtomicBool>,
    pub device_config: Config,
}

impl Rc1180 {
    pub async fn open(
        alias: &str,
        path: &str,
        baud_override: Option<&str>,
        frame_tx: Sender<InboundFrame>,
    ) -> Result<Rc1180, BusError> {
        let baud = configured_baud_rate(baud_override);
        let (port, bytes_rx) = SerialPort::open(path, baud)?;
        let exchange = Arc::new(CommandExchange::new());
        let dump_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut framer = Framer { rssi_expected: true, expecting_config_dump: dump_flag.clone() };
        spawn_reader(
            alias.to_string(),
            bytes_rx,
            frame_tx,
            exchange.response_sender(),
            move |buf| framer.consume(buf),
        );
        Ok(Rc1180 {
            alias: alias.to_string(),
            port,
            exchange,
            configured_modes: LinkModeSet::empty().with(LinkMode::T1),
            dump_flag,
            device_config: Config::default(),
        })
    }

    /// Enter command mode with a zero byte and wait for the prompt.
    async fn enter_command_mode(&mut self) -> Result<(), BusError> {
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &[0x00], Duration::from_millis(300))
            .await?;
        if rsp.first() != Some(&PROMPT) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        Ok(())
    }

    fn exit_command_mode(&mut self) -> Result<(), BusError> {
        self.port.send(b"X")?;
        Ok(())
    }

    /// Read the whole 257 byte configuration memory with the '0' command.
    pub async fn read_config(&mut self) -> Result<Config, BusError> {
        self.enter_command_mode().await?;
        /* Tell the reader to collect a fixed size block now. */
        self.dump_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, b"0", Duration::from_millis(800))
            .await?;
        let config = Config::decode(&rsp).ok_or_else(|| BusError::UnexpectedResponse(self.alias.clone()))?;
        self.exit_command_mode()?;
        self.device_config = config.clone();
        Ok(config)
    }

    /// Volatile register write: 'M', register, value.
    pub async fn write_register(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        self.enter_command_mode().await?;
        let rsp = self
            .exchange
            .send_and_wait(&mut self.port, &[b'M', register, value], Duration::from_millis(300))
            .await?;
        if rsp.first() != Some(&PROMPT) {
            return Err(BusError::UnexpectedResponse(self.alias.clone()));
        }
        self.exit_command_mode()
    }

    /// Make sure the module appends the rssi byte to every telegram.
    pub async fn enable_rssi(&mut self) -> Result<(), BusError> {
        if self.device_config.appends_rssi() {
            return Ok(());
        }
        self.write_register(0x05, 1).await
    }

    pub async fn get_device_id(&mut self) -> Result<String, BusError> {
        if self.device_config.id == 0 {
            self.read_config().await?;
        }
        Ok(self.device_config.dongle_id())
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
        /* The rc1180 is t-mode only and always listening, nothing to do. */
        self.configured_modes = lms;
        Ok(())
    }

    pub async fn send_telegram(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        /* Data mode passes raw frames straight through. */
        self.port.send(bytes)?;
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
    fn baud_fallback_is_19200() {
        assert_eq!(configured_baud_rate(None), 19200);
        assert_eq!(configured_baud_rate(Some("38400")), 38400);
        assert_eq!(configured_baud_rate(Some("junk")), 19200);
        assert_eq!(configured_baud_rate(Some("1234")), 19200);
    }

    #[test]
    fn config_dump_is_collected_as_one_response() {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let mut framer = Framer { rssi_expected: true, expecting_config_dump: flag };
        let mut dump = vec![0u8; CONFIG_DUMP_LEN];
        dump[CONFIG_DUMP_LEN - 1] = PROMPT;
        dump[1] = 0x78;
        dump[5] = 1;
        let mut buffer = dump.clone();
        let events = framer.consume(&mut buffer);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Response { payload } => {
                let c = Config::decode(payload).unwrap();
                assert!(c.appends_rssi());
                assert_eq!(c.id & 0xff, 0x78);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn telegram_with_rssi_byte() {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut framer = Framer { rssi_expected: true, expecting_config_dump: flag };
        let mut buffer = vec![0x0a, 0x44, 0x2d, 0x2c, 0x36, 0x36, 0x36, 0x36, 0x35, 0x04, 0x8d, 40];
        let events = framer.consume(&mut buffer);
        match &events[0] {
            FrameEvent::Telegram { bytes, rssi_dbm } => {
                assert_eq!(bytes.len(), 11);
                assert_eq!(*rssi_dbm, 40 / 2 - 74);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
