use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::{BusDeviceSpec, DeviceKind};
use crate::linkmode::{LinkMode, LinkModeSet};
use crate::telegram::{crc, AboutTelegram};

pub mod amb3665;
pub mod cul;
pub mod im871a;
pub mod iu880b;
pub mod rc1180;
pub mod rtlwmbus;
pub mod serial;
pub mod simulation;

pub use serial::SerialError;

/// A complete frame as delivered by some bus, with its metadata.
pub type InboundFrame = (AboutTelegram, Vec<u8>);

/// What a dongle framer extracted from the byte stream.
#[derive(Debug)]
pub enum FrameEvent {
    Telegram { bytes: Vec<u8>, rssi_dbm: i32 },
    /// A command response, first byte identifies the message.
    Response { payload: Vec<u8> },
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error("unexpected response from {0}")]
    UnexpectedResponse(String),
    #[error("bus {0} does not support link modes {1}")]
    UnsupportedLinkModes(String, String),
    #[error("could not start {0}: {1}")]
    SpawnFailed(String, String),
    #[error("unknown bus device type \"{0}\"")]
    UnknownDeviceType(String),
    #[error("no bus can send on {0}")]
    NoSuitableBus(String),
}

/// Wire framing wanted when transmitting a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramFormat {
    FrameA,
    FrameB,
}

/// Run one reader loop: accumulate chunks from the serial reader thread,
/// let the family framer slice them into events, and dispatch telegrams to
/// the decoder and responses to the command exchange. A two second silence
/// with a partial frame in the buffer clears it.
pub(crate) fn spawn_reader<F>(
    alias: String,
    mut bytes_rx: Receiver<Vec<u8>>,
    frame_tx: Sender<InboundFrame>,
    response_tx: Sender<Vec<u8>>,
    mut framer: F,
) where
    F: FnMut(&mut Vec<u8>) -> Vec<FrameEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(2), bytes_rx.recv()).await;
            match chunk {
                Ok(Some(bytes)) => buffer.extend_from_slice(&bytes),
                Ok(None) => {
                    debug!("({alias}) byte stream closed, reader exits");
                    return;
                }
                Err(_) => {
                    if !buffer.is_empty() {
                        debug!("({alias}) partial frame timed out, clearing {} bytes", buffer.len());
                        buffer.clear();
                    }
                    continue;
                }
            }
            for event in framer(&mut buffer) {
                match event {
                    FrameEvent::Telegram { bytes, rssi_dbm } => {
                        let about = AboutTelegram::new(&alias, rssi_dbm);
                        if frame_tx.send((about, bytes)).await.is_err() {
                            return;
                        }
                    }
                    FrameEvent::Response { payload } => {
                        let _ = response_tx.try_send(payload);
                    }
                }
            }
        }
    });
}

/// Strip link layer block crcs when they are present. Transports that
/// already removed them hand over frames this leaves untouched. A frame
/// whose size announces crc blocks but whose crcs do not verify is
/// discarded.
pub fn strip_any_link_crcs(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 12 {
        return Some(frame.to_vec());
    }
    let l = frame[0] as usize;
    if frame.len() == l + 1 {
        /* The length field covers the whole frame, no crcs in here. */
        return Some(frame.to_vec());
    }

    /* Frame format a: 10 byte first block plus 16 byte blocks, two crc
       bytes after each. */
    let blocks = 1 + (l + 1).saturating_sub(10).div_ceil(16);
    if frame.len() == l + 1 + 2 * blocks {
        return match crc::strip_frame_format_a(frame) {
            Ok(stripped) => Some(stripped),
            Err(e) => {
                warn!("link layer crc check failed ({e}), discarding frame");
                None
            }
        };
    }

    /* Frame format b keeps its crc inside the length count. */
    if let Ok(stripped) = crc::strip_frame_format_b(&frame[..(l + 1).min(frame.len())]) {
        return Some(stripped);
    }

    /* Some dongles append trailing bytes the length field does not cover,
       pass the frame on and let the decoder sort it out. */
    debug!("frame size {} does not match length field {l}, passing through", frame.len());
    Some(frame.to_vec())
}

/// All dongle families behind one face, per the one-of-few-variants shape
/// the rest of the code wants.
pub enum BusDevice {
    Im871a(im871a::Im871a),
    Iu880b(iu880b::Iu880b),
    Amb3665(amb3665::Amb3665),
    Rc1180(rc1180::Rc1180),
    Cul(cul::Cul),
    RtlWmbus(rtlwmbus::RtlWmbus),
    Simulation(simulation::Simulation),
}

impl BusDevice {
    pub fn alias(&self) -> &str {
        match self {
            BusDevice::Im871a(d) => &d.alias,
            BusDevice::Iu880b(d) => &d.alias,
            BusDevice::Amb3665(d) => &d.alias,
            BusDevice::Rc1180(d) => &d.alias,
            BusDevice::Cul(d) => &d.alias,
            BusDevice::RtlWmbus(d) => &d.alias,
            BusDevice::Simulation(d) => &d.alias,
        }
    }

    pub fn capabilities(&self) -> LinkModeSet {
        match self {
            BusDevice::Im871a(_) => im871a::capabilities(),
            BusDevice::Iu880b(_) => iu880b::capabilities(),
            BusDevice::Amb3665(_) => amb3665::capabilities(),
            BusDevice::Rc1180(_) => rc1180::capabilities(),
            BusDevice::Cul(_) => cul::capabilities(),
            BusDevice::RtlWmbus(_) => rtlwmbus::capabilities(),
            BusDevice::Simulation(_) => LinkModeSet::all(),
        }
    }

    pub async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), BusError> {
        match self {
            BusDevice::Im871a(d) => d.set_link_modes(lms).await,
            BusDevice::Iu880b(d) => d.set_link_modes(lms).await,
            BusDevice::Amb3665(d) => d.set_link_modes(lms).await,
            BusDevice::Rc1180(d) => d.set_link_modes(lms).await,
            BusDevice::Cul(d) => d.set_link_modes(lms).await,
            BusDevice::RtlWmbus(d) => d.set_link_modes(lms).await,
            BusDevice::Simulation(_) => Ok(()),
        }
    }

    pub async fn send_telegram(
        &mut self,
        _lm: LinkMode,
        _format: TelegramFormat,
        bytes: &[u8],
    ) -> Result<(), BusError> {
        match self {
            BusDevice::Im871a(d) => d.send_telegram(bytes).await,
            BusDevice::Iu880b(d) => d.send_telegram(bytes).await,
            BusDevice::Amb3665(d) => d.send_telegram(bytes).await,
            BusDevice::Rc1180(d) => d.send_telegram(bytes).await,
            BusDevice::Cul(d) => d.send_telegram(bytes).await,
            BusDevice::RtlWmbus(d) => Err(BusError::NoSuitableBus(d.alias.clone())),
            BusDevice::Simulation(d) => Err(BusError::NoSuitableBus(d.alias.clone())),
        }
    }

    /// Reset the dongle where the family supports it.
    pub async fn reset(&mut self) -> Result<(), BusError> {
        match self {
            BusDevice::Im871a(d) => d.reset().await,
            BusDevice::Iu880b(d) => d.reset().await,
            BusDevice::Amb3665(d) => d.reset().await,
            _ => Ok(()),
        }
    }

    pub fn is_closed(&mut self) -> bool {
        match self {
            BusDevice::Im871a(d) => d.is_closed(),
            BusDevice::Iu880b(d) => d.is_closed(),
            BusDevice::Amb3665(d) => d.is_closed(),
            BusDevice::Rc1180(d) => d.is_closed(),
            BusDevice::Cul(d) => d.is_closed(),
            BusDevice::RtlWmbus(d) => d.is_closed(),
            BusDevice::Simulation(d) => d.is_closed(),
        }
    }

    pub async fn close(&mut self) {
        match self {
            BusDevice::Im871a(d) => d.close(),
            BusDevice::Iu880b(d) => d.close(),
            BusDevice::Amb3665(d) => d.close(),
            BusDevice::Rc1180(d) => d.close(),
            BusDevice::Cul(d) => d.close(),
            BusDevice::RtlWmbus(d) => d.close().await,
            BusDevice::Simulation(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectScope {
    /// Only stdin, files and simulations, no hardware probing.
    SimulationsOnly,
    All,
}

/// An outbound telegram waiting for a suitable bus.
#[derive(Debug, Clone)]
pub struct SendEntry {
    pub bus_alias: String,
    pub link_mode: LinkMode,
    pub format: TelegramFormat,
    pub bytes: Vec<u8>,
}

/// Opens and maintains the dongles, routes outbound sends and rediscovers
/// hot-plugged devices on the regular checkup.
pub struct BusManager {
    frame_tx: Sender<InboundFrame>,
    buses: Vec<BusDevice>,
    specs: Vec<BusDeviceSpec>,
    send_queue: VecDeque<SendEntry>,
    wanted_modes: LinkModeSet,
    /// Device paths that must never be probed, or "all".
    pub donotprobe: Vec<String>,
    /// Reset every dongle at this interval when set.
    pub resetafter: Option<Duration>,
    last_reset: std::time::Instant,
}

impl BusManager {
    pub fn new(frame_tx: Sender<InboundFrame>) -> BusManager {
        BusManager {
            frame_tx,
            buses: Vec::new(),
            specs: Vec::new(),
            send_queue: VecDeque::new(),
            wanted_modes: LinkModeSet::empty(),
            donotprobe: Vec::new(),
            resetafter: None,
            last_reset: std::time::Instant::now(),
        }
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// Open every configured device that fits the scope and push the union
    /// of the meters' wanted link modes to all of them.
    pub async fn detect_and_configure(
        &mut self,
        specs: &[BusDeviceSpec],
        wanted_modes: LinkModeSet,
        scope: DetectScope,
    ) {
        self.specs = specs.to_vec();
        self.wanted_modes = wanted_modes;
        self.open_specs(&specs.to_vec(), scope).await;
    }

    async fn open_specs(&mut self, specs: &[BusDeviceSpec], scope: DetectScope) {
        for spec in specs.to_vec() {
            let simulationish = matches!(
                spec.kind,
                DeviceKind::Stdin | DeviceKind::File | DeviceKind::Simulation
            );
            if scope == DetectScope::SimulationsOnly && !simulationish {
                continue;
            }
            if self.buses.iter().any(|b| b.alias() == spec.alias) {
                continue;
            }
            match self.open_device(&spec).await {
                Ok(Some(mut bus)) => {
                    if !self.wanted_modes.is_empty() {
                        let usable = bus.capabilities();
                        let to_set = if usable.covers(self.wanted_modes) {
                            self.wanted_modes
                        } else {
                            debug!(
                                "({}) cannot cover {}, setting what it can",
                                bus.alias(),
                                self.wanted_modes.hr()
                            );
                            let mut subset = LinkModeSet::empty();
                            for m in self.wanted_modes.modes() {
                                if usable.has(m) {
                                    subset.add(m);
                                }
                            }
                            subset
                        };
                        if let Err(e) = bus.set_link_modes(to_set).await {
                            warn!("({}) could not set link modes: {e}", bus.alias());
                        }
                    }
                    info!("bus {} ready, listening to {}", bus.alias(), bus.capabilities().hr());
                    self.buses.push(bus);
                }
                Ok(None) => {}
                Err(e) => warn!("could not open {}: {e}", spec.device),
            }
        }
    }

    async fn open_device(&mut self, spec: &BusDeviceSpec) -> Result<Option<BusDevice>, BusError> {
        let alias = &spec.alias;
        let tx = self.frame_tx.clone();
        let bus = match spec.kind {
            DeviceKind::Im871a => {
                BusDevice::Im871a(im871a::Im871a::open(alias, &spec.device, tx).await?)
            }
            DeviceKind::Iu880b | DeviceKind::Iu891a => {
                BusDevice::Iu880b(iu880b::Iu880b::open(alias, &spec.device, tx).await?)
            }
            DeviceKind::Amb3665 => {
                BusDevice::Amb3665(amb3665::Amb3665::open(alias, &spec.device, tx).await?)
            }
            DeviceKind::Rc1180 => BusDevice::Rc1180(
                rc1180::Rc1180::open(alias, &spec.device, spec.fq.as_deref(), tx).await?,
            ),
            DeviceKind::Cul => BusDevice::Cul(cul::Cul::open(alias, &spec.device, tx).await?),
            DeviceKind::RtlWmbus | DeviceKind::Rtl433 => {
                let mut d = rtlwmbus::RtlWmbus::new(alias, &spec.command_line(), tx);
                d.start().await?;
                BusDevice::RtlWmbus(d)
            }
            DeviceKind::Stdin => {
                let sim = simulation::Simulation::new(alias, None, tx);
                sim.start();
                BusDevice::Simulation(sim)
            }
            DeviceKind::File | DeviceKind::Simulation => {
                let sim = simulation::Simulation::new(alias, Some(&spec.device), tx);
                sim.start();
                BusDevice::Simulation(sim)
            }
            DeviceKind::Auto => {
                debug!("probing for a dongle on {} is bounded to known families", spec.device);
                return self.probe(spec).await;
            }
        };
        Ok(Some(bus))
    }

    /// Bounded probe: try the most common families in turn with a short
    /// query each; whatever answers sensibly wins.
    async fn probe(&mut self, spec: &BusDeviceSpec) -> Result<Option<BusDevice>, BusError> {
        if self
            .donotprobe
            .iter()
            .any(|p| p == "all" || *p == spec.device)
        {
            debug!("not probing {}, listed in donotprobe", spec.device);
            return Ok(None);
        }
        let tx = self.frame_tx.clone();
        if let Ok(mut d) = im871a::Im871a::open(&spec.alias, &spec.device, tx.clone()).await {
            if d.ping().await.is_ok() {
                return Ok(Some(BusDevice::Im871a(d)));
            }
            d.close();
        }
        if let Ok(mut d) = iu880b::Iu880b::open(&spec.alias, &spec.device, tx.clone()).await {
            if d.ping().await.is_ok() {
                return Ok(Some(BusDevice::Iu880b(d)));
            }
            d.close();
        }
        if let Ok(mut d) = amb3665::Amb3665::open(&spec.alias, &spec.device, tx.clone()).await {
            if d.get_device_id().await.is_ok() {
                return Ok(Some(BusDevice::Amb3665(d)));
            }
            d.close();
        }
        if let Ok(mut d) = cul::Cul::open(&spec.alias, &spec.device, tx).await {
            if d.get_device_id().await.is_ok() {
                return Ok(Some(BusDevice::Cul(d)));
            }
            d.close();
        }
        warn!("no known dongle responded on {}", spec.device);
        Ok(None)
    }

    /// Driven by an external two second timer: drop lost buses, reopen
    /// missing ones, flush the send queue.
    pub async fn regular_checkup(&mut self) {
        let mut lost = Vec::new();
        self.buses.retain_mut(|b| {
            if b.is_closed() {
                lost.push(b.alias().to_string());
                false
            } else {
                true
            }
        });
        for alias in lost {
            warn!("bus {alias} is down, removed from the routing set");
        }

        let missing: Vec<BusDeviceSpec> = self
            .specs
            .iter()
            .filter(|s| {
                !matches!(s.kind, DeviceKind::Stdin | DeviceKind::File | DeviceKind::Simulation)
                    && !self.buses.iter().any(|b| b.alias() == s.alias)
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.open_specs(&missing, DetectScope::All).await;
        }

        if let Some(interval) = self.resetafter {
            if self.last_reset.elapsed() >= interval {
                for bus in self.buses.iter_mut() {
                    if let Err(e) = bus.reset().await {
                        debug!("({}) periodic reset failed: {e}", bus.alias());
                    }
                }
                self.last_reset = std::time::Instant::now();
            }
        }

        self.flush_send_queue().await;
    }

    pub fn queue_send(&mut self, entry: SendEntry) {
        self.send_queue.push_back(entry);
    }

    /// Deliver each entry to the first bus whose alias matches and which
    /// supports the required link mode. Unsent entries stay queued.
    pub async fn flush_send_queue(&mut self) {
        let mut still_queued = VecDeque::new();
        while let Some(entry) = self.send_queue.pop_front() {
            let mut sent = false;
            for bus in self.buses.iter_mut() {
                let alias_ok = entry.bus_alias.is_empty() || bus.alias() == entry.bus_alias;
                if !alias_ok || !bus.capabilities().has(entry.link_mode) {
                    continue;
                }
                match bus.send_telegram(entry.link_mode, entry.format, &entry.bytes).await {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(e) => debug!("({}) send failed: {e}", bus.alias()),
                }
            }
            if !sent {
                still_queued.push_back(entry);
            }
        }
        self.send_queue = still_queued;
    }

    pub async fn close_all(&mut self) {
        for bus in self.buses.iter_mut() {
            bus.close().await;
        }
        self.buses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::crc::insert_frame_format_a;

    #[test]
    fn crc_stripping_is_transparent_for_clean_frames() {
        let frame = hex::decode(
            "1944304C72242421D401A2013D4013DD8B46A4999C1293E582CC",
        )
        .unwrap();
        assert_eq!(strip_any_link_crcs(&frame).unwrap(), frame);
    }

    #[test]
    fn format_a_crcs_are_removed() {
        /* The OMS Annex N sample telegram as transported on the radio. */
        let payload = hex::decode(
            "2E4493157856341233037A2A0020255923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3",
        )
        .unwrap();
        let on_air = insert_frame_format_a(&payload);
        assert_eq!(strip_any_link_crcs(&on_air).unwrap(), payload);
    }

    #[test]
    fn corrupted_crcs_discard_without_panicking() {
        let payload = hex::decode(
            "2E4493157856341233037A2A0020255923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3",
        )
        .unwrap();
        let mut on_air = insert_frame_format_a(&payload);
        on_air[11] ^= 0x01;
        assert!(strip_any_link_crcs(&on_air).is_none());
    }
}
