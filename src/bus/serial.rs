use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::termios::{self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg};
use thiserror::Error;
use tokio::sync::mpsc::{channel, Receiver, Sender};

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("cannot open serial device {0}: {1}")]
    Open(String, std::io::Error),
    #[error("cannot configure serial device {0}: {1}")]
    Configure(String, nix::Error),
    #[error("unsupported baud rate {0}")]
    BadBaudRate(u32),
    #[error("serial device {0} is closed")]
    Closed(String),
    #[error("command on {0} timed out")]
    Timeout(String),
    #[error("write to {0} failed: {1}")]
    Write(String, std::io::Error),
}

fn baud(rate: u32) -> Result<BaudRate, SerialError> {
    match rate {
        2400 => Ok(BaudRate::B2400),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(SerialError::BadBaudRate(other)),
    }
}

/// A raw 8N1 tty plus a reader thread that pushes byte chunks into a
/// channel. Closing unblocks pending reads through the closed flag, the
/// reader exits on the flag or on eof.
pub struct SerialPort {
    pub path: String,
    file: File,
    closed: Arc<AtomicBool>,
}

impl SerialPort {
    /// Open and configure the tty, and start the reader thread. Returned
    /// alongside is the channel the reader fills.
    pub fn open(path: &str, baud_rate: u32) -> Result<(SerialPort, Receiver<Vec<u8>>), SerialError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SerialError::Open(path.to_string(), e))?;

        let mut tio =
            termios::tcgetattr(&file).map_err(|e| SerialError::Configure(path.to_string(), e))?;

        /* Raw mode, 8N1, no flow control. */
        tio.input_flags &= !(InputFlags::IXON
            | InputFlags::IXOFF
            | InputFlags::ICRNL
            | InputFlags::IGNCR
            | InputFlags::INLCR
            | InputFlags::ISTRIP
            | InputFlags::PARMRK);
        tio.output_flags &= !OutputFlags::OPOST;
        tio.local_flags &= !(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG | LocalFlags::IEXTEN);
        tio.control_flags &= !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CRTSCTS);
        tio.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
        /* Block for at most 100 ms per read so the close flag is honoured. */
        tio.control_chars[termios::SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[termios::SpecialCharacterIndices::VTIME as usize] = 1;

        let rate = baud(baud_rate)?;
        termios::cfsetispeed(&mut tio, rate).map_err(|e| SerialError::Configure(path.to_string(), e))?;
        termios::cfsetospeed(&mut tio, rate).map_err(|e| SerialError::Configure(path.to_string(), e))?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &tio)
            .map_err(|e| SerialError::Configure(path.to_string(), e))?;
        termios::tcflush(&file, termios::FlushArg::TCIOFLUSH)
            .map_err(|e| SerialError::Configure(path.to_string(), e))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel(64);

        let mut reader = file.try_clone().map_err(|e| SerialError::Open(path.to_string(), e))?;
        let reader_path = path.to_string();
        let reader_closed = closed.clone();
        std::thread::spawn(move || reader_loop(&mut reader, reader_path, reader_closed, tx));

        Ok((
            SerialPort { path: path.to_string(), file, closed },
            rx,
        ))
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SerialError::Closed(self.path.clone()));
        }
        debug!("({}) -> {}", self.path, hex::encode(bytes));
        self.file
            .write_all(bytes)
            .map_err(|e| SerialError::Write(self.path.clone(), e))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn reader_loop(file: &mut File, path: String, closed: Arc<AtomicBool>, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        if closed.load(Ordering::SeqCst) {
            debug!("({path}) reader stopping, device closed");
            return;
        }
        match file.read(&mut buf) {
            Ok(0) => {
                /* VTIME expired with no data, just poll the close flag. */
                continue;
            }
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("({path}) read failed, marking device lost: {e}");
                closed.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// A command/response exchange helper shared by the dongle families: at
/// most one outstanding request per bus, responses matched by the reader
/// task, timeouts leave the bus usable.
pub struct CommandExchange {
    lock: tokio::sync::Mutex<()>,
    response_rx: tokio::sync::Mutex<Receiver<Vec<u8>>>,
    response_tx: Sender<Vec<u8>>,
}

impl CommandExchange {
    pub fn new() -> CommandExchange {
        let (response_tx, response_rx) = channel(8);
        CommandExchange {
            lock: tokio::sync::Mutex::new(()),
            response_rx: tokio::sync::Mutex::new(response_rx),
            response_tx,
        }
    }

    /// Handed to the reader task so it can post matched responses.
    pub fn response_sender(&self) -> Sender<Vec<u8>> {
        self.response_tx.clone()
    }

    /// Like send_and_wait, but retries a few times with a short pause.
    /// Used for the first command after opening a device, which some
    /// dongles swallow while they wake up.
    pub async fn send_and_wait_retrying(
        &self,
        port: &mut SerialPort,
        request: &[u8],
        timeout: Duration,
        retries: usize,
    ) -> Result<Vec<u8>, SerialError> {
        let mut last = SerialError::Timeout(port.path.clone());
        for _ in 0..retries.max(1) {
            match self.send_and_wait(port, request, timeout).await {
                Ok(r) => return Ok(r),
                Err(e) => last = e,
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(last)
    }

    /// Send a request and wait for the response the reader posts, or time
    /// out and leave the exchange usable for the next command.
    pub async fn send_and_wait(
        &self,
        port: &mut SerialPort,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, SerialError> {
        let _guard = self.lock.lock().await;
        let mut rx = self.response_rx.lock().await;
        /* Drop stale responses from an earlier timed out command. */
        while rx.try_recv().is_ok() {}
        port.send(request)?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(SerialError::Closed(port.path.clone())),
            Err(_) => {
                debug!("({}) command timed out", port.path);
                Err(SerialError::Timeout(port.path.clone()))
            }
        }
    }
}

impl Default for CommandExchange {
    fn default() -> Self {
        CommandExchange::new()
    }
}
