//! Transmit Engine
//!
//! A dedicated thread recomputes the Output layer every period and pushes it to the attached
//! transport. The loop runs with or without hardware so displays always see live values.
//! Write failures are logged, followed by an interruptible backoff, and the loop resumes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::artnet::ArtNetSender;
use crate::error::{Error, Result};
use crate::serial::SerialDmx;
use crate::universe::{DmxFrame, Universe};

/// An opened hardware handle. Dropping it releases the device.
#[derive(Debug)]
pub enum Transport {
    Serial(SerialDmx),
    ArtNet(ArtNetSender),
}

impl Transport {
    fn send(&mut self, frame: &DmxFrame) -> Result<()> {
        match self {
            Transport::Serial(dmx) => dmx.send(frame),
            Transport::ArtNet(sender) => sender.send(frame),
        }
    }

    fn state(&self) -> TransportState {
        match self {
            Transport::Serial(dmx) => TransportState::Serial {
                port: dmx.port_name().to_string(),
            },
            Transport::ArtNet(sender) => TransportState::Network {
                target: sender.target(),
                universe: sender.universe(),
            },
        }
    }
}

/// Which transport the engine is driving.
#[derive(Clone, Debug, Default, PartialEq, Eq, strum::Display)]
pub enum TransportState {
    #[default]
    #[strum(serialize = "Disconnected")]
    Disconnected,
    #[strum(serialize = "Serial {port}")]
    Serial { port: String },
    #[strum(serialize = "Art-Net {target} universe {universe}")]
    Network { target: SocketAddr, universe: u16 },
}

/// Shared view of the transmit loop.
#[derive(Clone, Debug, Default)]
pub struct TransmitStatus {
    pub state: TransportState,
    /// Last write succeeded
    pub connected: bool,
    /// Message of the most recent write failure, cleared by the next success
    pub last_error: Option<String>,
    pub frames_sent: u64,
    pub failures: u64,
}

enum Command {
    Attach(Transport),
    Detach,
}

pub struct TransmitEngine {
    thread_stopper: Sender<()>,
    commands: Sender<Command>,
    thread_handle: Option<JoinHandle<()>>,
    status: Arc<Mutex<TransmitStatus>>,
}

impl Drop for TransmitEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TransmitEngine {
    /// Spawns the transmit thread. It starts Disconnected.
    pub fn start(universe: Arc<Universe>, period: Duration, backoff: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = unbounded();
        let (cmd_tx, cmd_rx) = unbounded();
        let status = Arc::new(Mutex::new(TransmitStatus::default()));
        let worker_status = Arc::clone(&status);
        let handle = thread::Builder::new()
            .name("dmx-transmit".into())
            .spawn(move || {
                transmit_loop(universe, period, backoff, stop_rx, cmd_rx, worker_status)
            })?;
        info!(?period, "transmit engine started");
        Ok(Self {
            thread_stopper: stop_tx,
            commands: cmd_tx,
            thread_handle: Some(handle),
            status,
        })
    }

    /// Opens `port` on the calling thread and hands it to the loop.
    pub fn connect_serial(&self, port: &str) -> Result<()> {
        let dmx = SerialDmx::open(port)?;
        self.attach(Transport::Serial(dmx))
    }

    /// Resolves `host` and starts sending ArtDMX for `universe`.
    pub fn connect_network(&self, host: &str, universe: u16) -> Result<()> {
        let sender = ArtNetSender::connect(host, universe)?;
        self.attach(Transport::ArtNet(sender))
    }

    /// Replaces the current transport. The previous one is released by the loop.
    pub fn attach(&self, transport: Transport) -> Result<()> {
        let state = transport.state();
        self.commands
            .send(Command::Attach(transport))
            .map_err(|_| Error::NotRunning("transmit engine"))?;
        let mut status = self.status.lock();
        status.state = state;
        status.connected = false;
        status.last_error = None;
        Ok(())
    }

    /// Returns to Disconnected without waiting for the loop.
    pub fn disconnect(&self) {
        if self.commands.send(Command::Detach).is_err() {
            debug!("transmit loop already gone");
        }
        let mut status = self.status.lock();
        status.state = TransportState::Disconnected;
        status.connected = false;
    }

    pub fn status(&self) -> TransmitStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to exit. Returns immediately; the loop drops its transport on the way out.
    pub fn stop(&mut self) {
        if self.thread_handle.is_none() {
            return;
        }
        if self.thread_stopper.send(()).is_err() {
            debug!("transmit loop already stopped");
        }
        self.thread_handle = None;
    }

    /// Stops the loop and waits for it to release the hardware.
    pub fn shutdown(mut self) {
        let _ = self.thread_stopper.send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("transmit thread panicked");
            }
        }
    }
}

fn transmit_loop(
    universe: Arc<Universe>,
    period: Duration,
    backoff: Duration,
    thread_stop: Receiver<()>,
    commands: Receiver<Command>,
    status: Arc<Mutex<TransmitStatus>>,
) {
    let ticker = tick(period);
    let mut transport: Option<Transport> = None;
    'transmit: loop {
        select! {
            recv(thread_stop) -> _ => break 'transmit,
            recv(commands) -> cmd => match cmd {
                Ok(Command::Attach(next)) => {
                    info!(transport = %next.state(), "transport attached");
                    transport = Some(next);
                }
                Ok(Command::Detach) => {
                    if transport.take().is_some() {
                        info!("transport released");
                    }
                }
                Err(_) => break 'transmit,
            },
            recv(ticker) -> _ => {
                let frame = universe.recompute();
                let Some(active) = transport.as_mut() else {
                    continue 'transmit;
                };
                match active.send(&frame) {
                    Ok(()) => {
                        let mut s = status.lock();
                        s.connected = true;
                        s.last_error = None;
                        s.frames_sent += 1;
                    }
                    Err(e) => {
                        warn!(%e, ?backoff, "DMX write failed, backing off");
                        {
                            let mut s = status.lock();
                            s.connected = false;
                            s.last_error = Some(e.to_string());
                            s.failures += 1;
                        }
                        select! {
                            recv(thread_stop) -> _ => break 'transmit,
                            default(backoff) => {}
                        }
                    }
                }
            }
        }
    }
    drop(transport);
    info!("transmit engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::DmxLine;
    use crate::universe::Layer;
    use std::net::UdpSocket;
    use std::time::Instant;

    struct FailingLine;

    impl DmxLine for FailingLine {
        fn set_break(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::other("device unplugged"))
        }

        fn clear_break(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn write_frame(&mut self, _: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn recomputes_output_without_hardware() {
        let universe = Arc::new(Universe::new());
        let engine = TransmitEngine::start(
            universe.clone(),
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();
        universe.write(Layer::Scene, 4, 180).unwrap();
        assert!(wait_for(|| universe.level(Layer::Output, 4) == 180));
        assert_eq!(engine.status().state, TransportState::Disconnected);
        engine.shutdown();
    }

    #[test]
    fn streams_art_net_to_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let universe = Arc::new(Universe::new());
        universe.write(Layer::Live, 1, 77).unwrap();
        let engine = TransmitEngine::start(
            universe,
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();
        engine
            .connect_network(&receiver.local_addr().unwrap().to_string(), 0)
            .unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 530);
        assert_eq!(&buf[0..8], b"Art-Net\0");
        assert_eq!(buf[18], 77);
        assert!(wait_for(|| engine.status().connected));
        engine.shutdown();
    }

    #[test]
    fn write_failures_back_off_and_keep_the_loop_alive() {
        let universe = Arc::new(Universe::new());
        let engine = TransmitEngine::start(
            universe.clone(),
            Duration::from_millis(2),
            Duration::from_millis(5),
        )
        .unwrap();
        engine
            .attach(Transport::Serial(SerialDmx::with_line(
                "mock",
                Box::new(FailingLine),
            )))
            .unwrap();
        assert!(wait_for(|| engine.status().failures >= 2));
        let status = engine.status();
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("unplugged"));
        assert!(engine.is_running());

        engine.disconnect();
        assert_eq!(engine.status().state, TransportState::Disconnected);
        universe.write(Layer::Live, 9, 9).unwrap();
        assert!(wait_for(|| universe.level(Layer::Output, 9) == 9));
        engine.shutdown();
    }
}
