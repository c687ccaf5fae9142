//! # Dispatch Engine
//!
//! The gateway wires the durable message store to the per-device modem
//! drivers:
//!
//! - a **dispatcher** task drains the immediate `send` channel and the
//!   loader-fed `queue`, forwarding each message to a uniformly random device;
//! - one **device worker** task per modem serializes all AT access, handling
//!   outbound sends and inbound polls over a single `select` loop;
//! - a **loader** task replenishes the queue from storage whenever it drops
//!   below the low-water mark, woken by enqueue pressure or a long fallback
//!   timer;
//! - a **poll ticker** fans an inbound-poll signal out to every device every
//!   ten seconds.
//!
//! Delivery is at-least-once: a crash between queue pop and status update
//! re-loads the message on the next start. Within one device messages are
//! processed in forwarding order; across devices no ordering is promised.
//!
//! [`Gateway::send_message`] persists and pushes for near-realtime delivery;
//! [`Gateway::enqueue_message`] only raises loader pressure and is the one
//! path retries take, so a message can never sit in the queue twice.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::config::{Config, GatewayConfig};
use crate::modem::{ModemDriver, SendOutcome};
use crate::notify::{Notifier, NullNotifier, SmtpNotifier};
use crate::storage::{
    IncomingMessage, MessageStatus, OutgoingMessage, Storage, StorageError, MAX_RETRIES,
};

/// Cadence of the inbound poll fan-out.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Ceiling on forwarding into a device channel. A modem that stalls past this
/// long has its message routed back through the loader instead of wedging the
/// dispatcher behind one device.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatch engine tuning, decoupled from the config file units.
#[derive(Debug, Clone)]
pub struct DispatchTuning {
    pub buffer_max_size: usize,
    pub buffer_low_count: usize,
    pub loader_timeout: Duration,
    pub loader_countout: u64,
    pub loader_long_timeout: Duration,
}

impl From<&GatewayConfig> for DispatchTuning {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            buffer_max_size: cfg.buffer_max_size,
            buffer_low_count: cfg.buffer_low_count,
            loader_timeout: Duration::from_secs(cfg.loader_timeout_minutes * 60),
            loader_countout: cfg.loader_countout,
            loader_long_timeout: Duration::from_secs(cfg.loader_long_timeout_minutes * 60),
        }
    }
}

/// Rate limiter for loader wakeups. Enqueue traffic accumulates here and only
/// crosses into an actual wakeup signal when the count or quiet-time threshold
/// trips. Both scalars live under one lock because they are always read and
/// reset together.
struct LoaderGate {
    wakeup_tx: mpsc::Sender<()>,
    countout: u64,
    quiet_timeout: Duration,
    pressure: Mutex<Pressure>,
}

struct Pressure {
    messages_since_wakeup: u64,
    last_wakeup: Option<Instant>,
}

impl LoaderGate {
    fn new(countout: u64, quiet_timeout: Duration, wakeup_tx: mpsc::Sender<()>) -> Self {
        Self {
            wakeup_tx,
            countout,
            quiet_timeout,
            // None = never woken, so a cold start trips immediately
            pressure: Mutex::new(Pressure {
                messages_since_wakeup: 0,
                last_wakeup: None,
            }),
        }
    }

    fn note_enqueued(&self, uuid: &str) {
        let mut pressure = self.pressure.lock().expect("pressure mutex poisoned");
        pressure.messages_since_wakeup += 1;
        let quiet_too_long = match pressure.last_wakeup {
            Some(at) => at.elapsed() > self.quiet_timeout,
            None => true,
        };
        if pressure.messages_since_wakeup > self.countout || quiet_too_long {
            debug!("enqueue {}: waking message loader", uuid);
            // A pending wakeup coalesces with this one.
            let _ = self.wakeup_tx.try_send(());
            pressure.messages_since_wakeup = 0;
            pressure.last_wakeup = Some(Instant::now());
        } else {
            debug!(
                "enqueue {}: {} queued since last wakeup",
                uuid, pressure.messages_since_wakeup
            );
        }
    }
}

/// Dispatcher-side handle to one device worker.
struct DeviceHandle {
    id: String,
    send_tx: mpsc::Sender<OutgoingMessage>,
    poll_tx: mpsc::Sender<()>,
}

/// Public handle to a running dispatch engine.
pub struct Gateway {
    store: Storage,
    send_tx: mpsc::Sender<OutgoingMessage>,
    gate: Arc<LoaderGate>,
}

impl Gateway {
    /// Open storage, connect every configured modem, and start the engine.
    /// A device that fails to connect aborts startup.
    pub async fn start(config: &Config) -> Result<Gateway> {
        let store = Storage::open(Path::new(&config.storage.db_path)).await?;

        let mut drivers = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let mut driver = ModemDriver::new(&device.port, device.baud, &device.id);
            driver
                .connect()
                .await
                .with_context(|| format!("connecting device {}", device.id))?;
            drivers.push(driver);
        }

        let notifier: Arc<dyn Notifier> = if config.smtp.enabled {
            Arc::new(SmtpNotifier::new(config.smtp.clone()))
        } else {
            Arc::new(NullNotifier)
        };

        Ok(Self::spawn(
            DispatchTuning::from(&config.gateway),
            store,
            drivers,
            notifier,
        ))
    }

    /// Wire the engine around already-connected drivers. `start` uses this
    /// after opening serial ports; tests use it with scripted links.
    pub fn spawn(
        tuning: DispatchTuning,
        store: Storage,
        drivers: Vec<ModemDriver>,
        notifier: Arc<dyn Notifier>,
    ) -> Gateway {
        assert!(!drivers.is_empty(), "dispatch engine needs at least one device");

        let (send_tx, send_rx) = mpsc::channel(tuning.buffer_max_size);
        let (queue_tx, queue_rx) = mpsc::channel(tuning.buffer_max_size);
        let (poll_tx, poll_rx) = mpsc::channel(1);
        let (wakeup_tx, wakeup_rx) = mpsc::channel(1);

        let gate = Arc::new(LoaderGate::new(
            tuning.loader_countout,
            tuning.loader_timeout,
            wakeup_tx.clone(),
        ));
        // Cold start: run the loader once right away so rows left over from a
        // previous run get picked up without waiting for traffic.
        let _ = wakeup_tx.try_send(());

        let mut devices = Vec::with_capacity(drivers.len());
        for driver in drivers {
            let (dev_send_tx, dev_send_rx) = mpsc::channel(tuning.buffer_max_size);
            let (dev_poll_tx, dev_poll_rx) = mpsc::channel(1);
            devices.push(DeviceHandle {
                id: driver.device_id().to_string(),
                send_tx: dev_send_tx,
                poll_tx: dev_poll_tx,
            });
            let worker = DeviceWorker {
                driver,
                store: store.clone(),
                notifier: Arc::clone(&notifier),
                gate: Arc::clone(&gate),
            };
            tokio::spawn(worker.run(dev_send_rx, dev_poll_rx));
        }
        info!("dispatch engine started with {} device(s)", devices.len());

        tokio::spawn(dispatch_loop(
            send_rx,
            queue_rx,
            poll_rx,
            devices,
            Arc::clone(&gate),
        ));
        tokio::spawn(loader_loop(
            store.clone(),
            queue_tx,
            wakeup_rx,
            tuning.clone(),
        ));
        tokio::spawn(poll_ticker(poll_tx));

        Gateway {
            store,
            send_tx,
            gate,
        }
    }

    /// Persist a new message and push it for immediate dispatch. Persistence
    /// failure (including a duplicate uuid) returns the error to the caller
    /// and nothing is sent. An empty `uuid` gets a generated one.
    pub async fn send_message(
        &self,
        uuid: &str,
        mobile: &str,
        body: &str,
    ) -> Result<OutgoingMessage, StorageError> {
        let uuid = if uuid.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            uuid.to_string()
        };
        info!("send_message {} -> {}", uuid, mobile);

        let message = self.store.insert_outgoing(&uuid, mobile, body).await?;
        let _ = self.send_tx.send(message.clone()).await;
        Ok(message)
    }

    /// Mark an already-persisted message for background delivery. This only
    /// raises loader pressure; the loader is the sole producer for the queue,
    /// which keeps any uuid from appearing there twice.
    pub fn enqueue_message(&self, message: &OutgoingMessage) {
        self.gate.note_enqueued(&message.uuid);
    }

    /// Direct access to the message store, for reporting callers.
    pub fn store(&self) -> &Storage {
        &self.store
    }
}

/// Single task multiplexing immediate sends, queued messages, and poll
/// signals. Device selection is uniformly random so load spreads across
/// modems; the RNG is the thread-local generator, seeded once.
async fn dispatch_loop(
    mut send_rx: mpsc::Receiver<OutgoingMessage>,
    mut queue_rx: mpsc::Receiver<OutgoingMessage>,
    mut poll_rx: mpsc::Receiver<()>,
    devices: Vec<DeviceHandle>,
    gate: Arc<LoaderGate>,
) {
    loop {
        tokio::select! {
            Some(message) = send_rx.recv() => forward(&devices, message, &gate).await,
            Some(message) = queue_rx.recv() => forward(&devices, message, &gate).await,
            Some(()) = poll_rx.recv() => {
                for device in &devices {
                    // Capacity 1: an unconsumed poll coalesces with this one.
                    let _ = device.poll_tx.try_send(());
                }
            }
            else => break,
        }
    }
    debug!("dispatcher terminated");
}

async fn forward(devices: &[DeviceHandle], message: OutgoingMessage, gate: &LoaderGate) {
    let n = rand::thread_rng().gen_range(0..devices.len());
    let device = &devices[n];
    let uuid = message.uuid.clone();
    match timeout(FORWARD_TIMEOUT, device.send_tx.send(message)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            warn!(
                "device {} worker gone; message {} stays pending in the store",
                device.id, uuid
            );
        }
        Err(_) => {
            warn!(
                "device {} queue full; routing {} back through the loader",
                device.id, uuid
            );
            gate.note_enqueued(&uuid);
        }
    }
}

/// One task per modem. Outbound processing and inbound polling share the
/// loop, which serializes all access to the AT line.
struct DeviceWorker {
    driver: ModemDriver,
    store: Storage,
    notifier: Arc<dyn Notifier>,
    gate: Arc<LoaderGate>,
}

impl DeviceWorker {
    async fn run(
        mut self,
        mut send_rx: mpsc::Receiver<OutgoingMessage>,
        mut poll_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(message) = send_rx.recv() => self.process(message).await,
                Some(()) = poll_rx.recv() => self.poll_inbound().await,
                else => break,
            }
        }
        debug!("device {} worker terminated", self.driver.device_id());
    }

    async fn process(&mut self, mut message: OutgoingMessage) {
        info!(
            "processing {} on {}",
            message.uuid,
            self.driver.device_id()
        );
        let outcome = self.driver.send_sms(&message.mobile, &message.body).await;

        message.status = match outcome {
            SendOutcome::Sent => MessageStatus::Processed,
            SendOutcome::TimedOut => MessageStatus::Pending,
            SendOutcome::Rejected => MessageStatus::Error,
        };
        message.device = Some(self.driver.device_id().to_string());
        message.retries += 1;

        if let Err(e) = self
            .store
            .update_outgoing_status(
                &message.uuid,
                message.status,
                message.retries,
                self.driver.device_id(),
            )
            .await
        {
            fatal_store_error("recording delivery attempt", &e);
        }

        if message.status != MessageStatus::Processed && message.retries < MAX_RETRIES {
            // Back through the loader gate, never straight into the queue;
            // a direct push could put the same message there twice.
            self.gate.note_enqueued(&message.uuid);
        }
    }

    async fn poll_inbound(&mut self) {
        debug!("polling {}", self.driver.device_id());
        for (mobile, body) in self.driver.read_sms().await {
            let row = match self
                .store
                .insert_incoming(&mobile, &body, self.driver.device_id())
                .await
            {
                Ok(row) => row,
                Err(e) => fatal_store_error("persisting incoming message", &e),
            };
            spawn_notify(Arc::clone(&self.notifier), row);
        }
    }
}

fn spawn_notify(notifier: Arc<dyn Notifier>, message: IncomingMessage) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&message).await {
            warn!("notifier failed for incoming {}: {}", message.id, e);
        }
    });
}

/// If a state transition cannot be made durable, continuing would risk double
/// delivery or silent loss. Fail loud, drain nothing.
fn fatal_store_error(context: &str, err: &StorageError) -> ! {
    error!("storage failure while {}: {}", context, err);
    std::process::exit(1);
}

/// Replenishes the queue from storage. Sleeps until woken by the gate or the
/// long fallback timer; a fresh timer is armed after every wakeup, so there
/// is no cumulative drift.
async fn loader_loop(
    store: Storage,
    queue_tx: mpsc::Sender<OutgoingMessage>,
    mut wakeup_rx: mpsc::Receiver<()>,
    tuning: DispatchTuning,
) {
    loop {
        tokio::select! {
            Some(()) = wakeup_rx.recv() => debug!("message loader: woken by signal"),
            _ = sleep(tuning.loader_long_timeout) => debug!("message loader: woken by timer"),
        }

        let queued = queue_tx.max_capacity() - queue_tx.capacity();
        if queued >= tuning.buffer_low_count {
            debug!("message loader: queue holds {}, no refill needed", queued);
            continue;
        }

        let need = (tuning.buffer_max_size - queued) as i64;
        match store.load_pending(need).await {
            Ok(messages) => {
                debug!("message loader: {} pending row(s) loaded", messages.len());
                for message in messages {
                    // May block while the dispatcher catches up; that is the
                    // back-pressure path.
                    if queue_tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("message loader: {}", e),
        }
    }
}

/// Writes a poll signal every [`POLL_INTERVAL`]; a signal nobody consumed yet
/// is simply kept, not stacked.
async fn poll_ticker(poll_tx: mpsc::Sender<()>) {
    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if poll_tx.try_send(()).is_err() && poll_tx.is_closed() {
            return;
        }
    }
}
