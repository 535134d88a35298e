//! Bluetooth LE transport implementation.
//!
//! The radio exposes one GATT service with three characteristics. Envelopes
//! are written to `ToRadio` and read from `FromRadio`; characteristic
//! boundaries delimit frames, so no stream codec is used. `FromNum` notifies
//! when the radio has queued data, which wakes a drain task that reads
//! `FromRadio` until it comes back empty.
//!
//! ```text
//! notify(FromNum) ─┐
//! write(ToRadio) ──┼─> wake ─> drain: read(FromRadio) until empty ─> FrameQueue ─> read_frame
//! connect done ────┘
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use btleplug::api::{
    Central, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::transport::{BoxFuture, Transport};

/// Mesh GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1_b218_15a8_461f_9fa8_5dca_e273_eafd);

/// Client-to-radio characteristic (write without response).
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c_76d2_129e_4dad_a1dd_7866_1244_01e7);

/// Radio-to-client characteristic (read).
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2c55_e69e_4993_11ed_b878_0242_ac12_0002);

/// Data-available characteristic (notify).
pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xed9d_a18c_a800_4f66_a670_aa75_47e3_4453);

/// Default bounded scan when the device is not cached.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on subscribing to `FromNum`.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default depth of the received-frame queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Largest payload accepted by a single `ToRadio` write.
pub const MAX_WRITE_SIZE: usize = 512;

/// Interval between cache lookups while scanning.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Categories of platform Bluetooth errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorClass {
    /// Harmless noise, logged and ignored.
    Benign,
    /// The stack has no usable object for the device yet; scan and retry.
    PropertiesUnavailable,
    /// Anything else.
    Other,
}

/// Classifies a platform error message.
///
/// Bluetooth stacks only expose these conditions as text, so this is the
/// one place that matches on error strings.
#[must_use]
pub fn classify_platform_error(message: &str) -> PlatformErrorClass {
    const BENIGN: [&str; 4] = [
        "already enabled",
        "already powered",
        "no scan in progress",
        "no discovery started",
    ];
    const PROPERTIES: [&str; 4] = [
        "org.freedesktop.dbus.properties",
        "properties interface",
        "unknown object",
        "device not found",
    ];
    let message = message.to_ascii_lowercase();
    if BENIGN.iter().any(|p| message.contains(p)) {
        PlatformErrorClass::Benign
    } else if PROPERTIES.iter().any(|p| message.contains(p)) {
        PlatformErrorClass::PropertiesUnavailable
    } else {
        PlatformErrorClass::Other
    }
}

/// Logs benign platform errors and propagates the rest.
fn tolerate<T>(context: &str, result: btleplug::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if classify_platform_error(&e.to_string()) == PlatformErrorClass::Benign => {
            tracing::debug!("{}: ignoring benign error: {}", context, e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Validates a MAC address and normalizes it to upper case.
pub fn normalize_address(address: &str) -> Result<String> {
    let address = address.trim();
    let groups: Vec<&str> = address.split(':').collect();
    let valid = groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(address.to_ascii_uppercase())
    } else {
        Err(Error::config(format!("invalid bluetooth address: {address:?}")))
    }
}

/// Bounded drop-oldest queue of received frames.
///
/// Once closed, every pending and future `pop` fails with the recorded
/// reason.
#[derive(Debug)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    capacity: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Bytes>,
    closed: Option<String>,
}

impl FrameQueue {
    /// Creates an open queue holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends a frame. Returns true if the oldest frame was dropped.
    pub fn push(&self, frame: Bytes) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return false;
            }
            let dropped = if state.frames.len() >= self.capacity {
                state.frames.pop_front().is_some()
            } else {
                false
            };
            state.frames.push_back(frame);
            dropped
        };
        self.ready.notify_waiters();
        dropped
    }

    /// Closes the queue. The first reason recorded wins.
    pub fn close(&self, reason: impl Into<String>) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.into());
            }
            state.frames.clear();
        }
        self.ready.notify_waiters();
    }

    /// Number of queued frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Returns true if no frames are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next frame.
    pub async fn pop(&self) -> Result<Bytes> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(reason) = &state.closed {
                    return Err(Error::closed(reason.clone()));
                }
                if let Some(frame) = state.frames.pop_front() {
                    return Ok(frame);
                }
            }
            notified.await;
        }
    }
}

/// Reads until the source returns an empty value, queueing each frame.
///
/// Returns the number of frames read.
pub async fn drain_until_empty<F, Fut, E>(mut read: F, queue: &FrameQueue) -> Result<usize>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Vec<u8>, E>>,
    E: Into<Error>,
{
    let mut count = 0;
    loop {
        let data = read().await.map_err(Into::into)?;
        if data.is_empty() {
            return Ok(count);
        }
        tracing::trace!("read {} bytes: {}", data.len(), hex::encode(&data));
        if queue.push(Bytes::from(data)) {
            tracing::warn!("frame queue full, dropped oldest frame");
        }
        count += 1;
    }
}

/// A device that may be connected at the OS level but has no session yet.
///
/// Held while a connect is in flight so that a cancelled connect, or a close
/// racing it, can still disconnect the device.
struct HeldDevice<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> HeldDevice<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn hold(&self, device: &T) {
        *self.slot.lock() = Some(device.clone());
    }

    /// Hands the device over to a session.
    fn clear(&self) {
        self.slot.lock().take();
    }

    /// Disconnects the held device, if any. Returns whether one was held.
    async fn release<F, Fut, E>(&self, disconnect: F) -> bool
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        let held = self.slot.lock().take();
        let Some(device) = held else {
            return false;
        };
        if let Err(e) = disconnect(device).await {
            tracing::warn!("error disconnecting half-open device: {}", e);
        }
        true
    }
}

/// Configuration for Bluetooth LE transport.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Device MAC address.
    pub address: String,
    /// Adapter to use; the first adapter if `None`.
    pub adapter_id: Option<String>,
    /// Bound on the fallback scan.
    pub scan_timeout: Duration,
    /// Bound on subscribing to notifications.
    pub subscribe_timeout: Duration,
    /// Received-frame queue depth.
    pub queue_capacity: usize,
}

impl BleConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            adapter_id: None,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Selects an adapter by (a substring of) its identifier.
    #[must_use]
    pub fn adapter_id(mut self, id: impl Into<String>) -> Self {
        self.adapter_id = Some(id.into());
        self
    }

    /// Sets the fallback scan timeout.
    #[must_use]
    pub const fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Sets the subscribe timeout.
    #[must_use]
    pub const fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Sets the received-frame queue depth.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// One live GATT connection and its background tasks.
struct Session {
    peripheral: Peripheral,
    to_radio: Characteristic,
    queue: Arc<FrameQueue>,
    wake: mpsc::Sender<()>,
    stop: CancelToken,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn is_up(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Requests a drain; a full channel means one is already pending.
    fn wake_drain(&self) {
        let _ = self.wake.try_send(());
    }

    fn fail(&self, reason: String) {
        self.connected.store(false, Ordering::Release);
        self.queue.close(reason);
        self.stop.cancel();
    }

    async fn shutdown(&self) {
        self.fail("connection closed".to_string());
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = tolerate("disconnect", self.peripheral.disconnect().await) {
            tracing::debug!("disconnect failed: {}", e);
        }
    }
}

/// Bluetooth LE transport.
pub struct BleTransport {
    config: BleConfig,
    address: String,
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Arc<Session>>>,
    held: HeldDevice<Peripheral>,
}

impl BleTransport {
    /// Creates a transport; fails if the address is malformed.
    pub fn new(config: BleConfig) -> Result<Self> {
        let address = normalize_address(&config.address)?;
        Ok(Self {
            config,
            address,
            lifecycle: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            held: HeldDevice::new(),
        })
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    async fn select_adapter(&self) -> Result<Adapter> {
        let manager = Manager::new().await?;
        let mut selected = None;
        for adapter in manager.adapters().await? {
            let info = adapter.adapter_info().await.unwrap_or_default();
            let wanted = self
                .config
                .adapter_id
                .as_deref()
                .is_none_or(|id| info.contains(id));
            if wanted {
                selected = Some((adapter, info));
                break;
            }
        }
        let (adapter, info) = selected.ok_or_else(|| match &self.config.adapter_id {
            Some(id) => Error::closed(format!("bluetooth adapter {id} not found")),
            None => Error::closed("no bluetooth adapter available"),
        })?;

        if let Some(CentralState::PoweredOff) =
            tolerate("adapter state", adapter.adapter_state().await)?
        {
            return Err(Error::closed(format!("bluetooth adapter {info} is powered off")));
        }
        tracing::debug!("using bluetooth adapter {}", info);
        Ok(adapter)
    }

    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Option<Peripheral>> {
        for peripheral in adapter.peripherals().await? {
            if peripheral
                .address()
                .to_string()
                .eq_ignore_ascii_case(&self.address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn scan_for_device(&self, adapter: &Adapter) -> Result<Option<Peripheral>> {
        tracing::info!(
            "scanning for {} (up to {:?})",
            self.address,
            self.config.scan_timeout
        );
        tolerate("start scan", adapter.start_scan(ScanFilter::default()).await)?;

        let deadline = tokio::time::Instant::now() + self.config.scan_timeout;
        let found = loop {
            match self.find_peripheral(adapter).await {
                Ok(Some(peripheral)) => break Ok(Some(peripheral)),
                Ok(None) if tokio::time::Instant::now() >= deadline => break Ok(None),
                Ok(None) => tokio::time::sleep(SCAN_POLL_INTERVAL).await,
                Err(e) => break Err(e),
            }
        };

        tolerate("stop scan", adapter.stop_scan().await)?;
        found
    }

    async fn connect_peripheral(&self, adapter: &Adapter) -> Result<Peripheral> {
        let not_found = || Error::closed(format!("device {} not found", self.address));

        let peripheral = match self.find_peripheral(adapter).await? {
            Some(peripheral) => peripheral,
            None => self.scan_for_device(adapter).await?.ok_or_else(not_found)?,
        };
        self.held.hold(&peripheral);
        if peripheral.is_connected().await? {
            return Ok(peripheral);
        }

        match peripheral.connect().await {
            Ok(()) => Ok(peripheral),
            Err(e)
                if classify_platform_error(&e.to_string())
                    == PlatformErrorClass::PropertiesUnavailable =>
            {
                tracing::warn!("connect failed ({}), scanning and retrying once", e);
                let peripheral = self.scan_for_device(adapter).await?.ok_or_else(not_found)?;
                self.held.hold(&peripheral);
                peripheral.connect().await?;
                Ok(peripheral)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_session(&self, peripheral: Peripheral) -> Result<Session> {
        peripheral.discover_services().await?;
        if !peripheral
            .services()
            .iter()
            .any(|service| service.uuid == SERVICE_UUID)
        {
            return Err(Error::MissingService { uuid: SERVICE_UUID });
        }

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == SERVICE_UUID)
                .cloned()
                .ok_or(Error::MissingCharacteristic { uuid })
        };
        let to_radio = find(TO_RADIO_UUID)?;
        let from_radio = find(FROM_RADIO_UUID)?;
        let from_num = find(FROM_NUM_UUID)?;

        tokio::time::timeout(
            self.config.subscribe_timeout,
            peripheral.subscribe(&from_num),
        )
        .await
        .map_err(|_| Error::closed("subscribe to data-available timed out"))??;
        let notifications = peripheral.notifications().await?;

        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity));
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let stop = CancelToken::new();
        let connected = Arc::new(AtomicBool::new(true));

        let drain = tokio::spawn(drain_task(
            peripheral.clone(),
            from_radio,
            Arc::clone(&queue),
            wake_rx,
            stop.clone(),
            Arc::clone(&connected),
        ));
        let listen = tokio::spawn(notify_task(
            notifications,
            wake_tx.clone(),
            Arc::clone(&queue),
            stop.clone(),
            Arc::clone(&connected),
        ));

        Ok(Session {
            peripheral,
            to_radio,
            queue,
            wake: wake_tx,
            stop,
            connected,
            tasks: vec![drain, listen],
        })
    }

    async fn establish(&self) -> Result<Session> {
        tracing::info!("connecting to bluetooth device {}", self.address);
        let adapter = self.select_adapter().await?;
        let peripheral = self.connect_peripheral(&adapter).await?;
        match self.open_session(peripheral.clone()).await {
            Ok(session) => {
                self.held.clear();
                Ok(session)
            }
            Err(e) => {
                self.release_held().await;
                Err(e)
            }
        }
    }

    async fn release_held(&self) {
        if self.held.release(|p| async move { p.disconnect().await }).await {
            tracing::debug!("released half-open device {}", self.address);
        }
    }
}

async fn drain_task(
    peripheral: Peripheral,
    from_radio: Characteristic,
    queue: Arc<FrameQueue>,
    mut wake: mpsc::Receiver<()>,
    stop: CancelToken,
    connected: Arc<AtomicBool>,
) {
    loop {
        let woke = tokio::select! {
            () = stop.cancelled() => return,
            woke = wake.recv() => woke,
        };
        if woke.is_none() {
            return;
        }

        match drain_until_empty(|| peripheral.read(&from_radio), &queue).await {
            Ok(0) => {}
            Ok(count) => tracing::trace!("drained {} frames", count),
            Err(e) => {
                tracing::error!("drain failed, closing connection: {}", e);
                connected.store(false, Ordering::Release);
                queue.close(format!("drain failed: {e}"));
                stop.cancel();
                if let Err(e) = peripheral.disconnect().await {
                    tracing::warn!("error disconnecting after drain failure: {}", e);
                }
                return;
            }
        }
    }
}

async fn notify_task(
    mut notifications: Notifications,
    wake: mpsc::Sender<()>,
    queue: Arc<FrameQueue>,
    stop: CancelToken,
    connected: Arc<AtomicBool>,
) {
    loop {
        let next = tokio::select! {
            () = stop.cancelled() => return,
            next = notifications.next() => next,
        };
        match next {
            Some(notification) if notification.uuid == FROM_NUM_UUID => {
                let _ = wake.try_send(());
            }
            Some(notification) => {
                tracing::trace!("ignoring notification from {}", notification.uuid);
            }
            None => {
                tracing::warn!("notification stream ended");
                connected.store(false, Ordering::Release);
                queue.close("device disconnected");
                stop.cancel();
                return;
            }
        }
    }
}

impl Transport for BleTransport {
    fn connect<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if let Some(session) = self.current() {
                if session.is_up() {
                    return Ok(());
                }
                self.session.lock().take();
                session.shutdown().await;
            }

            let session = match cancel.run(self.establish()).await {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    // establish may have been dropped mid-way
                    self.release_held().await;
                    return Err(e);
                }
            };
            // Data may already be waiting from before we subscribed
            session.wake_drain();
            *self.session.lock() = Some(session);
            tracing::info!("connected to bluetooth device {}", self.address);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            let session = self.session.lock().take();
            if let Some(session) = session {
                session.shutdown().await;
                tracing::info!("disconnected from bluetooth device {}", self.address);
            }
            self.release_held().await;
            Ok(())
        })
    }

    fn read_frame<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let session = self.current().ok_or(Error::NotConnected)?;
            cancel.run(session.queue.pop()).await
        })
    }

    fn write_frame<'a>(
        &'a self,
        cancel: &'a CancelToken,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if payload.len() > MAX_WRITE_SIZE {
                return Err(Error::ShortWrite {
                    written: 0,
                    expected: payload.len(),
                });
            }
            let session = self.current().ok_or(Error::NotConnected)?;
            if !session.is_up() {
                return Err(Error::closed("bluetooth link is down"));
            }

            tracing::trace!("writing {} bytes: {}", payload.len(), hex::encode(&payload));
            let result = cancel
                .run(async {
                    session
                        .peripheral
                        .write(&session.to_radio, &payload, WriteType::WithoutResponse)
                        .await?;
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => {
                    session.wake_drain();
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("write failed, closing connection: {}", e);
                    session.fail(format!("write failed: {e}"));
                    Err(e)
                }
            }
        })
    }

    fn status_target(&self) -> String {
        self.address.clone()
    }

    fn is_connected(&self) -> bool {
        self.current().is_some_and(|session| session.is_up())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(" aa:bb:cc:0d:ee:ff ").unwrap(),
            "AA:BB:CC:0D:EE:FF"
        );
        for bad in ["", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:fg", "aabbccddeeff", "a:bb:cc:dd:ee:ff"] {
            assert!(matches!(normalize_address(bad), Err(Error::Config { .. })), "{bad}");
        }
    }

    #[test]
    fn test_classify_platform_error() {
        assert_eq!(
            classify_platform_error("Adapter already enabled"),
            PlatformErrorClass::Benign
        );
        assert_eq!(
            classify_platform_error("org.bluez.Error.Failed: No discovery started"),
            PlatformErrorClass::Benign
        );
        assert_eq!(
            classify_platform_error("No scan in progress"),
            PlatformErrorClass::Benign
        );
        assert_eq!(
            classify_platform_error(
                "DBus error: org.freedesktop.DBus.Error.UnknownMethod on org.freedesktop.DBus.Properties"
            ),
            PlatformErrorClass::PropertiesUnavailable
        );
        assert_eq!(
            classify_platform_error("Permission denied"),
            PlatformErrorClass::Other
        );
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(
            TO_RADIO_UUID.to_string(),
            "f75c76d2-129e-4dad-a1dd-7866124401e7"
        );
        assert_eq!(
            FROM_RADIO_UUID.to_string(),
            "2c55e69e-4993-11ed-b878-0242ac120002"
        );
        assert_eq!(
            FROM_NUM_UUID.to_string(),
            "ed9da18c-a800-4f66-a670-aa7547e34453"
        );
    }

    #[tokio::test]
    async fn test_queue_drops_oldest() {
        let queue = FrameQueue::new(2);
        assert!(!queue.push(Bytes::from_static(b"1")));
        assert!(!queue.push(Bytes::from_static(b"2")));
        assert!(queue.push(Bytes::from_static(b"3")));
        assert_eq!(queue.len(), 2);
        assert_eq!(&queue.pop().await.unwrap()[..], b"2");
        assert_eq!(&queue.pop().await.unwrap()[..], b"3");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let queue = Arc::new(FrameQueue::new(4));
        let reader = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close("drain failed: gatt read error");
        queue.close("second reason is ignored");

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "connection closed: drain failed: gatt read error");
        assert!(!queue.push(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_push_wakes_blocked_reader() {
        let queue = Arc::new(FrameQueue::new(4));
        let reader = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(Bytes::from_static(b"frame"));
        assert_eq!(&reader.await.unwrap().unwrap()[..], b"frame");
    }

    #[tokio::test]
    async fn test_drain_reads_until_empty() {
        let queue = FrameQueue::new(8);
        let mut reads: VecDeque<Vec<u8>> =
            VecDeque::from(vec![b"a".to_vec(), b"bc".to_vec(), Vec::new(), b"never".to_vec()]);
        let count = drain_until_empty(
            || {
                let next = reads.pop_front().unwrap_or_default();
                async move { Ok::<_, Error>(next) }
            },
            &queue,
        )
        .await
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_failure_propagates() {
        let queue = FrameQueue::new(8);
        let mut calls = 0;
        let result = drain_until_empty(
            || {
                calls += 1;
                let outcome = if calls == 1 {
                    Ok(b"x".to_vec())
                } else {
                    Err(Error::closed("gatt read failed"))
                };
                async move { outcome }
            },
            &queue,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[derive(Clone)]
    struct FakeDevice(Arc<std::sync::atomic::AtomicUsize>);

    impl FakeDevice {
        async fn disconnect(self) -> std::result::Result<(), Error> {
            self.0.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_held_device() {
        let held = HeldDevice::new();
        let device = FakeDevice(Arc::new(std::sync::atomic::AtomicUsize::new(0)));
        let cancel = CancelToken::new();

        // connected, then cancelled before the session was opened
        let (result, ()) = tokio::join!(
            cancel.run(async {
                held.hold(&device);
                std::future::pending::<Result<()>>().await
            }),
            async {
                tokio::task::yield_now().await;
                cancel.cancel();
            }
        );
        assert!(matches!(result, Err(Error::Cancelled)));

        assert!(held.release(FakeDevice::disconnect).await);
        assert_eq!(device.0.load(Ordering::Acquire), 1);
        assert!(!held.release(FakeDevice::disconnect).await);
        assert_eq!(device.0.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_session_handover_clears_held_device() {
        let held = HeldDevice::new();
        let device = FakeDevice(Arc::new(std::sync::atomic::AtomicUsize::new(0)));
        held.hold(&device);
        held.clear();

        assert!(!held.release(FakeDevice::disconnect).await);
        assert_eq!(device.0.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_close_without_session_is_ok() {
        let transport = BleTransport::new(BleConfig::new("AA:BB:CC:DD:EE:FF")).unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_write_is_short_write() {
        let transport = BleTransport::new(BleConfig::new("AA:BB:CC:DD:EE:FF")).unwrap();
        let err = transport
            .write_frame(&CancelToken::new(), Bytes::from(vec![0u8; MAX_WRITE_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShortWrite { written: 0, expected } if expected == MAX_WRITE_SIZE + 1
        ));
        assert!(matches!(
            transport
                .write_frame(&CancelToken::new(), Bytes::from_static(b"x"))
                .await,
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_new_rejects_bad_address() {
        assert!(BleTransport::new(BleConfig::new("nope")).is_err());
        let transport = BleTransport::new(BleConfig::new("aa:bb:cc:dd:ee:ff")).unwrap();
        assert_eq!(transport.status_target(), "AA:BB:CC:DD:EE:FF");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    #[ignore = "Requires a Bluetooth adapter and a powered-on radio"]
    async fn test_connect_hardware() {
        let address = std::env::var("MESHLINK_BLE_ADDRESS").unwrap();
        let transport = BleTransport::new(BleConfig::new(address)).unwrap();
        let cancel = CancelToken::new().with_timeout(Duration::from_secs(30));
        transport.connect(&cancel).await.unwrap();
        transport.close().await.unwrap();
    }
}
