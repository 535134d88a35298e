//! Scripted in-memory transport for driving the client and manager in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::{Notify, mpsc};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::protocol::proto::{FromRadio, ToRadio};
use crate::transport::{BoxFuture, Transport};

pub struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    written: Mutex<Vec<Bytes>>,
    connect_script: Mutex<VecDeque<Result<()>>>,
    connected: AtomicBool,
    link_dropped: Notify,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written: Mutex::new(Vec::new()),
            connect_script: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            link_dropped: Notify::new(),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Queues the outcome of the next `connect` call; unscripted calls succeed.
    pub fn script_connect(&self, outcome: Result<()>) {
        self.connect_script.lock().push_back(outcome);
    }

    /// Delivers one envelope to the next `read_frame`.
    pub fn push(&self, message: &FromRadio) {
        self.push_raw(Bytes::from(message.encode_to_vec()));
    }

    pub fn push_raw(&self, payload: Bytes) {
        let _ = self.inbound_tx.send(payload);
    }

    /// Simulates the device going away.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::Release);
        self.link_dropped.notify_waiters();
    }

    pub fn written(&self) -> Vec<ToRadio> {
        self.written
            .lock()
            .iter()
            .filter_map(|frame| ToRadio::decode(frame.as_ref()).ok())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

impl Transport for MockTransport {
    fn connect<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if cancel.is_done() {
                return Err(Error::Cancelled);
            }
            self.connects.fetch_add(1, Ordering::AcqRel);
            let outcome = self.connect_script.lock().pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.connected.store(true, Ordering::Release);
            }
            outcome
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::AcqRel);
            self.drop_link();
            Ok(())
        })
    }

    fn read_frame<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            cancel
                .run(async {
                    let dropped = self.link_dropped.notified();
                    tokio::pin!(dropped);
                    dropped.as_mut().enable();
                    if !self.connected.load(Ordering::Acquire) {
                        return Err(Error::closed("mock link down"));
                    }
                    let mut inbound = self.inbound_rx.lock().await;
                    tokio::select! {
                        frame = inbound.recv() => frame.ok_or_else(|| Error::closed("mock closed")),
                        () = dropped => Err(Error::closed("mock link down")),
                    }
                })
                .await
        })
    }

    fn write_frame<'a>(
        &'a self,
        _cancel: &'a CancelToken,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::Acquire) {
                return Err(Error::NotConnected);
            }
            self.written.lock().push(payload);
            Ok(())
        })
    }

    fn status_target(&self) -> String {
        "mock".to_string()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
