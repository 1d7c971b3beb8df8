// bus.rs

use crate::*;

use std::fmt::Debug;
use tokio::sync::{mpsc, watch};

/// Sending half of a bounded FIFO message queue.
///
/// Senders block while the queue is full: message volume is bounded by
/// human and radio event rates, so nothing is ever dropped.
#[derive(Debug)]
pub struct MsgSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for MsgSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

pub struct MsgReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
}

pub fn msg_queue<T>(name: &'static str, depth: usize) -> (MsgSender<T>, MsgReceiver<T>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (MsgSender { name, tx }, MsgReceiver { name, rx })
}

impl<T: Debug> MsgSender<T> {
    /// Post from a task; waits for a free slot.
    pub async fn send(&self, msg: T) -> anyhow::Result<()> {
        debug!("{} <- {msg:?}", self.name);
        self.tx
            .send(msg)
            .await
            .map_err(|e| anyhow!("{} queue closed, dropped {:?}", self.name, e.0))
    }

    /// Post from a plain thread such as a driver event callback.
    /// Must not be called from within the async runtime.
    pub fn blocking_send(&self, msg: T) -> anyhow::Result<()> {
        debug!("{} <- {msg:?} (blocking)", self.name);
        self.tx
            .blocking_send(msg)
            .map_err(|e| anyhow!("{} queue closed, dropped {:?}", self.name, e.0))
    }
}

impl<T> MsgReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Level-triggered "station connected with IP" flag for anything that needs
/// to block until the uplink is usable.
#[derive(Clone, Debug)]
pub struct ReadyFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, ready: bool) {
        self.tx.send_if_modified(|cur| {
            let changed = *cur != ready;
            *cur = ready;
            changed
        });
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Both queues of the coordination bus plus the readiness flag.
#[derive(Clone, Debug)]
pub struct Bus {
    pub wifi: MsgSender<WifiMsg>,
    pub http: MsgSender<HttpMsg>,
    pub connected: ReadyFlag,
}

pub struct BusReceivers {
    pub wifi: MsgReceiver<WifiMsg>,
    pub http: MsgReceiver<HttpMsg>,
}

impl Bus {
    pub fn new(depth: usize) -> (Self, BusReceivers) {
        let (wifi_tx, wifi_rx) = msg_queue("wifi_app", depth);
        let (http_tx, http_rx) = msg_queue("http_monitor", depth);
        (
            Self {
                wifi: wifi_tx,
                http: http_tx,
                connected: ReadyFlag::new(),
            },
            BusReceivers {
                wifi: wifi_rx,
                http: http_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_is_fifo() {
        let (tx, mut rx) = msg_queue("test", 3);
        tx.send(WifiMsg::LoadSavedCredentials).await.unwrap();
        tx.send(WifiMsg::StartHttpServer).await.unwrap();
        tx.send(WifiMsg::StaDisconnected).await.unwrap();
        assert_eq!(rx.recv().await, Some(WifiMsg::LoadSavedCredentials));
        assert_eq!(rx.recv().await, Some(WifiMsg::StartHttpServer));
        assert_eq!(rx.recv().await, Some(WifiMsg::StaDisconnected));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn full_queue_blocks_sender_until_drained() {
        let (tx, mut rx) = msg_queue("test", 1);
        tx.send(HttpMsg::WifiConnectInit).await.unwrap();

        let tx2 = tx.clone();
        let pending = tokio::spawn(async move { tx2.send(HttpMsg::WifiConnectSuccess).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(HttpMsg::WifiConnectInit));
        pending.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(HttpMsg::WifiConnectSuccess));
    }

    #[test]
    fn blocking_send_from_plain_thread() {
        let (tx, mut rx) = msg_queue("test", 2);
        std::thread::spawn(move || tx.blocking_send(WifiMsg::StaConnectedGotIp).unwrap())
            .join()
            .unwrap();
        assert_eq!(rx.try_recv(), Some(WifiMsg::StaConnectedGotIp));
    }

    #[tokio::test]
    async fn send_to_closed_queue_fails() {
        let (tx, rx) = msg_queue::<WifiMsg>("test", 1);
        drop(rx);
        assert!(tx.send(WifiMsg::StartHttpServer).await.is_err());
    }

    #[tokio::test]
    async fn ready_flag_wakes_waiter() {
        let flag = ReadyFlag::new();
        assert!(!flag.is_set());

        let f2 = flag.clone();
        let waiter = tokio::spawn(async move { f2.wait().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        flag.set(true);
        waiter.await.unwrap();
        assert!(flag.is_set());

        flag.set(false);
        assert!(!flag.is_set());
    }
}
// EOF
