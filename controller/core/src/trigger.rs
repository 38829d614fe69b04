use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::mpsc, time};

/// Requests a reconcile.
///
/// Requests never block: when one is already pending, further requests are
/// dropped. The consumer waits for a quiet period before acting on a request,
/// so a burst of watch events collapses into a single reconcile.
#[derive(Clone, Debug)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
    closed: Arc<AtomicBool>,
}

/// The consuming side of a [`Trigger`].
#[derive(Debug)]
pub struct Requests {
    rx: mpsc::Receiver<()>,
    closed: Arc<AtomicBool>,
    debounce: time::Duration,
}

pub fn channel(debounce: time::Duration) -> (Trigger, Requests) {
    let (tx, rx) = mpsc::channel(1);
    let closed = Arc::new(AtomicBool::new(false));
    let trigger = Trigger {
        tx,
        closed: closed.clone(),
    };
    let requests = Requests {
        rx,
        closed,
        debounce,
    };
    (trigger, requests)
}

// === impl Trigger ===

impl Trigger {
    pub fn request(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // A full channel already holds a pending request.
        let _ = self.tx.try_send(());
    }

    /// Stops the consumer. Later requests are ignored.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wake the consumer so it observes the close.
            let _ = self.tx.try_send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// === impl Requests ===

impl Requests {
    /// Waits for a request followed by a quiet period.
    ///
    /// Returns false once the trigger has been closed or every trigger handle
    /// has been dropped.
    pub async fn next(&mut self) -> bool {
        if self.is_closed() || self.rx.recv().await.is_none() {
            return false;
        }

        loop {
            if self.is_closed() {
                return false;
            }
            match time::timeout(self.debounce, self.rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) | Err(_) => break,
            }
        }

        !self.is_closed()
    }

    /// Invokes `f` once per debounced request until the trigger is closed.
    pub async fn run<F, Fut>(mut self, mut f: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        while self.next().await {
            f().await;
        }
        tracing::debug!("Trigger closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
