use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::allocation::{allocate, probe_local, TunnelInfo};
use super::channel::ControlNotice;
use super::events::{EventReceiver, EventSender, TunnelEvent};
use super::options::TunnelOptions;
use super::pool::{detected_pool_size, TransportPool};
use super::session::{SessionContext, SessionHandler};
use super::state::{SessionGuard, SessionState};
use crate::error::{Result, TunnelError};
use crate::protocol::{ControlFrame, TunnelId};

struct Inner {
    options: Arc<TunnelOptions>,
    events: EventSender,
    guard: Arc<SessionGuard>,
    opened: AtomicBool,
    info: OnceLock<TunnelInfo>,
    pool: TransportPool,
    session: Mutex<Option<SessionHandler>>,
}

/// Handle to one tunnel session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    pub fn new(options: TunnelOptions) -> Result<(Self, EventReceiver)> {
        options.validate()?;
        let (events, rx) = EventSender::channel();

        let tunnel = Self {
            inner: Arc::new(Inner {
                options: Arc::new(options),
                events,
                guard: Arc::new(SessionGuard::new()),
                opened: AtomicBool::new(false),
                info: OnceLock::new(),
                pool: TransportPool::new(),
                session: Mutex::new(None),
            }),
        };
        Ok((tunnel, rx))
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.inner.options
    }

    /// Public URL, once the tunnel has been allocated.
    pub fn url(&self) -> Option<&str> {
        self.inner.info.get().map(|i| i.url.as_str())
    }

    pub fn tunnel_id(&self) -> Option<&TunnelId> {
        self.inner.info.get().map(|i| &i.tunnel_id)
    }

    pub fn info(&self) -> Option<&TunnelInfo> {
        self.inner.info.get()
    }

    pub fn state(&self) -> SessionState {
        self.inner.guard.get()
    }

    /// Probe the local server, allocate a tunnel, open the transport pool
    /// and start serving virtual requests.
    pub async fn open(&self) -> Result<TunnelInfo> {
        if self.inner.opened.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyOpen);
        }

        match self.establish().await {
            Ok(info) => {
                info!("Tunnel open: {} -> {}", info.url, self.inner.options.local_addr());
                self.inner.events.emit(TunnelEvent::Open {
                    url: info.url.clone(),
                });
                Ok(info)
            }
            Err(e) => {
                error!("Failed to open tunnel: {}", e);
                self.inner.events.error(e.clone());
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<TunnelInfo> {
        let opts = &self.inner.options;

        probe_local(opts).await?;

        let info = allocate(opts).await?;
        self.ensure_open()?;
        let info = self.inner.info.get_or_init(|| info).clone();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let size = detected_pool_size();
        let channels = self
            .inner
            .pool
            .open(opts, &info, size, control_tx)
            .await?;

        let session = SessionHandler::new(SessionContext::new(
            opts.clone(),
            self.inner.events.clone(),
            self.inner.guard.clone(),
        )?);

        {
            let mut slot = self.inner.session.lock().await;
            for channel in channels {
                let index = channel.index();
                let cancel = channel.cancel_token();
                let handle = session.serve(index, channel, cancel);
                self.monitor_channel(index, handle);
            }
            *slot = Some(session);
        }
        self.spawn_control_listener(control_rx);

        // A close that raced with setup may have missed the session.
        if !self.inner.guard.is_open() {
            self.release_resources().await;
            return Err(TunnelError::Closed);
        }

        Ok(info)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.guard.is_open() {
            Ok(())
        } else {
            Err(TunnelError::Closed)
        }
    }

    fn monitor_channel(
        &self,
        index: usize,
        handle: JoinHandle<std::result::Result<(), hyper::Error>>,
    ) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            let result = handle.await;
            tunnel.inner.pool.mark_closed(index).await;

            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            match failure {
                Some(message) if tunnel.inner.guard.is_open() => {
                    error!("Transport channel {} failed: {}", index, message);
                    tunnel
                        .inner
                        .events
                        .error(TunnelError::Channel { index, message });
                }
                Some(message) => debug!("Channel {} ended during close: {}", index, message),
                None if tunnel.inner.guard.is_open() => {
                    warn!("Transport channel {} closed unexpectedly", index);
                }
                None => debug!("Channel {} closed", index),
            }
        });
    }

    fn spawn_control_listener(&self, mut control_rx: mpsc::UnboundedReceiver<ControlNotice>) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            while let Some(notice) = control_rx.recv().await {
                tunnel.handle_control(notice).await;
            }
        });
    }

    pub(crate) async fn handle_control(&self, notice: ControlNotice) {
        match notice.frame {
            ControlFrame::TunnelDone { tunnel_id, data } => {
                if let Some(ours) = self.tunnel_id() {
                    if *ours != tunnel_id {
                        warn!(
                            "tunnel_done on channel {} names tunnel {}, expected {}",
                            notice.channel, tunnel_id, ours
                        );
                    }
                }
                self.finish(notice.channel, data).await;
            }
        }
    }

    async fn finish(&self, channel: usize, payload: Option<Value>) {
        if !self.inner.guard.begin_close() {
            debug!("Ignoring tunnel_done from channel {}: already closing", channel);
            return;
        }
        info!("Tunnel done (reported on channel {})", channel);
        self.inner.events.emit(TunnelEvent::TunnelDone { payload });
        self.teardown().await;
    }

    /// Tear the tunnel down. Only the first call does anything.
    pub async fn close(&self) {
        if !self.inner.guard.begin_close() {
            debug!("Tunnel already closing");
            return;
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        info!("Closing tunnel");
        self.release_resources().await;
        self.inner.guard.finish_close();
        self.inner.events.emit(TunnelEvent::Close);
    }

    async fn release_resources(&self) {
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close();
        }
        self.inner.pool.close_all().await;
    }
}
