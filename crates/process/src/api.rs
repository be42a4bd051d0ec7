use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::state::{Begin, RunningState, StateCell};
use crate::{BoxError, CloseOutcome, StartOutcome};

/// The server behind an `Api`, handed an already bound listener.
#[async_trait]
pub trait ApiListener
where
    Self: Send + Sync + 'static,
{
    /// Starts serving on `listener`. `Ok(false)` declines the start.
    async fn start(&self, listener: TcpListener) -> std::result::Result<bool, BoxError>;

    /// Stops serving. `Ok(false)` reports a failed close.
    async fn close(&self) -> std::result::Result<bool, BoxError>;
}

/// The front-door role of an instance.
pub struct Api {
    state: StateCell,
    listener: Arc<dyn ApiListener>,
    host: IpAddr,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Api {
    /// Creates a prepared API that binds on all interfaces.
    pub fn new(name: impl Into<String>, listener: Arc<dyn ApiListener>) -> Self {
        Self {
            state: StateCell::new("api", name, RunningState::Prepared),
            listener,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_addr: Mutex::new(None),
        }
    }

    /// Binds on `host` instead of all interfaces.
    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// The API's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunningState {
        self.state.get()
    }

    /// The bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    async fn bind(&self, ports: &[u16]) -> Result<(TcpListener, SocketAddr)> {
        let listener = if ports.is_empty() {
            TcpListener::bind((self.host, 0)).await?
        } else {
            let mut bound = None;
            for &port in ports {
                match TcpListener::bind((self.host, port)).await {
                    Ok(listener) => {
                        bound = Some(listener);
                        break;
                    }
                    Err(e) => debug!(api = %self.name(), port, error = %e, "port unavailable"),
                }
            }
            bound.ok_or_else(|| Error::PortsOccupied(ports.to_vec()))?
        };

        let addr = listener.local_addr()?;
        Ok((listener, addr))
    }

    /// Binds the first free port of `ports` (any free port when empty) and
    /// starts the listener on it.
    ///
    /// # Errors
    ///
    /// Fails if the API was never prepared or no port could be bound; the
    /// state is restored in the latter case.
    pub async fn start(&self, ports: &[u16]) -> Result<StartOutcome> {
        let previous = self.state();
        if self.state.begin_start()? == Begin::Ignored {
            return Ok(StartOutcome::Ignored);
        }

        let (listener, addr) = match self.bind(ports).await {
            Ok(bound) => bound,
            Err(e) => {
                error!(api = %self.name(), error = %e, "bind failed");
                self.state.set(previous);
                return Err(e);
            }
        };

        match self.listener.start(listener).await {
            Ok(true) => {
                *self.local_addr.lock() = Some(addr);
                self.state.set(RunningState::Running);
                info!(api = %self.name(), %addr, "api started");
                Ok(StartOutcome::Started)
            }
            Ok(false) => {
                warn!(api = %self.name(), "start failed, listener declined");
                self.state.set(RunningState::Closed);
                Ok(StartOutcome::Declined)
            }
            Err(e) => {
                error!(api = %self.name(), error = %e, "start errored");
                self.state.set(RunningState::Prepared);
                Ok(StartOutcome::Errored)
            }
        }
    }

    /// Closes the listener. A failed close leaves the API Running.
    ///
    /// # Errors
    ///
    /// Fails if the API was never prepared.
    pub async fn close(&self) -> Result<CloseOutcome> {
        if self.state.begin_close()? == Begin::Ignored {
            return Ok(CloseOutcome::Ignored);
        }

        match self.listener.close().await {
            Ok(true) => {
                *self.local_addr.lock() = None;
                self.state.set(RunningState::Closed);
                info!(api = %self.name(), "api closed");
                Ok(CloseOutcome::Closed)
            }
            Ok(false) => {
                warn!(api = %self.name(), "close failed");
                self.state.set(RunningState::Running);
                Ok(CloseOutcome::Failed)
            }
            Err(e) => {
                error!(api = %self.name(), error = %e, "close errored");
                self.state.set(RunningState::Running);
                Ok(CloseOutcome::Failed)
            }
        }
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use tokio::sync::oneshot;

    struct Echo {
        shutdown: Mutex<Option<oneshot::Sender<()>>>,
        accept: bool,
        close_ok: bool,
    }

    impl Echo {
        fn new(accept: bool, close_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                shutdown: Mutex::new(None),
                accept,
                close_ok,
            })
        }
    }

    #[async_trait]
    impl ApiListener for Echo {
        async fn start(&self, listener: TcpListener) -> std::result::Result<bool, BoxError> {
            if !self.accept {
                return Ok(false);
            }

            let (tx, mut rx) = oneshot::channel();
            *self.shutdown.lock() = Some(tx);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut rx => break,
                        accepted = listener.accept() => {
                            if accepted.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Ok(true)
        }

        async fn close(&self) -> std::result::Result<bool, BoxError> {
            if !self.close_ok {
                return Err("listener stuck".into());
            }
            if let Some(tx) = self.shutdown.lock().take() {
                let _ = tx.send(());
            }
            Ok(true)
        }
    }

    fn localhost(listener: Arc<dyn ApiListener>) -> Api {
        Api::new("test", listener).with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_binds_any_port_when_unrestricted() {
        let api = localhost(Echo::new(true, true));

        assert_matches!(api.start(&[]).await, Ok(StartOutcome::Started));
        assert_eq!(api.state(), RunningState::Running);
        let addr = api.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        tokio::net::TcpStream::connect(addr).await.unwrap();

        assert_matches!(api.start(&[]).await, Ok(StartOutcome::Ignored));
        assert_matches!(api.close().await, Ok(CloseOutcome::Closed));
        assert_eq!(api.state(), RunningState::Closed);
        assert!(api.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_skips_occupied_ports() {
        let (_held, taken) = occupied_port().await;
        let free = {
            let (listener, port) = occupied_port().await;
            drop(listener);
            port
        };
        let api = localhost(Echo::new(true, true));

        assert_matches!(api.start(&[taken, free]).await, Ok(StartOutcome::Started));
        assert_eq!(api.local_addr().unwrap().port(), free);
    }

    #[tokio::test]
    async fn test_all_ports_occupied() {
        let (_held, taken) = occupied_port().await;
        let api = localhost(Echo::new(true, true));

        assert_matches!(
            api.start(&[taken]).await,
            Err(Error::PortsOccupied(ports)) if ports == [taken]
        );
        assert_eq!(api.state(), RunningState::Prepared);
    }

    #[tokio::test]
    async fn test_declined_start() {
        let api = localhost(Echo::new(false, true));

        assert_matches!(api.start(&[]).await, Ok(StartOutcome::Declined));
        assert_eq!(api.state(), RunningState::Closed);
        assert!(api.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_failed_close_rolls_back() {
        let api = localhost(Echo::new(true, false));
        api.start(&[]).await.unwrap();

        assert_matches!(api.close().await, Ok(CloseOutcome::Failed));
        assert_eq!(api.state(), RunningState::Running);
        assert!(api.local_addr().is_some());
    }

    #[tokio::test]
    async fn test_close_before_start_is_ignored() {
        let api = localhost(Echo::new(true, true));

        assert_matches!(api.close().await, Ok(CloseOutcome::Ignored));
        assert_eq!(api.state(), RunningState::Prepared);
    }
}
