//! Connection supervisor.
//!
//! One task owns the link for its whole life and walks an explicit state machine:
//!
//! ```text
//!  Disconnected ──start──→ Connecting ──established──→ Connected
//!                            ↑   │                         │
//!                 backoff    │   │ attempt failed          │ link lost
//!                 elapsed    │   ↓                         ↓
//!                           BackingOff ←───────────────────┘
//! ```
//!
//! * Delays grow exponentially from `initial` by `multiplier` and are capped at `max`;
//!   a successful connect resets the sequence.
//! * Sends are only executed in `Connected`. A request that arrives while connecting or
//!   backing off is answered with [`TransportError::NotConnected`] at once.
//! * Because the same task performs sends and reconnects, the two never overlap.
//! * Nothing but the link handle is per-connection; dispatcher state survives outages.
//!
//! The handle/command-channel shape follows the outbound scheduler pattern: a cloneable
//! handle wraps an unbounded command channel and answers through `oneshot` replies.

use log::{debug, info, trace, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Connector, Link, ReplyTarget, TransportError, TransportEvent};

/// Consecutive send timeouts after which a link is considered dead.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Supervisor state. Only [`ConnectionState::Connected`] permits sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    BackingOff { attempt: u32, delay: Duration },
}

/// Inputs that drive [`ConnectionState::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Start,
    Established,
    AttemptFailed { attempt: u32, delay: Duration },
    LinkLost { attempt: u32, delay: Duration },
    BackoffElapsed,
    Stop,
}

impl ConnectionState {
    /// Pure transition function. Events that make no sense in the current state leave
    /// it unchanged.
    pub fn next(&self, event: &SupervisorEvent) -> ConnectionState {
        use ConnectionState::*;
        match (self, event) {
            (_, SupervisorEvent::Stop) => Disconnected,
            (Disconnected, SupervisorEvent::Start) => Connecting,
            (Connecting, SupervisorEvent::Established) => Connected,
            (Connecting, SupervisorEvent::AttemptFailed { attempt, delay }) => BackingOff {
                attempt: *attempt,
                delay: *delay,
            },
            (Connected, SupervisorEvent::LinkLost { attempt, delay }) => BackingOff {
                attempt: *attempt,
                delay: *delay,
            },
            (BackingOff { .. }, SupervisorEvent::BackoffElapsed) => Connecting,
            (state, _) => state.clone(),
        }
    }

    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1),
            attempt: 0,
        }
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.saturating_pow(self.attempt);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2)
    }
}

/// Supervisor tuning, typically sourced from Config.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(10),
        }
    }
}

struct SendRequest {
    target: ReplyTarget,
    text: String,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

enum SupervisorCommand {
    Send(SendRequest),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front end to the supervising task.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorCommand>,
    state: watch::Receiver<ConnectionState>,
    send_timeout: Duration,
}

impl std::fmt::Debug for SupervisorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorCommand::Send(req) => write!(f, "Send({})", req.target),
            SupervisorCommand::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

impl SupervisorHandle {
    /// Send a text. Fails fast with `NotConnected` outside the connected state and
    /// never waits longer than twice the configured send timeout.
    pub async fn send(&self, target: ReplyTarget, text: String) -> Result<(), TransportError> {
        if !self.state.borrow().can_send() {
            return Err(TransportError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Send(SendRequest {
                target,
                text,
                reply,
            }))
            .map_err(|_| TransportError::Closed)?;
        match timeout(self.send_timeout.saturating_mul(2), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the link and stop reconnecting. Returns once the task has stopped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SupervisorCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the supervising task.
pub fn start_supervisor<C: Connector>(
    connector: C,
    cfg: SupervisorConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let handle = SupervisorHandle {
        tx,
        state: state_rx,
        send_timeout: cfg.send_timeout,
    };
    let supervisor = Supervisor {
        backoff: cfg.backoff.clone(),
        cfg,
        connector,
        commands: rx,
        events,
        state: ConnectionState::Disconnected,
        state_tx,
        consecutive_timeouts: 0,
    };
    let task = tokio::spawn(supervisor.run());
    (handle, task)
}

enum Attempt<L> {
    Connected(L),
    Failed,
    Stop(Option<oneshot::Sender<()>>),
}

enum Served {
    Lost,
    Stopped(Option<oneshot::Sender<()>>),
}

struct Supervisor<C: Connector> {
    cfg: SupervisorConfig,
    backoff: Backoff,
    connector: C,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    consecutive_timeouts: u32,
}

impl<C: Connector> Supervisor<C> {
    fn transition(&mut self, event: SupervisorEvent) {
        let next = self.state.next(&event);
        if next != self.state {
            debug!("connection state {:?} -> {:?} ({:?})", self.state, next, event);
            self.state = next.clone();
            let _ = self.state_tx.send(next);
        } else {
            trace!("connection event {:?} ignored in {:?}", event, self.state);
        }
    }

    async fn run(mut self) {
        let target = self.connector.describe();
        self.transition(SupervisorEvent::Start);
        let done = loop {
            let link = match self.connect_once().await {
                Attempt::Connected(link) => link,
                Attempt::Failed => {
                    let delay = self.backoff.next_delay();
                    self.transition(SupervisorEvent::AttemptFailed {
                        attempt: self.backoff.attempt(),
                        delay,
                    });
                    match self.back_off(delay).await {
                        None => continue,
                        Some(done) => break done,
                    }
                }
                Attempt::Stop(done) => break done,
            };

            self.backoff.reset();
            self.consecutive_timeouts = 0;
            self.transition(SupervisorEvent::Established);
            match link.device_info() {
                Some(info) => {
                    info!("Connected to {} ({})", target, info.name);
                    let _ = self.events.send(TransportEvent::Ready(info));
                }
                None => info!("Connected to {}", target),
            }

            match self.serve(link).await {
                Served::Lost => {
                    warn!("Connection to {} lost, waiting for reconnect...", target);
                    let _ = self.events.send(TransportEvent::Lost);
                    let delay = self.backoff.next_delay();
                    self.transition(SupervisorEvent::LinkLost {
                        attempt: self.backoff.attempt(),
                        delay,
                    });
                    if let Some(done) = self.back_off(delay).await {
                        break done;
                    }
                }
                Served::Stopped(done) => break done,
            }
        };
        self.transition(SupervisorEvent::Stop);
        info!("Connection supervisor stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// One connect attempt. Sends observed meanwhile are refused.
    async fn connect_once(&mut self) -> Attempt<C::Link> {
        let connect = timeout(self.cfg.connect_timeout, self.connector.connect());
        tokio::pin!(connect);
        loop {
            tokio::select! {
                res = &mut connect => {
                    return match res {
                        Ok(Ok(link)) => Attempt::Connected(link),
                        Ok(Err(e)) => {
                            warn!("Connect attempt failed: {}", e);
                            Attempt::Failed
                        }
                        Err(_) => {
                            warn!("Connect attempt timed out after {:?}", self.cfg.connect_timeout);
                            Attempt::Failed
                        }
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SupervisorCommand::Send(req)) => {
                        let _ = req.reply.send(Err(TransportError::NotConnected));
                    }
                    Some(SupervisorCommand::Shutdown(done)) => return Attempt::Stop(Some(done)),
                    None => return Attempt::Stop(None),
                },
            }
        }
    }

    /// Sleep out a backoff delay. `Some` means shutdown was requested meanwhile.
    async fn back_off(&mut self, delay: Duration) -> Option<Option<oneshot::Sender<()>>> {
        debug!("Backing off for {:?}", delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = self.commands.recv() => match cmd {
                    Some(SupervisorCommand::Send(req)) => {
                        let _ = req.reply.send(Err(TransportError::NotConnected));
                    }
                    Some(SupervisorCommand::Shutdown(done)) => return Some(Some(done)),
                    None => return Some(None),
                },
            }
        }
        self.transition(SupervisorEvent::BackoffElapsed);
        None
    }

    /// Pump frames and requests until the link fails or shutdown is requested.
    async fn serve(&mut self, mut link: C::Link) -> Served {
        loop {
            tokio::select! {
                frame = link.next_frame() => {
                    let Some(frame) = frame else {
                        debug!("Link closed by peer");
                        link.close().await;
                        return Served::Lost;
                    };
                    match link.process(frame).await {
                        Ok(Some(msg)) => {
                            if self.events.send(TransportEvent::Message(msg)).is_err() {
                                debug!("Event receiver gone; stopping");
                                link.close().await;
                                return Served::Stopped(None);
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_link_fault() => {
                            warn!("Link fault while reading: {}", e);
                            link.close().await;
                            return Served::Lost;
                        }
                        Err(e) => debug!("Dropped inbound frame: {}", e),
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SupervisorCommand::Send(req)) => {
                        if req.reply.is_closed() {
                            debug!("Dropping stale send to {}: caller gave up", req.target);
                            continue;
                        }
                        let result = match timeout(self.cfg.send_timeout, link.send(&req.target, &req.text)).await {
                            Ok(result) => result,
                            Err(_) => Err(TransportError::Timeout),
                        };
                        let fault = match &result {
                            Ok(()) => {
                                self.consecutive_timeouts = 0;
                                false
                            }
                            Err(TransportError::Timeout) => {
                                self.consecutive_timeouts += 1;
                                self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS
                            }
                            Err(e) => e.is_link_fault(),
                        };
                        let _ = req.reply.send(result);
                        if fault {
                            warn!("Link unusable after send failure to {}", req.target);
                            link.close().await;
                            return Served::Lost;
                        }
                    }
                    Some(SupervisorCommand::Shutdown(done)) => {
                        link.close().await;
                        return Served::Stopped(Some(done));
                    }
                    None => {
                        link.close().await;
                        return Served::Stopped(None);
                    }
                },
            }
        }
    }
}
