//! Asynchronous polling/command session with the MAS controller.
//!
//! The session loop owns the TCP connection and drives all network I/O. It
//! talks to the outside world through exactly three channels:
//!
//! - an unbounded command queue (any number of producers, the loop consumes),
//! - a bounded event channel carrying status samples and reconnect
//!   notifications (the producer blocks when the consumer lags - events are
//!   never dropped),
//! - a reconnect decision channel resolving a reconnect-needed notification
//!   into retry or abort.
//!
//! Each cycle either forwards one queued command to the controller or polls
//! it for a status sample, which is stamped, recorded into the shared
//! [`History`], and emitted as an event. A reply timeout triggers a bounded
//! in-place recovery (probing the connection for up to four timeout windows)
//! before the failure is surfaced; surfaced failures always go to the
//! operator as an explicit reconnect handshake, never a silent retry. A stop
//! directive (the `running` watch) wins over every wait.
//!
//! An offline variant generates a deterministic synthetic spin ramp for
//! development without hardware; its event stream is shaped exactly like the
//! real one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ControllerAddress;
use crate::connection::Connection;
use crate::error::{MasError, MasResult};
use crate::history::{History, Sample};
use crate::protocol::CommandTable;

/// Command code polling the full status report.
const STATUS_COMMAND: &str = "AS";

/// Command code querying the spin set-point.
const SET_POINT_COMMAND: &str = "VD";

/// Event channel capacity. The producer blocks when the consumer lags this
/// far behind; nothing is ever discarded.
const EVENT_CAPACITY: usize = 64;

/// Number of points in one offline ramp pass.
const RAMP_POINTS: i64 = 100;

/// Immutable snapshot of the controller's reported state.
///
/// Field values are the controller's raw decimal text. Field-wise equality
/// lets a frontend suppress redundant display updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    /// Measured spin rate, Hz.
    pub spin: String,
    /// Drive pressure, mBar.
    pub drive: String,
    /// Bearing pressure, mBar.
    pub bearing: String,
    /// Bearing sense pressure, mBar.
    pub sense: String,
    /// Spin rate set-point, Hz.
    pub spin_set: String,
}

impl ControllerStatus {
    /// Build a status from the status reply tokens and the set-point reply.
    ///
    /// The status reply carries an echo token followed by the four readings;
    /// anything else is a protocol error (the stream is out of step).
    fn from_poll(status_tokens: &[String], spin_set: String) -> MasResult<Self> {
        match status_tokens {
            [_, spin, drive, bearing, sense] => Ok(Self {
                spin: spin.clone(),
                drive: drive.clone(),
                bearing: bearing.clone(),
                sense: sense.clone(),
                spin_set,
            }),
            _ => Err(MasError::Protocol(format!(
                "unexpected status reply: {status_tokens:?}"
            ))),
        }
    }

    fn ramp(n: i64) -> Self {
        Self {
            spin: n.to_string(),
            drive: "0".into(),
            bearing: "0".into(),
            sense: "0".into(),
            spin_set: "0".into(),
        }
    }

    /// The measured spin rate as a number.
    pub fn spin_rate(&self) -> MasResult<i64> {
        self.spin
            .trim()
            .parse()
            .map_err(|_| MasError::Protocol(format!("unparseable spin rate '{}'", self.spin)))
    }
}

/// One operator command bound for the controller.
#[derive(Debug, Clone)]
pub struct Command {
    /// Two-character command code.
    pub code: String,
    /// Arguments, already rendered as text.
    pub args: Vec<String>,
}

impl Command {
    /// Build a command from a code and its arguments.
    pub fn new(code: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            code: code.into(),
            args,
        }
    }
}

/// Events emitted by the session loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A fresh status sample.
    Status {
        /// The polled controller state.
        status: ControllerStatus,
        /// When the sample was taken.
        time: DateTime<Local>,
    },
    /// The connection died; the loop is idle until the operator decides.
    ReconnectNeeded {
        /// Human-readable cause, worded for the likely remedy.
        cause: String,
    },
}

/// Operator resolution of a reconnect-needed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Open a fresh connection and resume.
    Retry,
    /// Give up; the loop stops.
    Abort,
}

/// Pacing and timeout intervals for the session loop.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Reply timeout `T` for every command.
    pub reply_timeout: Duration,
    /// Pause after each status poll.
    pub poll_pause: Duration,
    /// Pause after each forwarded command (controller turnaround time).
    pub command_pause: Duration,
    /// Spacing of connectivity probes during timeout recovery.
    pub probe_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(3),
            poll_pause: Duration::from_secs(1),
            command_pause: Duration::from_millis(50),
            probe_interval: Duration::from_millis(100),
        }
    }
}

impl SessionTiming {
    /// Total window allowed for in-place timeout recovery.
    fn recovery_window(&self) -> Duration {
        self.reply_timeout * 4
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Controller endpoint.
    pub address: ControllerAddress,
    /// Command vocabulary for validation.
    pub table: CommandTable,
    /// Pacing and timeouts.
    pub timing: SessionTiming,
    /// Generate synthetic data instead of talking to hardware.
    pub offline: bool,
}

/// Frontend-side handle to a running session loop.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    decisions: mpsc::Sender<ReconnectDecision>,
    running: watch::Sender<bool>,
    table: CommandTable,
}

impl SessionHandle {
    /// Queue a command for the controller.
    ///
    /// The code and arity are validated here, before queueing, so a bad
    /// command is rejected while the caller can still do something about it.
    pub fn send_command(&self, command: Command) -> MasResult<()> {
        self.table.validate(&command.code, &command.args)?;
        self.commands
            .send(command)
            .map_err(|_| MasError::Connection("session loop has stopped".into()))
    }

    /// A cloneable raw queue producer for additional command sources.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    /// Resolve a pending reconnect notification.
    pub fn resolve_reconnect(&self, decision: ReconnectDecision) {
        let _ = self.decisions.try_send(decision);
    }

    /// Direct the loop to stop. Takes effect within one cycle, and
    /// immediately interrupts a reconnect wait.
    pub fn stop(&self) {
        let _ = self.running.send(false);
    }
}

/// The session loop itself. Create with [`SessionLoop::new`], then drive the
/// future returned by [`SessionLoop::run`] (usually via [`spawn_session`]).
pub struct SessionLoop {
    options: SessionOptions,
    history: Arc<Mutex<History>>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<SessionEvent>,
    decisions: mpsc::Receiver<ReconnectDecision>,
    running: watch::Receiver<bool>,
    /// Set when a counterpart channel closed; the loop winds down as if
    /// stopped.
    halted: bool,
}

/// Start a session loop on the current runtime.
pub fn spawn_session(
    options: SessionOptions,
    history: Arc<Mutex<History>>,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>, JoinHandle<()>) {
    let (session, handle, events) = SessionLoop::new(options, history);
    let join = tokio::spawn(session.run());
    (handle, events, join)
}

impl SessionLoop {
    /// Wire up a session loop and its frontend endpoints.
    pub fn new(
        options: SessionOptions,
        history: Arc<Mutex<History>>,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (decision_tx, decision_rx) = mpsc::channel(1);
        let (running_tx, running_rx) = watch::channel(true);

        let handle = SessionHandle {
            commands: command_tx,
            decisions: decision_tx,
            running: running_tx,
            table: options.table.clone(),
        };
        let session = Self {
            options,
            history,
            commands: command_rx,
            events: event_tx,
            decisions: decision_rx,
            running: running_rx,
            halted: false,
        };
        (session, handle, event_rx)
    }

    /// Run until stopped or aborted.
    pub async fn run(mut self) {
        info!(offline = self.options.offline, "session loop starting");
        while self.active() {
            if self.options.offline {
                self.run_offline().await;
                continue;
            }

            match self.run_connection().await {
                Ok(()) => break,
                Err(err) => {
                    if !self.active() {
                        break;
                    }
                    warn!(%err, "connection lost");
                    self.push_masked_sample();
                    let cause = reconnect_cause(&err).to_owned();
                    if self.events.send(SessionEvent::ReconnectNeeded { cause }).await.is_err() {
                        break;
                    }
                    match self.await_decision().await {
                        ReconnectDecision::Retry => continue,
                        ReconnectDecision::Abort => break,
                    }
                }
            }
        }
        info!("session loop stopped");
    }

    fn active(&self) -> bool {
        !self.halted && *self.running.borrow()
    }

    /// One connection's lifetime: open, cycle until stop or failure, close.
    /// The socket is released (after its grace delay) on every exit path.
    async fn run_connection(&mut self) -> MasResult<()> {
        let mut conn =
            Connection::open(&self.options.address, self.options.table.clone()).await?;
        conn.set_timeout(self.options.timing.reply_timeout);
        let result = self.drive(&mut conn).await;
        conn.close().await;
        result
    }

    async fn drive(&mut self, conn: &mut Connection) -> MasResult<()> {
        while self.active() {
            match self.cycle(conn).await {
                Ok(()) => {}
                Err(MasError::Timeout(cause)) => {
                    warn!("controller reply timed out, probing connection");
                    if self.retry_connection(conn).await {
                        info!("connection recovered, resuming");
                        continue;
                    }
                    return Err(MasError::Timeout(cause));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// One Active cycle: forward a queued command, or poll for status.
    async fn cycle(&mut self, conn: &mut Connection) -> MasResult<()> {
        match self.commands.try_recv() {
            Ok(command) => {
                // Fire and forget: the reply is read to keep lock-step but
                // not inspected.
                match conn.send_command(&command.code, &command.args).await {
                    Ok(_) => {}
                    Err(MasError::Protocol(err)) => {
                        // The handle validates before queueing, so a table
                        // rejection here means a stale queue entry; drop the
                        // command, not the connection.
                        warn!(%err, code = %command.code, "dropping rejected command");
                    }
                    Err(err) => return Err(err),
                }
                sleep(self.options.timing.command_pause).await;
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                let (status, time) = self.poll_status(conn).await?;
                self.ingest(&status, time);
                if self
                    .events
                    .send(SessionEvent::Status { status, time })
                    .await
                    .is_err()
                {
                    self.halted = true;
                    return Ok(());
                }
                sleep(self.options.timing.poll_pause).await;
            }
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.halted = true;
            }
        }
        Ok(())
    }

    /// Poll the controller: full status report, then the spin set-point,
    /// combined positionally into one stamped snapshot.
    async fn poll_status(
        &mut self,
        conn: &mut Connection,
    ) -> MasResult<(ControllerStatus, DateTime<Local>)> {
        let status_tokens = conn.send_command(STATUS_COMMAND, &[]).await?;
        sleep(self.options.timing.command_pause).await;
        let time = Local::now();
        let set_tokens = conn.send_command(SET_POINT_COMMAND, &[]).await?;
        let spin_set = set_tokens
            .into_iter()
            .next()
            .ok_or_else(|| MasError::Protocol("empty set-point reply".into()))?;
        let status = ControllerStatus::from_poll(&status_tokens, spin_set)?;
        Ok((status, time))
    }

    /// Bounded in-place recovery after a reply timeout.
    ///
    /// Probes the connection every probe interval for up to four timeout
    /// windows. On a successful probe, waits one more timeout window for the
    /// stale reply to land, discards it, and reports success.
    async fn retry_connection(&mut self, conn: &mut Connection) -> bool {
        let deadline = Instant::now() + self.options.timing.recovery_window();
        while Instant::now() < deadline {
            if !self.active() {
                return false;
            }
            if conn.test_connection().await {
                sleep(self.options.timing.reply_timeout).await;
                conn.discard_pending().await;
                return true;
            }
            sleep(self.options.timing.probe_interval).await;
        }
        false
    }

    /// Idle-wait for the operator's reconnect decision. A stop directive
    /// resolves the wait immediately as an abort.
    async fn await_decision(&mut self) -> ReconnectDecision {
        loop {
            tokio::select! {
                decision = self.decisions.recv() => {
                    return decision.unwrap_or(ReconnectDecision::Abort);
                }
                changed = self.running.changed() => {
                    if changed.is_err() || !*self.running.borrow() {
                        return ReconnectDecision::Abort;
                    }
                }
            }
        }
    }

    /// Record a status sample into the shared history.
    fn ingest(&self, status: &ControllerStatus, time: DateTime<Local>) {
        let sample = match status.spin_rate() {
            Ok(rate) => Sample::Value(rate),
            Err(err) => {
                warn!(%err, "status carried an unparseable spin rate");
                return;
            }
        };
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = history.add_point(time, sample) {
            warn!(%err, "failed to record history point");
        }
    }

    /// Mark a gap in the history (connection lost, or end of an offline
    /// ramp).
    fn push_masked_sample(&self) {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = history.add_point(Local::now(), Sample::Masked) {
            warn!(%err, "failed to record history gap");
        }
    }

    /// Generate one pass of synthetic spinning data.
    ///
    /// Ramps the reported spin rate from 0 to 100, draining (and merely
    /// logging) any queued commands, and ends the pass with a masked gap
    /// sample. Events are shaped exactly like the live path's.
    async fn run_offline(&mut self) {
        for n in 0..RAMP_POINTS {
            if !self.active() {
                return;
            }
            match self.commands.try_recv() {
                Ok(command) => {
                    debug!(code = %command.code, args = ?command.args, "offline, discarding command");
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    let status = ControllerStatus::ramp(n);
                    let time = Local::now();
                    self.ingest(&status, time);
                    if self
                        .events
                        .send(SessionEvent::Status { status, time })
                        .await
                        .is_err()
                    {
                        self.halted = true;
                        return;
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.halted = true;
                    return;
                }
            }
            sleep(self.options.timing.command_pause).await;
        }
        self.push_masked_sample();
    }
}

/// Operator-facing cause text for a dead connection. Timeouts and socket
/// failures get different wording because their remedies differ.
fn reconnect_cause(err: &MasError) -> &'static str {
    match err {
        MasError::Timeout(_) => "Timeout error: Check that the MAS controller is in remote mode.",
        _ => {
            "Connection error: Check that no other programs are connected to the MAS controller.\n\
             You may need to enter \"set mas off\" in RNMRA"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn test_table() -> CommandTable {
        CommandTable::parse("MASCMD\nMA MA,0,1\nAS AS,0,5\nVD VD,0,1\nDS DS,1,1\n").unwrap()
    }

    fn offline_options() -> SessionOptions {
        SessionOptions {
            address: ControllerAddress {
                node: "127.0.0.1".into(),
                port: 1,
            },
            table: test_table(),
            timing: SessionTiming {
                reply_timeout: Duration::from_millis(50),
                poll_pause: Duration::from_millis(1),
                command_pause: Duration::from_millis(1),
                probe_interval: Duration::from_millis(1),
            },
            offline: true,
        }
    }

    fn shared_history() -> Arc<Mutex<History>> {
        Arc::new(Mutex::new(History::new(TimeDelta::hours(24), None)))
    }

    #[test]
    fn status_from_poll_is_positional() {
        let tokens: Vec<String> = ["AS", "4500", "2100", "1800", "1750"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let status = ControllerStatus::from_poll(&tokens, "4600".into()).unwrap();
        assert_eq!(status.spin, "4500");
        assert_eq!(status.drive, "2100");
        assert_eq!(status.bearing, "1800");
        assert_eq!(status.sense, "1750");
        assert_eq!(status.spin_set, "4600");
        assert_eq!(status.spin_rate().unwrap(), 4500);
    }

    #[test]
    fn status_from_poll_rejects_short_reply() {
        let tokens: Vec<String> = ["AS", "4500"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            ControllerStatus::from_poll(&tokens, "0".into()),
            Err(MasError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn handle_validates_before_queueing() {
        let (_session, handle, _events) = SessionLoop::new(offline_options(), shared_history());
        assert!(matches!(
            handle.send_command(Command::new("ZZ", vec![])),
            Err(MasError::Protocol(_))
        ));
        assert!(matches!(
            handle.send_command(Command::new("DS", vec![])),
            Err(MasError::Protocol(_))
        ));
        assert!(handle
            .send_command(Command::new("DS", vec!["5000".into()]))
            .is_ok());
    }

    #[tokio::test]
    async fn offline_ramp_emits_statuses_and_ends_with_gap() {
        let history = shared_history();
        let (handle, mut events, join) = spawn_session(offline_options(), history.clone());

        for expected in 0..RAMP_POINTS {
            match events.recv().await {
                Some(SessionEvent::Status { status, .. }) => {
                    assert_eq!(status.spin, expected.to_string());
                    assert_eq!(status.drive, "0");
                }
                other => panic!("expected status event, got {other:?}"),
            }
        }
        handle.stop();
        join.await.unwrap();

        let history = history.lock().unwrap();
        assert!(history.len() > RAMP_POINTS as usize);
        let (_, values) = history.active_range(TimeDelta::days(365)).unwrap();
        assert_eq!(values[0], Sample::Value(0));
        assert_eq!(values[RAMP_POINTS as usize - 1], Sample::Value(RAMP_POINTS - 1));
        assert_eq!(values[RAMP_POINTS as usize], Sample::Masked);
    }

    #[tokio::test]
    async fn offline_drains_queued_commands() {
        let history = shared_history();
        let (handle, mut events, join) = spawn_session(offline_options(), history);

        handle
            .send_command(Command::new("GM", vec![]))
            .unwrap_err(); // GM not in the test table
        handle
            .send_command(Command::new("DS", vec!["5000".into()]))
            .unwrap();

        // The first ramp slot goes to the queued command, so the first
        // emitted status carries spin "1".
        match events.recv().await {
            Some(SessionEvent::Status { status, .. }) => assert_eq!(status.spin, "1"),
            other => panic!("expected status event, got {other:?}"),
        }
        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn stop_interrupts_offline_ramp_promptly() {
        let history = shared_history();
        let (handle, mut events, join) = spawn_session(offline_options(), history);

        assert!(events.recv().await.is_some());
        handle.stop();
        // Keep draining so the loop can't block on a full event channel.
        while events.recv().await.is_some() {}
        join.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_event_consumer_halts_loop() {
        let history = shared_history();
        let (_handle, events, join) = spawn_session(offline_options(), history);
        drop(events);
        join.await.unwrap();
    }
}
