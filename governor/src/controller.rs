//! State machine controller.
//!
//! One controller task per machine owns the current state, the status
//! word and the message, and serializes command intake: commands are
//! applied strictly in arrival order. The abort flag is set out-of-band
//! by [`MachineHandle::abort`] so a running transition observes it
//! without waiting behind queued commands.
//!
//! While Idle and enabled, a periodic tick re-checks the held-in-state
//! predicate; any bound device outside its window, disconnected or
//! unhomed sends the machine to FAULT and parks it in the initial state
//! without motion.

use crate::executor::{run_transition, TransitionOutcome};
use crate::machine::Machine;
use governor_common::state::MachineStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Period of the held-in-state re-check while Idle.
pub const HELD_CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Commands accepted by a controller, in arrival order.
#[derive(Debug)]
pub enum Command {
    /// Start a transition to the named state.
    Go(String),
    /// Abort bookkeeping; the level-triggered flag is set separately.
    Abort,
    /// Selection by the supervisor.
    SetEnabled(bool),
}

/// Published view of one machine.
#[derive(Debug, Clone)]
pub struct MachineReport {
    /// Status word.
    pub status: MachineStatus,
    /// Current state key.
    pub state: String,
    /// Last message (rejections, fault details, arrivals).
    pub message: String,
    /// States a fresh `Go` could currently be accepted for.
    pub reachable: Vec<String>,
    /// Active transition edge while Busy.
    pub transition: Option<(String, String)>,
}

/// Cloneable handle to one controller task.
#[derive(Clone)]
pub struct MachineHandle {
    /// The compiled machine this controller drives.
    pub machine: Arc<Machine>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    abort: Arc<AtomicBool>,
    report_rx: watch::Receiver<MachineReport>,
}

impl MachineHandle {
    /// Machine name.
    pub fn name(&self) -> &str {
        &self.machine.name
    }

    /// Queue a `Go` command.
    pub fn go(&self, target: &str) {
        let _ = self.cmd_tx.send(Command::Go(target.to_string()));
    }

    /// Raise the abort signal and queue the bookkeeping command.
    ///
    /// The flag is level-triggered: a running executor observes it
    /// within one poll interval, without waiting behind queued commands.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Abort);
    }

    /// Select or deselect this machine.
    pub fn set_enabled(&self, enabled: bool) {
        let _ = self.cmd_tx.send(Command::SetEnabled(enabled));
    }

    /// Current published view.
    pub fn report(&self) -> MachineReport {
        self.report_rx.borrow().clone()
    }

    /// Watch the published view.
    pub fn subscribe(&self) -> watch::Receiver<MachineReport> {
        self.report_rx.clone()
    }

    /// True while a transition is executing.
    pub fn is_busy(&self) -> bool {
        self.report_rx.borrow().status == MachineStatus::Busy
    }
}

/// Spawn the controller task for a compiled machine.
///
/// Machines start Disabled in their initial state; the supervisor
/// selects one.
pub fn spawn(machine: Arc<Machine>, shutdown: watch::Receiver<bool>) -> MachineHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let abort = Arc::new(AtomicBool::new(false));
    let initial = MachineReport {
        status: MachineStatus::Disabled,
        state: machine.init_state.clone(),
        message: String::new(),
        reachable: Vec::new(),
        transition: None,
    };
    let (report_tx, report_rx) = watch::channel(initial);
    let controller = Controller {
        machine: machine.clone(),
        current: machine.init_state.clone(),
        status: MachineStatus::Disabled,
        message: String::new(),
        enabled: false,
        pending_disable: false,
        edge: None,
        abort: abort.clone(),
        report_tx,
    };
    tokio::spawn(controller.run(cmd_rx, shutdown));
    MachineHandle {
        machine,
        cmd_tx,
        abort,
        report_rx,
    }
}

struct Controller {
    machine: Arc<Machine>,
    current: String,
    status: MachineStatus,
    message: String,
    enabled: bool,
    pending_disable: bool,
    edge: Option<(String, String)>,
    abort: Arc<AtomicBool>,
    report_tx: watch::Sender<MachineReport>,
}

impl Controller {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut exec: Option<JoinHandle<TransitionOutcome>> = None;
        let mut held_tick = tokio::time::interval(HELD_CHECK_PERIOD);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(cmd) => self.handle_command(cmd, &mut exec),
                },
                outcome = join_outcome(&mut exec) => {
                    exec = None;
                    self.finish(outcome);
                }
                _ = held_tick.tick() => {
                    if exec.is_none() && self.enabled && self.status == MachineStatus::Idle {
                        self.held_check();
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        self.abort.store(true, Ordering::SeqCst);
                        if let Some(handle) = exec.take() {
                            let _ = handle.await;
                        }
                        debug!(machine = %self.machine.name, "controller stopping");
                        break;
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command, exec: &mut Option<JoinHandle<TransitionOutcome>>) {
        match cmd {
            Command::Go(target) => self.handle_go(target, exec),
            Command::Abort => {
                if exec.is_some() {
                    debug!(machine = %self.machine.name, "abort observed mid-transition");
                } else {
                    // Nothing running: consume the stale flag.
                    self.abort.store(false, Ordering::SeqCst);
                    self.message = "nothing to abort".to_string();
                    self.publish();
                }
            }
            Command::SetEnabled(enabled) => self.handle_set_enabled(enabled, exec),
        }
    }

    fn handle_go(&mut self, target: String, exec: &mut Option<JoinHandle<TransitionOutcome>>) {
        if !self.enabled {
            return self.reject(&target, "machine is disabled");
        }
        if exec.is_some() {
            return self.reject(&target, "a transition is in progress");
        }
        if target == self.machine.init_state {
            // Always accepted when not busy, including from FAULT; the
            // initial state binds nothing, so there is no motion.
            self.abort.store(false, Ordering::SeqCst);
            self.current = target;
            self.status = MachineStatus::Idle;
            self.message = format!("reached {}", self.current);
            self.edge = None;
            return self.publish();
        }
        if self.status == MachineStatus::Fault {
            return self.reject(
                &target,
                &format!("in FAULT, only {} is reachable", self.machine.init_state),
            );
        }
        if self.machine.stages(&self.current, &target).is_none() {
            return self.reject(&target, &format!("no transition {} -> {target}", self.current));
        }

        info!(machine = %self.machine.name, from = %self.current, to = %target, "transition start");
        self.status = MachineStatus::Busy;
        self.edge = Some((self.current.clone(), target.clone()));
        self.message = format!("transition {} -> {target}", self.current);
        self.publish();
        *exec = Some(tokio::spawn(run_transition(
            self.machine.clone(),
            self.current.clone(),
            target,
            self.abort.clone(),
        )));
    }

    fn handle_set_enabled(
        &mut self,
        enabled: bool,
        exec: &mut Option<JoinHandle<TransitionOutcome>>,
    ) {
        if enabled {
            self.enabled = true;
            self.pending_disable = false;
            // Recompute the held predicate on selection.
            match self.machine.held(&self.current) {
                Ok(()) => {
                    self.status = MachineStatus::Idle;
                    self.message = format!("enabled, holding {}", self.current);
                }
                Err(violations) => {
                    self.current = self.machine.init_state.clone();
                    self.status = MachineStatus::Fault;
                    self.message = fault_message(&violations);
                }
            }
            self.publish();
        } else if exec.is_some() {
            // Finish the abort path first; Disabled is applied once all
            // motion has ceased.
            self.abort.store(true, Ordering::SeqCst);
            self.pending_disable = true;
        } else {
            self.enabled = false;
            self.status = MachineStatus::Disabled;
            self.message = "disabled".to_string();
            self.publish();
        }
    }

    fn finish(&mut self, outcome: TransitionOutcome) {
        let (from, to) = self.edge.take().unwrap_or_default();
        match outcome {
            TransitionOutcome::Complete => {
                self.current = to;
                self.status = MachineStatus::Idle;
                self.message = format!("reached {}", self.current);
                info!(machine = %self.machine.name, state = %self.current, "transition complete");
            }
            TransitionOutcome::Failed(failures) => {
                self.current = self.machine.init_state.clone();
                self.status = MachineStatus::Fault;
                let detail = failures
                    .iter()
                    .map(|(dev, reason)| format!("{dev}: {reason}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.message = if detail.is_empty() {
                    format!("FAULT: transition {from} -> {to} failed")
                } else {
                    format!("FAULT: {detail}")
                };
                error!(machine = %self.machine.name, %from, %to, detail = %self.message, "transition failed");
            }
            TransitionOutcome::Aborted => {
                self.current = self.machine.init_state.clone();
                self.status = MachineStatus::Idle;
                self.message = format!("transition {from} -> {to} aborted");
                warn!(machine = %self.machine.name, %from, %to, "transition aborted");
            }
        }
        self.abort.store(false, Ordering::SeqCst);
        if self.pending_disable {
            self.pending_disable = false;
            self.enabled = false;
            self.status = MachineStatus::Disabled;
        }
        self.publish();
    }

    fn held_check(&mut self) {
        if let Err(violations) = self.machine.held(&self.current) {
            warn!(machine = %self.machine.name, state = %self.current, ?violations, "held check failed");
            self.current = self.machine.init_state.clone();
            self.status = MachineStatus::Fault;
            self.message = fault_message(&violations);
            self.publish();
        }
    }

    fn reject(&mut self, target: &str, reason: &str) {
        warn!(machine = %self.machine.name, %target, %reason, "Go rejected");
        self.message = format!("rejected Go({target}): {reason}");
        self.publish();
    }

    fn publish(&self) {
        let report = MachineReport {
            status: self.status,
            state: self.current.clone(),
            message: self.message.clone(),
            reachable: self.machine.reachable(&self.current, self.status),
            transition: self.edge.clone(),
        };
        self.report_tx.send_replace(report);
    }
}

fn fault_message(violations: &[(String, String)]) -> String {
    let detail = violations
        .iter()
        .map(|(dev, reason)| format!("{dev}: {reason}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("FAULT: {detail}")
}

async fn join_outcome(exec: &mut Option<JoinHandle<TransitionOutcome>>) -> TransitionOutcome {
    match exec {
        Some(handle) => match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("executor task failed: {e}");
                TransitionOutcome::Failed(Vec::new())
            }
        },
        None => std::future::pending().await,
    }
}
