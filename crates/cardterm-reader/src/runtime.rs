//! The reader runtime task.
//!
//! One task owns the [`ReaderContext`] and applies, in arrival order,
//! scheduler ticks, link events from both sub-protocols and commands from
//! session workers. After each of them the status snapshot is recomputed
//! and published if it changed.
//!
//! [`RuntimeHandle`] is the only way in from other tasks and threads.

use std::time::{Duration, Instant};

use cardterm_core::SubProtocol;
use cardterm_network::LinkEvent;
use cardterm_protocol::{CommandCode, CorrelationKey, Message};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::apdu::ApduResponse;
use crate::auth::{self, AuthFailure};
use crate::config::ReaderSettings;
use crate::context::ReaderContext;
use crate::device::DeviceEvent;
use crate::error::{ReaderError, Result};
use crate::status::StatusSnapshot;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Requests from outside the runtime task.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// APDU for the detected SAM, over transit.
    SamApdu {
        apdu: Vec<u8>,
        reply: oneshot::Sender<Result<ApduResponse>>,
    },
    /// APDU for the card in the field, over IFSF.
    CardApdu {
        apdu: Vec<u8>,
        reply: oneshot::Sender<Result<ApduResponse>>,
    },
    /// Restart SAM authentication; replies with the new run number.
    RestartAuth { reply: oneshot::Sender<Result<u64>> },
    /// Outcome of auth run `run`, if it is the current one and finished.
    AuthOutcome {
        run: u64,
        reply: oneshot::Sender<Option<std::result::Result<(), AuthFailure>>>,
    },
    SetUnlocked {
        unlocked: bool,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle to a running reader runtime.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<RuntimeCommand>,
    status: watch::Receiver<StatusSnapshot>,
    events: broadcast::Sender<DeviceEvent>,
}

impl RuntimeHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RuntimeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ReaderError::RuntimeStopped)?;
        rx.await.map_err(|_| ReaderError::RuntimeStopped)
    }

    /// Exchange one APDU with the SAM.
    ///
    /// # Errors
    /// `Precondition` if no SAM is detected or the transit application is
    /// down, `NoResponse` on timeout or link loss.
    pub async fn sam_apdu(&self, apdu: Vec<u8>) -> Result<ApduResponse> {
        self.request(|reply| RuntimeCommand::SamApdu { apdu, reply }).await?
    }

    /// Exchange one APDU with the card in the field.
    pub async fn card_apdu(&self, apdu: Vec<u8>) -> Result<ApduResponse> {
        self.request(|reply| RuntimeCommand::CardApdu { apdu, reply }).await?
    }

    pub async fn restart_auth(&self) -> Result<u64> {
        self.request(|reply| RuntimeCommand::RestartAuth { reply }).await?
    }

    /// Returns `true` if the unlock flag changed.
    pub async fn set_unlocked(&self, unlocked: bool) -> Result<bool> {
        self.request(|reply| RuntimeCommand::SetUnlocked { unlocked, reply })
            .await
    }

    /// Latest published snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// # Errors
    /// `Timeout` if none does within `timeout`, `RuntimeStopped` if the
    /// runtime went away first.
    pub async fn wait_for_status(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> Result<StatusSnapshot> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(timeout, async move {
            status
                .wait_for(|snapshot| predicate(snapshot))
                .await
                .map(|snapshot| snapshot.clone())
        })
        .await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(ReaderError::RuntimeStopped),
            Err(_) => Err(ReaderError::Timeout(format!(
                "status condition not met within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Wait for auth run `run` to finish and return its outcome.
    ///
    /// # Errors
    /// `Precondition` if another restart superseded the run.
    pub async fn wait_auth_finished(
        &self,
        run: u64,
        timeout: Duration,
    ) -> Result<std::result::Result<(), AuthFailure>> {
        let snapshot = self
            .wait_for_status(timeout, |s| {
                s.auth_run > run || (s.auth_run == run && s.auth_state.is_finished())
            })
            .await?;
        if snapshot.auth_run != run {
            return Err(ReaderError::precondition(
                "authentication was restarted by someone else",
            ));
        }
        self.request(|reply| RuntimeCommand::AuthOutcome { run, reply })
            .await?
            .ok_or_else(|| ReaderError::precondition("authentication was restarted by someone else"))
    }

    /// Ask the runtime to stop. Idempotent.
    pub async fn shutdown(&self) {
        // Already stopped is fine.
        let _ = self.commands.send(RuntimeCommand::Shutdown).await;
    }
}

struct ReaderRuntime {
    ctx: ReaderContext,
    status: watch::Sender<StatusSnapshot>,
}

/// Spawn the runtime task over the given link event streams.
///
/// Must be called from within a tokio runtime.
pub fn spawn_runtime(
    settings: ReaderSettings,
    transit: mpsc::Receiver<LinkEvent>,
    ifsf: mpsc::Receiver<LinkEvent>,
) -> (RuntimeHandle, JoinHandle<()>) {
    let ctx = ReaderContext::new(settings);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::capture(&ctx));
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let handle = RuntimeHandle {
        commands: commands_tx,
        status: status_rx,
        events: ctx.device.event_sender(),
    };

    let runtime = ReaderRuntime {
        ctx,
        status: status_tx,
    };
    let task = tokio::spawn(runtime.run(transit, ifsf, commands_rx));
    (handle, task)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl ReaderRuntime {
    async fn run(
        mut self,
        mut transit: mpsc::Receiver<LinkEvent>,
        mut ifsf: mpsc::Receiver<LinkEvent>,
        mut commands: mpsc::Receiver<RuntimeCommand>,
    ) {
        let mut ticker = tokio::time::interval(self.ctx.settings.timing.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transit_open = true;
        let mut ifsf_open = true;

        info!("Reader runtime started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.ctx.tick(now()),

                event = transit.recv(), if transit_open => match event {
                    Some(event) => self.ctx.on_link_event(SubProtocol::Transit, event),
                    None => {
                        warn!("Transit link task gone");
                        transit_open = false;
                    }
                },

                event = ifsf.recv(), if ifsf_open => match event {
                    Some(event) => self.ctx.on_link_event(SubProtocol::Ifsf, event),
                    None => {
                        warn!("IFSF link task gone");
                        ifsf_open = false;
                    }
                },

                command = commands.recv() => match command {
                    Some(RuntimeCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
            }
            self.publish();
        }
        info!("Reader runtime stopped");
    }

    fn publish(&self) {
        let next = StatusSnapshot::capture(&self.ctx);
        self.status.send_if_modified(|current| {
            if next.differs_from(current) {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn handle(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::SamApdu { apdu, reply } => {
                let request = match self.sam_request(apdu) {
                    Ok(request) => request,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                self.exchange(SubProtocol::Transit, request, reply);
            }
            RuntimeCommand::CardApdu { apdu, reply } => {
                if !self.ctx.device.ifsf.is_app_alive() {
                    let _ = reply.send(Err(ReaderError::precondition("IFSF application not alive")));
                    return;
                }
                let request = Message::request(CommandCode::CardApdu).with_apdu(apdu);
                self.exchange(SubProtocol::Ifsf, request, reply);
            }
            RuntimeCommand::RestartAuth { reply } => {
                let _ = reply.send(auth::request_restart(&mut self.ctx));
            }
            RuntimeCommand::AuthOutcome { run, reply } => {
                let outcome = if self.ctx.auth.run() == run {
                    self.ctx.auth.last_result().cloned()
                } else {
                    None
                };
                let _ = reply.send(outcome);
            }
            RuntimeCommand::SetUnlocked { unlocked, reply } => {
                let changed = self.ctx.device.sam.set_unlocked(unlocked);
                if changed {
                    info!(unlocked, "SAM unlock status changed");
                    self.ctx.device.emit(DeviceEvent::UnlockChanged(unlocked));
                }
                let _ = reply.send(changed);
            }
            RuntimeCommand::Shutdown => {}
        }
    }

    fn sam_request(&self, apdu: Vec<u8>) -> Result<Message> {
        if !self.ctx.device.transit.is_app_alive() {
            return Err(ReaderError::precondition("transit application not alive"));
        }
        let slot = self
            .ctx
            .device
            .sam
            .detected_slot()
            .ok_or_else(|| ReaderError::precondition("no SAM detected"))?;
        let key = CorrelationKey::new(CommandCode::SamApdu, Some(slot.as_u8()));
        if self.ctx.is_pending(SubProtocol::Transit, &key) {
            return Err(ReaderError::precondition("SAM busy"));
        }
        Ok(Message::request(CommandCode::SamApdu)
            .with_slot(slot.as_u8())
            .with_apdu(apdu))
    }

    fn exchange(
        &mut self,
        protocol: SubProtocol,
        request: Message,
        reply: oneshot::Sender<Result<ApduResponse>>,
    ) {
        let command = request.command;
        let deadline = now() + self.ctx.settings.timing.response_timeout();
        let (tx, rx) = oneshot::channel::<Option<Message>>();
        let sent = self.ctx.send_request(
            protocol,
            request,
            deadline,
            Box::new(move |_ctx: &mut ReaderContext, _request, response| {
                let _ = tx.send(response);
            }),
        );
        if let Err(e) = sent {
            let _ = reply.send(Err(e));
            return;
        }

        // Completion arrives on this same task; forward it without blocking.
        tokio::spawn(async move {
            let outcome = apdu_outcome(command, rx.await.ok().flatten());
            debug!(command = %command, ok = outcome.is_ok(), "APDU exchange finished");
            let _ = reply.send(outcome);
        });
    }
}

fn apdu_outcome(command: CommandCode, response: Option<Message>) -> Result<ApduResponse> {
    let response =
        response.ok_or_else(|| ReaderError::NoResponse(format!("{command} timed out")))?;
    let raw = response.require_apdu()?;
    ApduResponse::parse(raw)
        .ok_or_else(|| ReaderError::NoResponse(format!("{command} with a truncated APDU")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu;
    use crate::init::InitState;
    use crate::testkit::{settings, spawn_loopback};

    const WAIT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_runtime_reaches_operational() {
        let (transit, ifsf, _terminal) = spawn_loopback();
        let (handle, _task) = spawn_runtime(settings(), transit, ifsf);

        let status = handle
            .wait_for_status(WAIT, |s| s.operational)
            .await
            .unwrap();
        assert_eq!(status.init_state, InitState::Done);
        assert!(status.auth_state.is_success());
        assert_eq!(status.remaining_attempts, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sam_apdu_requires_detected_module() {
        let (transit, ifsf, _terminal) = spawn_loopback();
        let (handle, _task) = spawn_runtime(settings(), transit, ifsf);

        let err = handle.sam_apdu(apdu::get_challenge()).await.unwrap_err();
        assert!(matches!(err, ReaderError::Precondition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_card_apdu_round_trip() {
        let (transit, ifsf, _terminal) = spawn_loopback();
        let (handle, _task) = spawn_runtime(settings(), transit, ifsf);
        handle
            .wait_for_status(WAIT, |s| s.ifsf.app_alive)
            .await
            .unwrap();

        let aid = hex::decode("A0000004040125").unwrap();
        let response = handle.card_apdu(apdu::select(&aid)).await.unwrap();
        assert!(response.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_unlocked_reports_change_and_emits() {
        let (transit, ifsf, _terminal) = spawn_loopback();
        let (handle, _task) = spawn_runtime(settings(), transit, ifsf);
        let mut events = handle.subscribe_events();

        assert!(handle.set_unlocked(true).await.unwrap());
        assert!(!handle.set_unlocked(true).await.unwrap());

        let unlocked = loop {
            match events.recv().await.unwrap() {
                DeviceEvent::UnlockChanged(value) => break value,
                _ => continue,
            }
        };
        assert!(unlocked);
        handle
            .wait_for_status(WAIT, |s| s.sam_unlocked)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_auth_yields_new_successful_run() {
        let (transit, ifsf, _terminal) = spawn_loopback();
        let (handle, _task) = spawn_runtime(settings(), transit, ifsf);
        let first = handle.wait_for_status(WAIT, |s| s.operational).await.unwrap();

        let run = handle.restart_auth().await.unwrap();
        assert!(run > first.auth_run);
        let outcome = handle.wait_auth_finished(run, WAIT).await.unwrap();
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_handle() {
        let (transit, ifsf, _terminal) = spawn_loopback();
        let (handle, task) = spawn_runtime(settings(), transit, ifsf);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(matches!(
            handle.set_unlocked(true).await,
            Err(ReaderError::RuntimeStopped)
        ));
    }

    #[test]
    fn test_apdu_outcome() {
        use cardterm_protocol::{ProtocolError, ResponseCode};

        let ok = Message::response(CommandCode::SamApdu, ResponseCode::Success)
            .with_apdu(vec![0x01, 0x90, 0x00]);
        let parsed = apdu_outcome(CommandCode::SamApdu, Some(ok)).unwrap();
        assert_eq!(parsed.data, vec![0x01]);
        assert!(parsed.is_success());

        let bare = Message::response(CommandCode::SamApdu, ResponseCode::Success);
        assert!(matches!(
            apdu_outcome(CommandCode::SamApdu, Some(bare)),
            Err(ReaderError::Protocol(ProtocolError::MissingRecord("apdu")))
        ));

        let short = Message::response(CommandCode::CardApdu, ResponseCode::Success)
            .with_apdu(vec![0x90]);
        assert!(matches!(
            apdu_outcome(CommandCode::CardApdu, Some(short)),
            Err(ReaderError::NoResponse(_))
        ));
        assert!(matches!(
            apdu_outcome(CommandCode::CardApdu, None),
            Err(ReaderError::NoResponse(_))
        ));
    }
}
