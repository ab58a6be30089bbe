//! SAM mutual-authentication state machine.
//!
//! ```text
//! INIT_VERIFYING_SAM_DETECTED → STARTING → SELECTING_INFO_APPLET → VERIFY_SAM_TYPE
//!   → VERIFY_SAM_NETWORK_ID → READING_SAM_NUMBER → SELECTING_CTRL_APPLET
//!   → CHECKING_SAM_AUTH_STATE_BEFORE_AUTH → GET_CHALLENGE → EXT_AUTHENTICATE
//!   → CHECKING_SAM_AUTH_STATE_AFTER_AUTH → FINISHED(success|fail)
//! ```
//!
//! The machine ticks only once bring-up is `DONE` and the transit
//! application is alive. Every step is a SAM APDU in a transit envelope
//! addressed to the detected slot.
//!
//! Steps before `GET_CHALLENGE` are resent when their response times out.
//! `GET_CHALLENGE` and `EXT_AUTHENTICATE` are irreversible: each is sent at
//! most once per run, and fails the run when its budget (measured from
//! entering the step) runs out. A bad status word, an invalid response or
//! a cryptogram mismatch ends the run as `FINISHED(fail)`; nothing is
//! retried without an explicit [`restart`].

use std::fmt;
use std::time::Instant;

use cardterm_core::SubProtocol;
use cardterm_core::constants::MAX_AUTH_ATTEMPTS;
use cardterm_core::to_hex;
use cardterm_protocol::{CommandCode, CorrelationKey, Message};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::apdu::{self, ApduResponse, DataObject};
use crate::context::ReaderContext;
use crate::crypto::{self, CryptoError, SessionCipher};
use crate::device::DeviceEvent;
use crate::error::{ReaderError, Result};
use crate::init::InitState;

/// Auth process states. Only ever advance, except on [`restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    InitVerifyingSamDetected,
    Starting,
    SelectingInfoApplet,
    VerifySamType,
    VerifySamNetworkId,
    ReadingSamNumber,
    SelectingCtrlApplet,
    CheckingSamAuthStateBeforeAuth,
    GetChallenge,
    ExtAuthenticate,
    CheckingSamAuthStateAfterAuth,
    Finished { success: bool },
}

impl AuthState {
    fn ordinal(&self) -> u8 {
        match self {
            AuthState::InitVerifyingSamDetected => 0,
            AuthState::Starting => 1,
            AuthState::SelectingInfoApplet => 2,
            AuthState::VerifySamType => 3,
            AuthState::VerifySamNetworkId => 4,
            AuthState::ReadingSamNumber => 5,
            AuthState::SelectingCtrlApplet => 6,
            AuthState::CheckingSamAuthStateBeforeAuth => 7,
            AuthState::GetChallenge => 8,
            AuthState::ExtAuthenticate => 9,
            AuthState::CheckingSamAuthStateAfterAuth => 10,
            AuthState::Finished { .. } => 11,
        }
    }

    pub fn can_advance_to(&self, target: &AuthState) -> bool {
        target.ordinal() > self.ordinal()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, AuthState::Finished { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AuthState::Finished { success: true })
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::InitVerifyingSamDetected => "INIT_VERIFYING_SAM_DETECTED",
            AuthState::Starting => "STARTING",
            AuthState::SelectingInfoApplet => "SELECTING_INFO_APPLET",
            AuthState::VerifySamType => "VERIFY_SAM_TYPE",
            AuthState::VerifySamNetworkId => "VERIFY_SAM_NETWORK_ID",
            AuthState::ReadingSamNumber => "READING_SAM_NUMBER",
            AuthState::SelectingCtrlApplet => "SELECTING_CTRL_APPLET",
            AuthState::CheckingSamAuthStateBeforeAuth => "CHECKING_SAM_AUTH_STATE_BEFORE_AUTH",
            AuthState::GetChallenge => "GET_CHALLENGE",
            AuthState::ExtAuthenticate => "EXT_AUTHENTICATE",
            AuthState::CheckingSamAuthStateAfterAuth => "CHECKING_SAM_AUTH_STATE_AFTER_AUTH",
            AuthState::Finished { success: true } => "FINISHED(success)",
            AuthState::Finished { success: false } => "FINISHED(fail)",
        };
        f.write_str(name)
    }
}

impl Serialize for AuthState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Why an authentication run failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("no supported SAM detected")]
    ModuleNotDetected,

    #[error("invalid response at {step}")]
    InvalidResponse { step: AuthState },

    #[error("{step} failed with status word {sw:04X}")]
    StatusWord { step: AuthState, sw: u16 },

    #[error("unexpected SAM type {found}")]
    UnexpectedSamType { found: String },

    #[error("SAM network id {found} does not match")]
    NetworkIdMismatch { found: String },

    #[error("SAM is locked: no authentication attempts left")]
    ModuleLocked,

    #[error("{step} timed out")]
    StepTimeout { step: AuthState, command_sent: bool },

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("module cryptogram does not match the terminal challenge")]
    CryptogramMismatch,

    #[error("SAM does not report an authenticated state after authentication")]
    NotAuthenticatedAfterAuth,
}

impl AuthFailure {
    /// Whether the failure spent one of the module's authentication
    /// attempts, i.e. an EXTERNAL AUTHENTICATE reached the module.
    pub fn consumes_attempt(&self) -> bool {
        match self {
            AuthFailure::CryptogramMismatch | AuthFailure::NotAuthenticatedAfterAuth => true,
            AuthFailure::StatusWord { step, .. } | AuthFailure::InvalidResponse { step } => {
                *step == AuthState::ExtAuthenticate
            }
            AuthFailure::StepTimeout { step, command_sent } => {
                *step == AuthState::ExtAuthenticate && *command_sent
            }
            _ => false,
        }
    }
}

/// Send/receive bookkeeping of one irreversible step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrreversibleStep {
    pub entered_at: Option<Instant>,
    pub sent: bool,
    pub received: bool,
}

/// Per-run handshake data.
#[derive(Default)]
pub struct AuthHandshake {
    /// Device random, RndB.
    rnd_b: Zeroizing<Vec<u8>>,
    /// Terminal random, RndA.
    rnd_a: Zeroizing<Vec<u8>>,
    pub challenge: IrreversibleStep,
    pub authenticate: IrreversibleStep,
    session: Option<SessionCipher>,
}

impl fmt::Debug for AuthHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHandshake")
            .field("challenge", &self.challenge)
            .field("authenticate", &self.authenticate)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct AuthMachine {
    generation: u64,
    run: u64,
    pub handshake: AuthHandshake,
    last_result: Option<std::result::Result<(), AuthFailure>>,
}

impl AuthMachine {
    /// Counter bumped by every restart.
    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn last_result(&self) -> Option<&std::result::Result<(), AuthFailure>> {
        self.last_result.as_ref()
    }
}

pub fn tick(ctx: &mut ReaderContext, now: Instant) {
    if ctx.device.init_state() != InitState::Done || !ctx.device.transit.is_app_alive() {
        return;
    }

    let sam = ctx.settings.sam.clone();
    match ctx.device.sam.auth_state() {
        AuthState::InitVerifyingSamDetected => {
            if ctx.device.sam.is_detected() {
                advance(ctx, AuthState::Starting);
            } else {
                finish_failed(ctx, AuthFailure::ModuleNotDetected);
            }
        }
        AuthState::Starting => {
            ctx.auth.handshake = AuthHandshake::default();
            advance(ctx, AuthState::SelectingInfoApplet);
        }
        AuthState::SelectingInfoApplet => {
            reversible_step(ctx, now, apdu::select(&sam.info_aid), |ctx, _| {
                advance(ctx, AuthState::VerifySamType);
            });
        }
        AuthState::VerifySamType => {
            reversible_step(ctx, now, apdu::get_data(DataObject::SamType), |ctx, resp| {
                ctx.device.set_found_sam_type(Some(resp.data.clone()));
                if resp.data == ctx.settings.sam.sam_type {
                    advance(ctx, AuthState::VerifySamNetworkId);
                } else {
                    let found = to_hex(&resp.data);
                    finish_failed(ctx, AuthFailure::UnexpectedSamType { found });
                }
            });
        }
        AuthState::VerifySamNetworkId => {
            reversible_step(ctx, now, apdu::get_data(DataObject::NetworkId), |ctx, resp| {
                if resp.data == ctx.settings.sam.network_id {
                    advance(ctx, AuthState::ReadingSamNumber);
                } else {
                    let found = to_hex(&resp.data);
                    finish_failed(ctx, AuthFailure::NetworkIdMismatch { found });
                }
            });
        }
        AuthState::ReadingSamNumber => {
            reversible_step(ctx, now, apdu::get_data(DataObject::SamNumber), |ctx, resp| {
                info!(sam_number = %to_hex(&resp.data), "SAM number read");
                ctx.device.sam.set_sam_number(resp.data);
                advance(ctx, AuthState::SelectingCtrlApplet);
            });
        }
        AuthState::SelectingCtrlApplet => {
            reversible_step(ctx, now, apdu::select(&sam.ctrl_aid), |ctx, _| {
                advance(ctx, AuthState::CheckingSamAuthStateBeforeAuth);
            });
        }
        AuthState::CheckingSamAuthStateBeforeAuth => {
            reversible_step(ctx, now, apdu::get_data(DataObject::AuthState), |ctx, resp| {
                let Some((_, remaining)) = parse_auth_state(&resp.data) else {
                    let step = AuthState::CheckingSamAuthStateBeforeAuth;
                    finish_failed(ctx, AuthFailure::InvalidResponse { step });
                    return;
                };
                ctx.device.sam.set_remaining_attempts(remaining);
                if remaining == 0 {
                    finish_failed(ctx, AuthFailure::ModuleLocked);
                } else {
                    debug!(remaining_attempts = remaining, "SAM accepts authentication");
                    advance(ctx, AuthState::GetChallenge);
                }
            });
        }
        AuthState::GetChallenge => get_challenge(ctx, now),
        AuthState::ExtAuthenticate => external_authenticate(ctx, now),
        AuthState::CheckingSamAuthStateAfterAuth => {
            reversible_step(ctx, now, apdu::get_data(DataObject::AuthState), |ctx, resp| {
                let Some((authenticated, remaining)) = parse_auth_state(&resp.data) else {
                    let step = AuthState::CheckingSamAuthStateAfterAuth;
                    finish_failed(ctx, AuthFailure::InvalidResponse { step });
                    return;
                };
                ctx.device.sam.set_remaining_attempts(remaining);
                match ctx.auth.handshake.session.take() {
                    Some(session) if authenticated => finish_success(ctx, session),
                    _ => finish_failed(ctx, AuthFailure::NotAuthenticatedAfterAuth),
                }
            });
        }
        AuthState::Finished { .. } => {}
    }
}

/// `(authenticated, remaining attempts)` from a GET DATA (auth state).
fn parse_auth_state(data: &[u8]) -> Option<(bool, u8)> {
    match data {
        [state, remaining, ..] => Some((*state == 0x01, *remaining)),
        _ => None,
    }
}

fn advance(ctx: &mut ReaderContext, to: AuthState) -> bool {
    let from = ctx.device.sam.auth_state();
    if !from.can_advance_to(&to) {
        warn!(from = %from, to = %to, "Auth transition refused");
        return false;
    }
    info!(from = %from, to = %to, "Auth state transition");
    ctx.device.sam.auth_state = to;
    ctx.device.emit(DeviceEvent::AuthStateChanged { from, to });
    true
}

fn finish_success(ctx: &mut ReaderContext, session: SessionCipher) {
    if !advance(ctx, AuthState::Finished { success: true }) {
        return;
    }
    ctx.device.sam.on_authenticated(session);
    ctx.auth.last_result = Some(Ok(()));
    ctx.auth.handshake = AuthHandshake::default();
    info!(
        remaining_attempts = ?ctx.device.sam.remaining_attempts(),
        "SAM authenticated"
    );
}

fn finish_failed(ctx: &mut ReaderContext, failure: AuthFailure) {
    if !advance(ctx, AuthState::Finished { success: false }) {
        return;
    }
    let consumes = failure.consumes_attempt();
    if consumes {
        ctx.device.sam.consume_attempt();
    }
    error!(
        failure = %failure,
        consumes_attempt = consumes,
        failed_attempts = ctx.device.sam.failed_attempts(),
        remaining_attempts = ?ctx.device.sam.remaining_attempts(),
        "SAM authentication failed"
    );
    ctx.device.sam.on_auth_failed(failure.clone());
    ctx.auth.last_result = Some(Err(failure));
    ctx.auth.handshake = AuthHandshake::default();
}

/// Restart the machine from `INIT_VERIFYING_SAM_DETECTED`.
///
/// Counts a spent attempt only if an EXTERNAL AUTHENTICATE is in flight.
/// Returns the new run number.
pub fn restart(ctx: &mut ReaderContext, reason: &str) -> u64 {
    let from = ctx.device.sam.auth_state();
    let authenticate = ctx.auth.handshake.authenticate;
    if from == AuthState::ExtAuthenticate && authenticate.sent && !authenticate.received {
        warn!("Restarting with EXTERNAL AUTHENTICATE in flight, counting a spent attempt");
        ctx.device.sam.consume_attempt();
    }

    ctx.auth.generation = ctx.auth.generation.wrapping_add(1);
    ctx.auth.run = ctx.auth.run.wrapping_add(1);
    ctx.auth.handshake = AuthHandshake::default();
    ctx.device.sam.on_auth_restarted();

    let to = AuthState::InitVerifyingSamDetected;
    if from != to {
        ctx.device.emit(DeviceEvent::AuthStateChanged { from, to });
    }
    info!(reason, from = %from, run = ctx.auth.run, "Auth state machine restarted");
    ctx.auth.run
}

/// Restart on explicit request.
///
/// # Errors
/// `Precondition` once the module reports no attempts left, or as many
/// failures as the module allows happened since the last success.
pub fn request_restart(ctx: &mut ReaderContext) -> Result<u64> {
    let sam = &ctx.device.sam;
    if sam.remaining_attempts() == Some(0) || sam.failed_attempts() >= MAX_AUTH_ATTEMPTS {
        return Err(ReaderError::precondition(
            "SAM locked: no authentication attempts left",
        ));
    }
    Ok(restart(ctx, "requested"))
}

fn is_current(ctx: &ReaderContext, generation: u64, step: AuthState) -> bool {
    ctx.auth.generation == generation && ctx.device.sam.auth_state() == step
}

fn sam_key(ctx: &ReaderContext) -> Option<CorrelationKey> {
    let slot = ctx.device.sam.detected_slot()?;
    Some(CorrelationKey::new(CommandCode::SamApdu, Some(slot.as_u8())))
}

fn send_apdu(
    ctx: &mut ReaderContext,
    apdu: Vec<u8>,
    deadline: Instant,
    handler: impl FnOnce(&mut ReaderContext, Option<Message>) + Send + 'static,
) -> bool {
    let step = ctx.device.sam.auth_state();
    let Some(slot) = ctx.device.sam.detected_slot() else {
        finish_failed(ctx, AuthFailure::ModuleNotDetected);
        return false;
    };
    let generation = ctx.auth.generation;
    let request = Message::request(CommandCode::SamApdu)
        .with_slot(slot.as_u8())
        .with_apdu(apdu);

    debug!(step = %step, slot = %slot, "Sending SAM APDU");
    let result = ctx.send_request(
        SubProtocol::Transit,
        request,
        deadline,
        Box::new(move |ctx: &mut ReaderContext, _request, response| {
            if !is_current(ctx, generation, step) {
                debug!(step = %step, "Ignoring stale SAM response");
                return;
            }
            handler(ctx, response);
        }),
    );
    match result {
        Ok(_) => true,
        Err(e) => {
            debug!(step = %step, error = %e, "SAM APDU not sent");
            false
        }
    }
}

/// Validate envelope and status word, failing the run otherwise.
fn checked_apdu(ctx: &mut ReaderContext, step: AuthState, response: &Message) -> Option<ApduResponse> {
    let Some(parsed) = response.apdu().and_then(|raw| ApduResponse::parse(raw)) else {
        finish_failed(ctx, AuthFailure::InvalidResponse { step });
        return None;
    };
    if !parsed.is_success() {
        finish_failed(ctx, AuthFailure::StatusWord { step, sw: parsed.sw });
        return None;
    }
    Some(parsed)
}

fn reversible_step(
    ctx: &mut ReaderContext,
    now: Instant,
    apdu: Vec<u8>,
    on_success: impl FnOnce(&mut ReaderContext, ApduResponse) + Send + 'static,
) {
    if sam_key(ctx).is_some_and(|key| ctx.is_pending(SubProtocol::Transit, &key)) {
        return;
    }
    let step = ctx.device.sam.auth_state();
    let deadline = now + ctx.settings.timing.response_timeout();
    send_apdu(ctx, apdu, deadline, move |ctx, response| {
        let Some(response) = response else {
            warn!(step = %step, "No SAM response, will resend");
            return;
        };
        if let Some(parsed) = checked_apdu(ctx, step, &response) {
            on_success(ctx, parsed);
        }
    });
}

/// Budget check shared by both irreversible steps. Returns the step
/// deadline when the command still has to be sent.
fn irreversible_due(ctx: &mut ReaderContext, now: Instant, step: AuthState) -> Option<Instant> {
    let budget = ctx.settings.timing.irreversible_step_timeout();
    let tracker = match step {
        AuthState::GetChallenge => &mut ctx.auth.handshake.challenge,
        _ => &mut ctx.auth.handshake.authenticate,
    };
    let entered = *tracker.entered_at.get_or_insert(now);
    let expires = entered + budget;
    if tracker.received {
        return None;
    }
    if now >= expires {
        let command_sent = tracker.sent;
        finish_failed(ctx, AuthFailure::StepTimeout { step, command_sent });
        return None;
    }
    if tracker.sent { None } else { Some(expires) }
}

fn get_challenge(ctx: &mut ReaderContext, now: Instant) {
    let step = AuthState::GetChallenge;
    let Some(deadline) = irreversible_due(ctx, now, step) else {
        return;
    };
    let sent = send_apdu(ctx, apdu::get_challenge(), deadline, move |ctx, response| {
        let Some(response) = response else {
            warn!("GET CHALLENGE unanswered, not resending");
            return;
        };
        ctx.auth.handshake.challenge.received = true;
        let Some(parsed) = checked_apdu(ctx, step, &response) else {
            return;
        };
        let key = ctx.settings.sam.auth_key.clone();
        match crypto::decrypt_challenge(ctx.cipher.as_ref(), &key, &parsed.data) {
            Ok(rnd_b) => {
                ctx.auth.handshake.rnd_b = rnd_b;
                ctx.auth.handshake.rnd_a = crypto::generate_challenge();
                advance(ctx, AuthState::ExtAuthenticate);
            }
            Err(_) => finish_failed(ctx, AuthFailure::InvalidResponse { step }),
        }
    });
    if sent {
        ctx.auth.handshake.challenge.sent = true;
    }
}

fn external_authenticate(ctx: &mut ReaderContext, now: Instant) {
    let step = AuthState::ExtAuthenticate;
    let Some(deadline) = irreversible_due(ctx, now, step) else {
        return;
    };

    let key = ctx.settings.sam.auth_key.clone();
    let blob = match crypto::build_authenticate_blob(
        ctx.cipher.as_ref(),
        &key,
        &ctx.auth.handshake.rnd_a,
        &ctx.auth.handshake.rnd_b,
    ) {
        Ok(blob) => blob,
        Err(e) => {
            finish_failed(ctx, AuthFailure::Crypto(e));
            return;
        }
    };

    let sent = send_apdu(ctx, apdu::external_authenticate(&blob), deadline, move |ctx, response| {
        let Some(response) = response else {
            warn!("EXTERNAL AUTHENTICATE unanswered, not resending");
            return;
        };
        ctx.auth.handshake.authenticate.received = true;
        let Some(parsed) = checked_apdu(ctx, step, &response) else {
            return;
        };

        let key = ctx.settings.sam.auth_key.clone();
        let handshake = &ctx.auth.handshake;
        let verified =
            crypto::verify_cryptogram(ctx.cipher.as_ref(), &key, &handshake.rnd_a, &parsed.data)
                .and_then(|()| crypto::derive_session_key(&handshake.rnd_a, &handshake.rnd_b));
        match verified {
            Ok(session_key) => {
                ctx.auth.handshake.session = Some(SessionCipher::new(ctx.cipher.clone(), session_key));
                advance(ctx, AuthState::CheckingSamAuthStateAfterAuth);
            }
            Err(CryptoError::Mismatch) => finish_failed(ctx, AuthFailure::CryptogramMismatch),
            Err(_) => finish_failed(ctx, AuthFailure::InvalidResponse { step }),
        }
    });
    if sent {
        ctx.auth.handshake.authenticate.sent = true;
    }
}
