// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client for the ballooning broker that negotiates host memory between
//! live guests.
//!
//! Reservations follow a strict protocol: memory exists as a reservation
//! only between `reserve` and either `transfer_to_domain` (after which the
//! hypervisor owns it) or `release`. The scoped [`CachedBroker::with_reservation`]
//! helper makes it impossible to end a call with an orphaned reservation.
//!
//! The broker may transiently refuse while it squeezes other guests; those
//! refusals are retried with a fixed backoff until a wall budget runs out.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::task::TaskHandle;
use crate::{DomId, Error};

/// Broker failure code: live guests did not give memory back in time.
pub const CODE_DOMAINS_REFUSED_TO_COOPERATE: i64 = 1;
/// Broker failure code: the host cannot free the requested amount.
pub const CODE_CANNOT_FREE_THIS_MUCH: i64 = 2;
/// Broker failure code: the session is no longer valid.
pub const CODE_UNKNOWN_SESSION: i64 = 3;

/// Default pause between retries of a cooperative refusal.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(10);
/// Default total wall budget spent retrying before surfacing the refusal.
pub const RETRY_BUDGET: Duration = Duration::from_secs(60);

/// Errors from broker calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum BrokerError {
    /// Ballooning service is not running
    ServiceAbsent,
    /// Broker refused ({0}): {1}
    Failure(i64, String),
}

impl BrokerError {
    fn retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Failure(CODE_DOMAINS_REFUSED_TO_COOPERATE, _)
                | BrokerError::Failure(CODE_CANNOT_FREE_THIS_MUCH, _)
        )
    }

    fn session_lost(&self) -> bool {
        matches!(self, BrokerError::Failure(CODE_UNKNOWN_SESSION, _))
    }
}

/// An authenticated broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// A reservation handle issued by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationId(pub String);

/// The broker operations the engine consumes.
pub trait MemoryBroker: Send + Sync {
    /// Opens a session.
    fn login(&self) -> Result<SessionId, BrokerError>;
    /// Reserves between `min_kib` and `max_kib` of host memory; returns the
    /// granted amount and the reservation handle.
    fn reserve(
        &self,
        session: &SessionId,
        min_kib: u64,
        max_kib: u64,
    ) -> Result<(u64, ReservationId), BrokerError>;
    /// Binds a reservation to a domain; the reservation is consumed and can
    /// no longer be released.
    fn transfer_to_domain(
        &self,
        session: &SessionId,
        reservation: &ReservationId,
        domid: DomId,
    ) -> Result<(), BrokerError>;
    /// Returns an unconsumed reservation to the host pool.
    fn release(&self, session: &SessionId, reservation: &ReservationId)
        -> Result<(), BrokerError>;
    /// Best-effort rebalance hint.
    fn balance(&self) -> Result<(), BrokerError>;
}

/// [`MemoryBroker`] speaking line-delimited JSON over the broker's unix
/// socket. Every call is one `{method, params}` request and one
/// `{"success": ...}` / `{"failure": {code, message}}` reply; an
/// unreachable socket means the service is absent.
#[derive(Debug, Clone)]
pub struct SocketBroker {
    socket: std::path::PathBuf,
}

impl SocketBroker {
    /// Creates a client for the broker listening at `socket`.
    pub fn new(socket: std::path::PathBuf) -> Self {
        SocketBroker { socket }
    }

    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        use std::io::{BufRead, BufReader, Write};

        let stream = std::os::unix::net::UnixStream::connect(&self.socket)
            .map_err(|_| BrokerError::ServiceAbsent)?;
        let mut writer = stream
            .try_clone()
            .map_err(|_| BrokerError::ServiceAbsent)?;
        let request = serde_json::json!({ "method": method, "params": params });
        writeln!(writer, "{}", request).map_err(|_| BrokerError::ServiceAbsent)?;

        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .map_err(|_| BrokerError::ServiceAbsent)?;
        let reply: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| BrokerError::Failure(0, format!("bad reply: {}", e)))?;
        if let Some(data) = reply.get("success") {
            return Ok(data.clone());
        }
        let failure = reply.get("failure").cloned().unwrap_or_default();
        Err(BrokerError::Failure(
            failure.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
            failure
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unintelligible failure")
                .to_string(),
        ))
    }

    fn field<T: serde::de::DeserializeOwned>(
        data: &serde_json::Value,
        key: &str,
    ) -> Result<T, BrokerError> {
        data.get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| BrokerError::Failure(0, format!("reply missing {}", key)))
    }
}

impl MemoryBroker for SocketBroker {
    fn login(&self) -> Result<SessionId, BrokerError> {
        let data = self.call("login", serde_json::json!({}))?;
        Ok(SessionId(Self::field(&data, "session")?))
    }

    fn reserve(
        &self,
        session: &SessionId,
        min_kib: u64,
        max_kib: u64,
    ) -> Result<(u64, ReservationId), BrokerError> {
        let data = self.call(
            "reserve",
            serde_json::json!({ "session": session.0, "min_kib": min_kib, "max_kib": max_kib }),
        )?;
        Ok((
            Self::field(&data, "amount_kib")?,
            ReservationId(Self::field(&data, "reservation")?),
        ))
    }

    fn transfer_to_domain(
        &self,
        session: &SessionId,
        reservation: &ReservationId,
        domid: DomId,
    ) -> Result<(), BrokerError> {
        self.call(
            "transfer_to_domain",
            serde_json::json!({
                "session": session.0,
                "reservation": reservation.0,
                "domid": domid.0,
            }),
        )?;
        Ok(())
    }

    fn release(
        &self,
        session: &SessionId,
        reservation: &ReservationId,
    ) -> Result<(), BrokerError> {
        self.call(
            "release",
            serde_json::json!({ "session": session.0, "reservation": reservation.0 }),
        )?;
        Ok(())
    }

    fn balance(&self) -> Result<(), BrokerError> {
        self.call("balance", serde_json::json!({}))?;
        Ok(())
    }
}

/// Process-wide broker front end: one lazily-created session shared behind
/// a mutex and recreated on session loss.
pub struct CachedBroker {
    broker: Arc<dyn MemoryBroker>,
    session: Mutex<Option<SessionId>>,
    retry_backoff: Duration,
    retry_budget: Duration,
}

impl std::fmt::Debug for CachedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBroker")
            .field("session", &self.session)
            .finish()
    }
}

impl CachedBroker {
    /// Wraps a broker with the production retry timings.
    pub fn new(broker: Arc<dyn MemoryBroker>) -> Self {
        Self::with_timing(broker, RETRY_BACKOFF, RETRY_BUDGET)
    }

    /// Wraps a broker with explicit retry timings.
    pub fn with_timing(
        broker: Arc<dyn MemoryBroker>,
        retry_backoff: Duration,
        retry_budget: Duration,
    ) -> Self {
        CachedBroker {
            broker,
            session: Mutex::new(None),
            retry_backoff,
            retry_budget,
        }
    }

    fn session(&self) -> Result<SessionId, BrokerError> {
        let mut cached = self.session.lock().expect("broker session lock poisoned");
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }
        let session = self.broker.login()?;
        *cached = Some(session.clone());
        Ok(session)
    }

    fn drop_session(&self) {
        *self.session.lock().expect("broker session lock poisoned") = None;
    }

    // Runs one sessioned call, re-logging-in once if the broker lost our
    // session.
    fn call<T>(
        &self,
        f: impl Fn(&SessionId) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let session = self.session()?;
        match f(&session) {
            Err(e) if e.session_lost() => {
                debug!("memory broker session lost, logging in again");
                self.drop_session();
                let session = self.session()?;
                f(&session)
            }
            other => other,
        }
    }

    /// Reserves memory, retrying cooperative refusals until the wall budget
    /// runs out.
    pub fn reserve(
        &self,
        task: &TaskHandle,
        min_kib: u64,
        max_kib: u64,
    ) -> Result<(u64, ReservationId), Error> {
        let deadline = Instant::now() + self.retry_budget;
        loop {
            task.check_cancel()?;
            match self.call(|session| self.broker.reserve(session, min_kib, max_kib)) {
                Ok(granted) => return Ok(granted),
                Err(e) if e.retryable() && Instant::now() + self.retry_backoff < deadline => {
                    debug!(
                        "broker refused {}..{} KiB ({}), retrying in {:?}",
                        min_kib, max_kib, e, self.retry_backoff
                    );
                    std::thread::sleep(self.retry_backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Binds a reservation to a domain.
    pub fn transfer_to_domain(
        &self,
        reservation: &ReservationId,
        domid: DomId,
    ) -> Result<(), Error> {
        self.call(|session| self.broker.transfer_to_domain(session, reservation, domid))
            .map_err(Error::from)
    }

    /// Releases an unconsumed reservation.
    pub fn release(&self, reservation: &ReservationId) -> Result<(), Error> {
        self.call(|session| self.broker.release(session, reservation))
            .map_err(Error::from)
    }

    /// Best-effort rebalance hint; failures are logged, not surfaced.
    pub fn balance(&self) {
        if let Err(e) = self.broker.balance() {
            warn!("memory broker balance hint failed: {}", e);
        }
    }

    /// Reserves, runs `f`, and releases on every path unless `f` consumed
    /// the reservation with [`Reservation::transfer`].
    pub fn with_reservation<T>(
        &self,
        task: &TaskHandle,
        min_kib: u64,
        max_kib: u64,
        f: impl FnOnce(&mut Reservation) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let (amount_kib, id) = self.reserve(task, min_kib, max_kib)?;
        let mut reservation = Reservation {
            cached: self,
            id,
            amount_kib,
            consumed: false,
        };
        let out = f(&mut reservation);
        if !reservation.consumed {
            if let Err(e) = self.release(&reservation.id) {
                warn!("failed to release reservation {}: {}", reservation.id.0, e);
            }
        }
        out
    }
}

/// A live reservation inside [`CachedBroker::with_reservation`].
#[derive(Debug)]
pub struct Reservation<'a> {
    cached: &'a CachedBroker,
    id: ReservationId,
    amount_kib: u64,
    consumed: bool,
}

impl Reservation<'_> {
    /// The granted amount in KiB (between the requested min and max).
    pub fn amount_kib(&self) -> u64 {
        self.amount_kib
    }

    /// The reservation handle.
    pub fn id(&self) -> &ReservationId {
        &self.id
    }

    /// Transfers the reservation to `domid`, consuming it.
    pub fn transfer(&mut self, domid: DomId) -> Result<(), Error> {
        self.cached.transfer_to_domain(&self.id, domid)?;
        self.consumed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::SimBroker;

    fn quick(broker: Arc<SimBroker>) -> CachedBroker {
        CachedBroker::with_timing(broker, Duration::from_millis(1), Duration::from_millis(50))
    }

    #[test]
    fn test_reserve_grants_within_bounds() {
        let sim = Arc::new(SimBroker::new(1 << 20));
        let cached = quick(sim.clone());
        let task = TaskHandle::new("t");
        let (amount, id) = cached.reserve(&task, 1024, 2048).unwrap();
        assert!((1024..=2048).contains(&amount));
        cached.release(&id).unwrap();
        assert_eq!(sim.outstanding(), 0);
    }

    #[test]
    fn test_retry_on_cooperative_refusal() {
        let sim = Arc::new(SimBroker::new(1 << 20));
        sim.refuse_next(2, CODE_DOMAINS_REFUSED_TO_COOPERATE);
        let cached = quick(sim.clone());
        let task = TaskHandle::new("t");
        assert!(cached.reserve(&task, 1024, 1024).is_ok());
        assert!(sim.login_count() >= 1);
    }

    #[test]
    fn test_refusal_surfaces_after_budget() {
        let sim = Arc::new(SimBroker::new(1 << 20));
        sim.refuse_next(u32::MAX, CODE_CANNOT_FREE_THIS_MUCH);
        let cached = quick(sim);
        let task = TaskHandle::new("t");
        match cached.reserve(&task, 1024, 1024) {
            Err(Error::BallooningError(code, _)) => {
                assert_eq!(code, CODE_CANNOT_FREE_THIS_MUCH)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_with_reservation_releases_on_error() {
        let sim = Arc::new(SimBroker::new(1 << 20));
        let cached = quick(sim.clone());
        let task = TaskHandle::new("t");
        let out: Result<(), Error> = cached.with_reservation(&task, 1024, 1024, |_| {
            Err(Error::InternalError("boom".into()))
        });
        assert!(out.is_err());
        assert_eq!(sim.outstanding(), 0);
    }

    #[test]
    fn test_with_reservation_keeps_transferred_memory() {
        let sim = Arc::new(SimBroker::new(1 << 20));
        let cached = quick(sim.clone());
        let task = TaskHandle::new("t");
        cached
            .with_reservation(&task, 1024, 1024, |r| r.transfer(DomId(5)))
            .unwrap();
        // Transferred memory belongs to the domain, not the session.
        assert_eq!(sim.outstanding(), 0);
        assert_eq!(sim.transferred_to(DomId(5)), 1024);
    }

    #[test]
    fn test_session_recreated_on_loss() {
        let sim = Arc::new(SimBroker::new(1 << 20));
        let cached = quick(sim.clone());
        let task = TaskHandle::new("t");
        cached.reserve(&task, 512, 512).unwrap();
        sim.invalidate_sessions();
        assert!(cached.reserve(&task, 512, 512).is_ok());
        assert_eq!(sim.login_count(), 2);
    }
}
