//! Sessions and the observer fan-out.
//!
//! Observer lifecycle: `Disconnected → Connecting → Live → Disconnected`.
//! A session starts in `Connecting` with a synthetic replay of the current
//! graph queued; records produced while connecting are buffered (bounded).
//! `attach` transitions to `Live` and drains the buffer; consumers then drain
//! with `take`. Overflow drops the oldest records and marks the session
//! stale, which forces the engine to seed a fresh full replay before the next
//! drain returns anything.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::mutation::ObserverRecord;

/// Bound on records buffered per session.
pub const SESSION_BUFFER_CAP: usize = 1024;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Per-session delivery flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFlags {
    /// Deliver Perf records to this session.
    pub perf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Live,
}

struct Session {
    state: SessionState,
    flags: SessionFlags,
    buffer: VecDeque<ObserverRecord>,
    stale: bool,
}

/// Result of draining a session's buffer.
pub enum Drained {
    /// Buffered records, oldest first.
    Records(Vec<ObserverRecord>),
    /// The buffer overflowed since the last drain; the caller must seed a
    /// fresh replay before records flow again.
    Stale,
}

/// Owns all sessions and fans records out to them.
#[derive(Default)]
pub struct ObserverHub {
    sessions: Mutex<BTreeMap<u64, Session>>,
    next_id: AtomicU64,
}

impl ObserverHub {
    /// New hub with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session in `Connecting` state.
    pub fn start_session(&self, flags: SessionFlags) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.sessions.lock().insert(
            id,
            Session {
                state: SessionState::Connecting,
                flags,
                buffer: VecDeque::new(),
                stale: false,
            },
        );
        SessionId(id)
    }

    /// Remove a session.
    pub fn end_session(&self, id: SessionId) -> Result<(), EngineError> {
        self.sessions
            .lock()
            .remove(&id.0)
            .map(|_| ())
            .ok_or(EngineError::UnknownSession(id.0))
    }

    /// Whether a session exists.
    pub fn has_session(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id.0)
    }

    /// Replace a session's buffer with a fresh replay and clear staleness.
    pub fn seed(&self, id: SessionId, replay: Vec<ObserverRecord>) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id.0)
            .ok_or(EngineError::UnknownSession(id.0))?;
        session.buffer.clear();
        session.stale = false;
        for record in replay {
            session.buffer.push_back(record);
        }
        Ok(())
    }

    /// Transition to `Live` and drain whatever is buffered.
    pub fn attach(&self, id: SessionId) -> Result<Drained, EngineError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id.0)
            .ok_or(EngineError::UnknownSession(id.0))?;
        session.state = SessionState::Live;
        Ok(drain(session))
    }

    /// Drop back to `Connecting` (observer went away; keep buffering).
    pub fn detach(&self, id: SessionId) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id.0)
            .ok_or(EngineError::UnknownSession(id.0))?;
        session.state = SessionState::Connecting;
        Ok(())
    }

    /// Drain a live session's buffer.
    pub fn take(&self, id: SessionId) -> Result<Drained, EngineError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id.0)
            .ok_or(EngineError::UnknownSession(id.0))?;
        Ok(drain(session))
    }

    /// Push a record to every session, honouring the perf flag. Overflow
    /// drops the oldest record and marks the session stale.
    pub fn publish(&self, record: &ObserverRecord) {
        let is_perf = record.is_perf();
        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            if is_perf && !session.flags.perf {
                continue;
            }
            if session.buffer.len() >= SESSION_BUFFER_CAP {
                session.buffer.pop_front();
                if !session.stale {
                    session.stale = true;
                    tracing::warn!("observer buffer overflow, session marked stale");
                }
            }
            session.buffer.push_back(record.clone());
        }
    }

    /// Number of sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn drain(session: &mut Session) -> Drained {
    if session.stale {
        // Everything buffered is untrustworthy; the engine re-seeds a replay.
        session.buffer.clear();
        Drained::Stale
    } else {
        Drained::Records(session.buffer.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> ObserverRecord {
        ObserverRecord::RemoveNode { id }
    }

    #[test]
    fn records_buffer_while_connecting() {
        let hub = ObserverHub::new();
        let session = hub.start_session(SessionFlags::default());
        hub.publish(&record(1));
        hub.publish(&record(2));

        match hub.attach(session).unwrap() {
            Drained::Records(records) => {
                assert_eq!(records, vec![record(1), record(2)]);
            }
            Drained::Stale => panic!("unexpected stale"),
        }
    }

    #[test]
    fn perf_records_respect_flag() {
        let hub = ObserverHub::new();
        let plain = hub.start_session(SessionFlags::default());
        let perf = hub.start_session(SessionFlags { perf: true });

        hub.publish(&ObserverRecord::Perf {
            sample_pos: 0,
            spans: vec![],
        });

        match hub.attach(plain).unwrap() {
            Drained::Records(records) => assert!(records.is_empty()),
            Drained::Stale => panic!(),
        }
        match hub.attach(perf).unwrap() {
            Drained::Records(records) => assert_eq!(records.len(), 1),
            Drained::Stale => panic!(),
        }
    }

    #[test]
    fn overflow_marks_stale_and_forces_replay() {
        let hub = ObserverHub::new();
        let session = hub.start_session(SessionFlags::default());
        for i in 0..(SESSION_BUFFER_CAP as u64 + 10) {
            hub.publish(&record(i));
        }

        assert!(matches!(hub.attach(session).unwrap(), Drained::Stale));

        // Seeding a replay recovers the session.
        hub.seed(session, vec![record(99)]).unwrap();
        match hub.take(session).unwrap() {
            Drained::Records(records) => assert_eq!(records, vec![record(99)]),
            Drained::Stale => panic!(),
        }
    }

    #[test]
    fn unknown_session_errors() {
        let hub = ObserverHub::new();
        assert!(matches!(
            hub.take(SessionId(42)),
            Err(EngineError::UnknownSession(42))
        ));
        assert!(hub.end_session(SessionId(42)).is_err());
    }

    #[test]
    fn end_session_removes() {
        let hub = ObserverHub::new();
        let session = hub.start_session(SessionFlags::default());
        assert_eq!(hub.session_count(), 1);
        hub.end_session(session).unwrap();
        assert_eq!(hub.session_count(), 0);
    }
}
