//! Coordinator owning one registered session per ECU family.
//!
//! Tracks which family is "active" — the most recently connected one — and
//! routes family-less calls to it. The session table and active pointer live
//! behind one mutex so registration, connect, and teardown never race
//! against routing.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dtc::DiagnosticCode;
use crate::ecu::{EcuFamily, EcuIdentity, EcuSession, SessionState, TransportDescriptor};
use crate::error::{Result, StateError};

/// Bookkeeping for one established connection. Created on successful
/// connect, destroyed on disconnect.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub family: EcuFamily,
    pub descriptor: TransportDescriptor,
    pub connected_at: DateTime<Utc>,
    pub identity: EcuIdentity,
    /// Refreshed from the session's state when the record is exported.
    pub live: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<EcuFamily, Box<dyn EcuSession>>,
    records: HashMap<EcuFamily, SessionRecord>,
    /// Registration order, used by `probe` and family listing.
    order: Vec<EcuFamily>,
    active: Option<EcuFamily>,
}

impl Inner {
    fn target(&self, family: Option<EcuFamily>) -> Result<EcuFamily> {
        match family {
            Some(family) => Ok(family),
            None => self.active.ok_or_else(|| StateError::NoActiveSession.into()),
        }
    }

    fn session(&mut self, family: EcuFamily) -> Result<&mut Box<dyn EcuSession>> {
        self.sessions
            .get_mut(&family)
            .ok_or_else(|| StateError::UnsupportedFamily(family).into())
    }
}

/// Session coordinator. All operations are serialized; one logical
/// operation runs against the table at a time.
#[derive(Default)]
pub struct EcuBridge {
    inner: Mutex<Inner>,
}

impl EcuBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the session implementation for a family.
    ///
    /// Replacing an existing session drops it without teardown I/O — the
    /// old transport closes when the session is dropped, and any record it
    /// held is discarded. Reconnection is explicit.
    pub fn register(&self, session: Box<dyn EcuSession>) {
        let family = session.family();
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.insert(family, session).is_none() {
            inner.order.push(family);
        } else {
            log::info!("Replacing registered session for {}", family);
            inner.records.remove(&family);
            if inner.active == Some(family) {
                inner.active = None;
            }
        }
    }

    /// Connect the given family and make it the active one.
    pub fn connect(&self, family: EcuFamily) -> Result<EcuIdentity> {
        let mut inner = self.inner.lock().unwrap();
        let (identity, descriptor) = {
            let session = inner.session(family)?;
            let identity = session.connect()?;
            (identity, session.descriptor().clone())
        };
        inner.records.insert(
            family,
            SessionRecord {
                family,
                descriptor,
                connected_at: Utc::now(),
                identity: identity.clone(),
                live: true,
            },
        );
        inner.active = Some(family);
        log::info!("{} is now the active session", family);
        Ok(identity)
    }

    /// Disconnect a family (the active one when none is given), destroying
    /// its record. Disconnecting the active family clears the active
    /// pointer; it does not revert to a previously connected family.
    pub fn disconnect(&self, family: Option<EcuFamily>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        inner.session(family)?.disconnect()?;
        inner.records.remove(&family);
        if inner.active == Some(family) {
            inner.active = None;
        }
        Ok(())
    }

    pub fn read_memory(
        &self,
        address: u32,
        length: u32,
        family: Option<EcuFamily>,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        inner.session(family)?.read_memory(address, length)
    }

    pub fn write_memory(&self, address: u32, data: &[u8], family: Option<EcuFamily>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        inner.session(family)?.write_memory(address, data)
    }

    /// Identification snapshot of the targeted session, if connected.
    pub fn identity(&self, family: Option<EcuFamily>) -> Result<Option<EcuIdentity>> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        Ok(inner.session(family)?.identity().cloned())
    }

    pub fn read_dtcs(&self, family: Option<EcuFamily>) -> Result<Vec<DiagnosticCode>> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        inner.session(family)?.read_dtcs()
    }

    pub fn clear_dtcs(&self, family: Option<EcuFamily>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        inner.session(family)?.clear_dtcs()
    }

    /// Families with a registered session, in registration order.
    pub fn list_supported_families(&self) -> Vec<EcuFamily> {
        self.inner.lock().unwrap().order.clone()
    }

    pub fn is_connected(&self, family: Option<EcuFamily>) -> bool {
        let inner = self.inner.lock().unwrap();
        let family = match family.or(inner.active) {
            Some(family) => family,
            None => return false,
        };
        inner
            .sessions
            .get(&family)
            .map(|s| s.state() == SessionState::Connected)
            .unwrap_or(false)
    }

    /// Export the targeted session's record as a JSON map.
    pub fn export_session(&self, family: Option<EcuFamily>) -> Result<serde_json::Value> {
        let inner = self.inner.lock().unwrap();
        let family = inner.target(family)?;
        let mut record = inner
            .records
            .get(&family)
            .ok_or(StateError::NotConnected)?
            .clone();
        record.live = inner
            .sessions
            .get(&family)
            .map(|s| s.state() == SessionState::Connected)
            .unwrap_or(false);
        Ok(serde_json::to_value(&record)?)
    }

    /// Brute-force detection: try each registered family in registration
    /// order and report the first that completes a connect handshake. The
    /// probe connection is torn down again; no session record survives.
    pub fn probe(&self) -> Option<EcuFamily> {
        let mut inner = self.inner.lock().unwrap();
        let candidates = inner.order.clone();
        for family in candidates {
            let session = match inner.sessions.get_mut(&family) {
                Some(session) => session,
                None => continue,
            };
            log::info!("Probing for {}", family);
            match session.connect() {
                Ok(_) => {
                    if let Err(e) = session.disconnect() {
                        log::warn!("Probe teardown for {} failed: {}", family, e);
                    }
                    return Some(family);
                }
                Err(e) => log::debug!("{} did not answer: {}", family, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::sync::Arc;

    /// Minimal scripted session: connects successfully unless told to
    /// refuse, and records operation calls. State is shared so a test can
    /// observe or flip it while the coordinator owns the session.
    struct StubSession {
        family: EcuFamily,
        descriptor: TransportDescriptor,
        state: Arc<Mutex<SessionState>>,
        identity: Option<EcuIdentity>,
        refuse_connect: bool,
        reads: usize,
    }

    impl StubSession {
        fn new(family: EcuFamily) -> Self {
            Self {
                family,
                descriptor: TransportDescriptor::serial("/dev/null", 9600),
                state: Arc::new(Mutex::new(SessionState::Disconnected)),
                identity: None,
                refuse_connect: false,
                reads: 0,
            }
        }

        fn refusing(family: EcuFamily) -> Self {
            let mut s = Self::new(family);
            s.refuse_connect = true;
            s
        }

        fn state_handle(&self) -> Arc<Mutex<SessionState>> {
            self.state.clone()
        }
    }

    impl EcuSession for StubSession {
        fn family(&self) -> EcuFamily {
            self.family
        }

        fn descriptor(&self) -> &TransportDescriptor {
            &self.descriptor
        }

        fn state(&self) -> SessionState {
            *self.state.lock().unwrap()
        }

        fn connect(&mut self) -> Result<EcuIdentity> {
            if self.refuse_connect {
                return Err(Error::Protocol(crate::error::ProtocolError::Timeout));
            }
            *self.state.lock().unwrap() = SessionState::Connected;
            let identity = EcuIdentity::new(self.family, "stub", "stub@0".into());
            self.identity = Some(identity.clone());
            Ok(identity)
        }

        fn disconnect(&mut self) -> Result<()> {
            *self.state.lock().unwrap() = SessionState::Disconnected;
            self.identity = None;
            Ok(())
        }

        fn read_memory(&mut self, _address: u32, length: u32) -> Result<Vec<u8>> {
            self.reads += 1;
            Ok(vec![self.family as u8; length as usize])
        }

        fn write_memory(&mut self, _address: u32, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn identity(&self) -> Option<&EcuIdentity> {
            self.identity.as_ref()
        }

        fn read_dtcs(&mut self) -> Result<Vec<DiagnosticCode>> {
            Ok(Vec::new())
        }

        fn clear_dtcs(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn bridge_with(families: &[EcuFamily]) -> EcuBridge {
        let bridge = EcuBridge::new();
        for &family in families {
            bridge.register(Box::new(StubSession::new(family)));
        }
        bridge
    }

    #[test]
    fn test_active_follows_most_recent_connect() {
        let bridge = bridge_with(&[EcuFamily::Bosch, EcuFamily::Denso]);
        bridge.connect(EcuFamily::Bosch).unwrap();
        bridge.connect(EcuFamily::Denso).unwrap();

        assert!(bridge.is_connected(Some(EcuFamily::Bosch)));
        assert!(bridge.is_connected(Some(EcuFamily::Denso)));

        // Family-less reads hit Denso, the most recent connect.
        let data = bridge.read_memory(0, 2, None).unwrap();
        assert_eq!(data, vec![EcuFamily::Denso as u8; 2]);
    }

    #[test]
    fn test_disconnect_active_does_not_revert() {
        let bridge = bridge_with(&[EcuFamily::Bosch, EcuFamily::Denso]);
        bridge.connect(EcuFamily::Bosch).unwrap();
        bridge.connect(EcuFamily::Denso).unwrap();
        bridge.disconnect(None).unwrap(); // drops Denso, the active one

        assert!(bridge.is_connected(Some(EcuFamily::Bosch)));
        assert!(!bridge.is_connected(None));
        let err = bridge.read_memory(0, 1, None).unwrap_err();
        assert!(matches!(
            err,
            Error::State(StateError::NoActiveSession)
        ));
    }

    #[test]
    fn test_unregistered_family_is_unsupported() {
        let bridge = bridge_with(&[EcuFamily::Bosch]);
        let err = bridge.connect(EcuFamily::Denso).unwrap_err();
        assert!(matches!(
            err,
            Error::State(StateError::UnsupportedFamily(EcuFamily::Denso))
        ));
    }

    #[test]
    fn test_register_replace_discards_record() {
        let bridge = bridge_with(&[EcuFamily::Bosch]);
        bridge.connect(EcuFamily::Bosch).unwrap();
        assert!(bridge.export_session(Some(EcuFamily::Bosch)).is_ok());

        bridge.register(Box::new(StubSession::new(EcuFamily::Bosch)));
        assert!(bridge.export_session(Some(EcuFamily::Bosch)).is_err());
        assert!(!bridge.is_connected(None));
        // Still exactly one listing for the family.
        assert_eq!(bridge.list_supported_families(), vec![EcuFamily::Bosch]);
    }

    #[test]
    fn test_export_session_shape() {
        let bridge = bridge_with(&[EcuFamily::Siemens]);
        bridge.connect(EcuFamily::Siemens).unwrap();
        let value = bridge.export_session(None).unwrap();
        assert_eq!(value["family"], "siemens");
        assert_eq!(value["live"], true);
        assert!(value["connected_at"].is_string());
        assert_eq!(value["identity"]["protocol"], "stub");
    }

    #[test]
    fn test_export_live_tracks_session_state() {
        let bridge = EcuBridge::new();
        let session = StubSession::new(EcuFamily::Bosch);
        let state = session.state_handle();
        bridge.register(Box::new(session));
        bridge.connect(EcuFamily::Bosch).unwrap();
        assert_eq!(bridge.export_session(None).unwrap()["live"], true);

        // Transport dies out from under the coordinator.
        *state.lock().unwrap() = SessionState::Disconnected;
        assert_eq!(bridge.export_session(None).unwrap()["live"], false);
    }

    #[test]
    fn test_probe_returns_first_answering_family() {
        let bridge = EcuBridge::new();
        bridge.register(Box::new(StubSession::refusing(EcuFamily::Bosch)));
        bridge.register(Box::new(StubSession::new(EcuFamily::Denso)));

        assert_eq!(bridge.probe(), Some(EcuFamily::Denso));
        // The probe connection is torn down again.
        assert!(!bridge.is_connected(Some(EcuFamily::Denso)));
        assert!(bridge.export_session(Some(EcuFamily::Denso)).is_err());
    }

    #[test]
    fn test_probe_with_no_answer() {
        let bridge = EcuBridge::new();
        bridge.register(Box::new(StubSession::refusing(EcuFamily::Bosch)));
        assert_eq!(bridge.probe(), None);
    }
}
