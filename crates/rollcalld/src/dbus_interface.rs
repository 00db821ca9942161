use crate::auth::{AuthError, PasswordGate};
use crate::session::{Session, SessionError};
use crate::store::StoreError;
use chrono::Local;
use rollcall_core::records::RECENT_RECORDS_LIMIT;
use rollcall_core::{RecordFilter, RecordStats};
use serde::Serialize;
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    session: Arc<Session>,
    gate: PasswordGate,
}

impl RollcallService {
    pub fn new(session: Arc<Session>, gate: PasswordGate) -> Self {
        Self { session, gate }
    }

    fn check_password(&self, password: &str, operation: &str) -> fdo::Result<()> {
        self.gate.verify(password).map_err(|e| {
            tracing::warn!(operation, reason = %e, "password check failed");
            match e {
                AuthError::NotConfigured => fdo::Error::AccessDenied(
                    "no admin password is configured on this machine".into(),
                ),
                other => fdo::Error::AccessDenied(other.to_string()),
            }
        })
    }

    fn filter(search: &str, date: &str) -> fdo::Result<RecordFilter> {
        RecordFilter::from_parts(search, date)
            .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date {date:?}: {e}")))
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn session_error(e: SessionError) -> fdo::Error {
    match e {
        SessionError::InvalidInput(msg) => fdo::Error::InvalidArgs(msg),
        SessionError::Descriptor(e) => fdo::Error::InvalidArgs(e.to_string()),
        SessionError::UnknownPerson(id) => fdo::Error::InvalidArgs(format!("unknown person: {id}")),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn store_error(e: StoreError) -> fdo::Error {
    tracing::error!(error = %e, "storage request failed");
    fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Acquire the camera and begin attendance sampling.
    async fn start(&self) -> fdo::Result<()> {
        tracing::info!("start requested");
        self.session.start().await.map_err(session_error)
    }

    /// Stop sampling and release the camera. Returns whether it was running.
    async fn stop(&self) -> fdo::Result<bool> {
        tracing::info!("stop requested");
        Ok(self.session.stop().await)
    }

    async fn status(&self) -> fdo::Result<String> {
        let status = self.session.status().await;
        let mut value =
            serde_json::to_value(&status).map_err(|e| fdo::Error::Failed(e.to_string()))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }

    /// Arrivals accepted since the daemon started, newest first.
    async fn recent(&self) -> fdo::Result<String> {
        to_json(&self.session.recent().await)
    }

    /// Capture a face from the camera and register it.
    async fn register(&self, name: &str, class: &str) -> fdo::Result<String> {
        tracing::info!(class, "register requested");
        let person = self.session.register(name, class).await.map_err(session_error)?;
        to_json(&person)
    }

    async fn register_descriptor(
        &self,
        name: &str,
        class: &str,
        descriptor: &str,
    ) -> fdo::Result<String> {
        tracing::info!(class, "register with descriptor requested");
        let person = self
            .session
            .register_descriptor(name, class, descriptor)
            .await
            .map_err(session_error)?;
        to_json(&person)
    }

    async fn reenroll(&self, person_id: &str) -> fdo::Result<()> {
        tracing::info!(person_id, "reenroll requested");
        self.session.reenroll(person_id).await.map_err(session_error)
    }

    async fn list_people(&self) -> fdo::Result<String> {
        let people = self.session.store().list_people().await.map_err(store_error)?;
        to_json(&people)
    }

    async fn remove_person(&self, person_id: &str) -> fdo::Result<bool> {
        tracing::info!(person_id, "remove_person requested");
        self.session.remove_person(person_id).await.map_err(session_error)
    }

    /// The newest matching records. Empty strings mean "no filter".
    async fn list_records(&self, search: &str, date: &str) -> fdo::Result<String> {
        let filter = Self::filter(search, date)?;
        let records = self
            .session
            .store()
            .records(&filter, Some(RECENT_RECORDS_LIMIT))
            .await
            .map_err(store_error)?;
        to_json(&records)
    }

    async fn late_comers(&self) -> fdo::Result<String> {
        let roster = self.session.store().late_comers().await.map_err(store_error)?;
        to_json(&roster)
    }

    async fn stats(&self) -> fdo::Result<String> {
        let records = self
            .session
            .store()
            .records(&RecordFilter::default(), None)
            .await
            .map_err(store_error)?;
        to_json(&RecordStats::compute(&records, Local::now().date_naive()))
    }

    /// Every matching record, for spreadsheet export. Password protected.
    async fn export_records(
        &self,
        password: &str,
        search: &str,
        date: &str,
    ) -> fdo::Result<String> {
        self.check_password(password, "export")?;
        let filter = Self::filter(search, date)?;
        let records = self
            .session
            .store()
            .records(&filter, None)
            .await
            .map_err(store_error)?;
        tracing::info!(count = records.len(), "records exported");
        to_json(&records)
    }

    /// Delete all attendance records. Password protected.
    async fn clear_records(&self, password: &str) -> fdo::Result<u64> {
        self.check_password(password, "clear")?;
        let removed = self.session.store().clear_records().await.map_err(store_error)?;
        Ok(removed as u64)
    }
}
