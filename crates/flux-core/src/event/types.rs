//! Entidad `Event`, su estado y el DTO `EventData`.
//!
//! Rol en el flujo:
//! - El motor de orquestación declara un evento (slot `pending`) cuando un
//!   estado depende de él, o lo crea ya `triggered` cuando la señal llega
//!   antes que la declaración.
//! - El productor entrega datos: `pending -> triggered` (junto con
//!   `event_data`/`event_source`).
//! - El workflow puede cancelar una dependencia pendiente o ya disparada:
//!   `pending|triggered -> cancelled`. No existe salida de `cancelled`.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EventStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Triggered,
    Cancelled,
}

impl EventStatus {
    /// Estados "resueltos" (en un sentido u otro): lo que consulta el motor
    /// para evaluar dependencias.
    pub const RESOLVED: [EventStatus; 2] = [EventStatus::Triggered, EventStatus::Cancelled];

    /// Representación persistida (minúsculas, estable en el tiempo).
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Triggered => "triggered",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, EventStatus::Pending)
    }

    /// Transiciones monótonas. Reescribir el mismo estado está permitido.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Triggered) => true,
            (Pending | Triggered, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "triggered" => Ok(EventStatus::Triggered),
            "cancelled" => Ok(EventStatus::Cancelled),
            other => Err(EventStoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Una señal declarada o entregada dentro de un workflow instance.
///
/// `id`, `created_at` y `updated_at` los asigna el storage: son `None` hasta
/// que `EventStore::create` devuelve la fila persistida.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub state_machine_instance_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: EventStatus,
    pub event_data: Option<String>,
    pub event_source: Option<String>,
    pub originating_state: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(instance_id: impl Into<String>,
               name: impl Into<String>,
               event_type: impl Into<String>,
               status: EventStatus)
               -> Self {
        Self { id: None,
               state_machine_instance_id: instance_id.into(),
               name: name.into(),
               event_type: event_type.into(),
               status,
               event_data: None,
               event_source: None,
               originating_state: None,
               created_at: None,
               updated_at: None }
    }

    /// Slot pendiente: dependencia declarada, sin datos todavía.
    pub fn pending(instance_id: impl Into<String>, name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self::new(instance_id, name, event_type, EventStatus::Pending)
    }

    /// Señal que llega con datos antes de haber sido declarada.
    pub fn triggered(instance_id: impl Into<String>,
                     name: impl Into<String>,
                     event_type: impl Into<String>,
                     event_data: impl Into<String>,
                     event_source: impl Into<String>)
                     -> Self {
        let mut ev = Self::new(instance_id, name, event_type, EventStatus::Triggered);
        ev.event_data = Some(event_data.into());
        ev.event_source = Some(event_source.into());
        ev
    }

    pub fn with_originating_state(mut self, state: impl Into<String>) -> Self {
        self.originating_state = Some(state.into());
        self
    }

    /// Entrega del productor: fija estado, datos y fuente en un solo paso.
    pub fn trigger(&mut self, event_data: impl Into<String>, event_source: impl Into<String>) -> Result<(), EventStoreError> {
        self.transition_to(EventStatus::Triggered)?;
        self.event_data = Some(event_data.into());
        self.event_source = Some(event_source.into());
        Ok(())
    }

    pub fn transition_to(&mut self, next: EventStatus) -> Result<(), EventStoreError> {
        if !self.status.can_transition_to(next) {
            return Err(EventStoreError::InvalidTransition { name: self.name.clone(),
                                                            from: self.status,
                                                            to: next });
        }
        self.status = next;
        Ok(())
    }

    pub fn to_event_data(&self) -> EventData {
        EventData::from(self)
    }
}

/// Proyección de sólo lectura entregada al motor: nunca expone `id` ni `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Option<String>,
    pub source: Option<String>,
}

impl From<&Event> for EventData {
    fn from(ev: &Event) -> Self {
        Self { name: ev.name.clone(),
               event_type: ev.event_type.clone(),
               data: ev.event_data.clone(),
               source: ev.event_source.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotone() {
        use EventStatus::*;
        assert!(Pending.can_transition_to(Triggered));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Triggered.can_transition_to(Cancelled));
        assert!(Triggered.can_transition_to(Triggered));
        assert!(!Triggered.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Triggered));
        assert!(Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn status_text_roundtrip_and_unknown() {
        for s in [EventStatus::Pending, EventStatus::Triggered, EventStatus::Cancelled] {
            assert_eq!(s.as_str().parse::<EventStatus>().unwrap(), s);
        }
        assert_eq!("PENDING".parse::<EventStatus>(),
                   Err(EventStoreError::UnknownStatus("PENDING".into())));
    }

    #[test]
    fn trigger_sets_data_and_source_together() {
        let mut ev = Event::pending("sm-1", "payment_received", "Internal");
        ev.trigger("{\"amount\":10}", "billing").unwrap();
        assert_eq!(ev.status, EventStatus::Triggered);
        assert_eq!(ev.event_data.as_deref(), Some("{\"amount\":10}"));
        assert_eq!(ev.event_source.as_deref(), Some("billing"));

        ev.transition_to(EventStatus::Cancelled).unwrap();
        let err = ev.trigger("again", "billing").unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidTransition { from: EventStatus::Cancelled, .. }));
        // el intento fallido no toca los datos
        assert_eq!(ev.event_data.as_deref(), Some("{\"amount\":10}"));
    }

    #[test]
    fn event_data_dto_hides_identity_and_status() {
        let mut ev = Event::triggered("sm-1", "e", "someType", "payload", "state1");
        ev.id = Some(42);
        let json = serde_json::to_value(ev.to_event_data()).unwrap();
        assert_eq!(json, serde_json::json!({"name": "e", "type": "someType", "data": "payload", "source": "state1"}));
    }
}
