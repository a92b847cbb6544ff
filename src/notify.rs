use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::{Appointment, Role};

const CHANNEL_CAPACITY: usize = 256;

/// Domain events published for external notifiers (email, push, calendars).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentCancelled {
        appointment: Appointment,
        cancelled_by: Role,
        credited_back: bool,
    },
    AppointmentRescheduled {
        previous: Appointment,
        replacement: Appointment,
    },
    AppointmentOutcomeRecorded {
        appointment: Appointment,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::AppointmentBooked { .. } => "appointment_booked",
            DomainEvent::AppointmentCancelled { .. } => "appointment_cancelled",
            DomainEvent::AppointmentRescheduled { .. } => "appointment_rescheduled",
            DomainEvent::AppointmentOutcomeRecorded { .. } => "appointment_outcome_recorded",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub for domain events of one tenant.
pub struct NotifyHub {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}

/// Forward a tenant's domain events to the log as JSON, one line per event.
/// Stands in for the external notifier; runs until the hub is dropped.
pub async fn run_relay(tenant: String, mut rx: broadcast::Receiver<DomainEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.to_json() {
                Ok(payload) => info!(target: "tutorslot::notify", %tenant, event = event.name(), %payload),
                Err(e) => warn!("cannot encode {} for {tenant}: {e}", event.name()),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("notification relay for {tenant} lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
