use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::model::dispatch::Dispatch;
use crate::ports::EventPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    General,
    Unit,
    Dispatch,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::General => write!(f, "general"),
            Topic::Unit => write!(f, "unit"),
            Topic::Dispatch => write!(f, "dispatch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Settings,
    Dispatchers,
    Created,
    Deleted,
    Updated,
    Status,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Settings => write!(f, "settings"),
            EventType::Dispatchers => write!(f, "dispatchers"),
            EventType::Created => write!(f, "created"),
            EventType::Deleted => write!(f, "deleted"),
            EventType::Updated => write!(f, "updated"),
            EventType::Status => write!(f, "status"),
        }
    }
}

/// `<service>.<job>.<topic>.<type>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub service: String,
    pub job: String,
    pub topic: Topic,
    pub event_type: EventType,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.service, self.job, self.topic, self.event_type
        )
    }
}

/// Publishes committed changes on the change bus.
///
/// Events are notifications after the fact: a failed publish is logged and
/// never undoes or fails the mutation that caused it.
#[derive(Clone)]
pub struct EventBus {
    service: String,
    publisher: Arc<dyn EventPublisher>,
}

impl EventBus {
    pub fn new(service: impl Into<String>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            service: service.into(),
            publisher,
        }
    }

    pub fn subject(&self, job: &str, topic: Topic, event_type: EventType) -> Subject {
        Subject {
            service: self.service.clone(),
            job: job.to_string(),
            topic,
            event_type,
        }
    }

    pub async fn publish<T: Serialize>(
        &self,
        job: &str,
        topic: Topic,
        event_type: EventType,
        payload: &T,
    ) {
        let subject = self.subject(job, topic, event_type).to_string();
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "Failed to encode event payload");
                return;
            }
        };
        if let Err(e) = self.publisher.publish(&subject, bytes).await {
            tracing::warn!(subject = %subject, error = %e, "Failed to publish event");
        }
    }

    /// Publish a dispatch event to every job that can see it.
    pub async fn publish_dispatch(&self, dsp: &Dispatch, event_type: EventType) {
        let view = dsp.public_view();
        for job in &dsp.jobs {
            self.publish(job, Topic::Dispatch, event_type, &view).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryEventPublisher;

    #[test]
    fn subject_format() {
        let subject = Subject {
            service: "centrum".to_string(),
            job: "police".to_string(),
            topic: Topic::Unit,
            event_type: EventType::Status,
        };
        assert_eq!(subject.to_string(), "centrum.police.unit.status");
    }

    #[tokio::test]
    async fn dispatch_events_fan_out_to_all_jobs() {
        let publisher = Arc::new(MemoryEventPublisher::new());
        let bus = EventBus::new("centrum", publisher.clone());
        let dsp = Dispatch::new(
            vec!["police".to_string(), "ambulance".to_string()],
            "m",
            0.0,
            0.0,
        );

        bus.publish_dispatch(&dsp, EventType::Created).await;

        assert_eq!(
            publisher.subjects().await,
            vec![
                "centrum.police.dispatch.created",
                "centrum.ambulance.dispatch.created"
            ]
        );
    }
}
