// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound campaign-tool events and what they mean.
//!
//! Every [`EventType`] has a static [`EventPolicy`]: the status it pushes the
//! lead towards (if any), a qualification label, and which side effects it
//! triggers. The lookups here are pure and total; deciding *whether* to apply
//! a status is the coordinator's job.
//!
//! # Example
//!
//! ```
//! use lead_sync::{EventType, StatusKey};
//! use lead_sync::event::{status_for_event, should_suppress};
//!
//! assert_eq!(status_for_event(EventType::ReplyReceived), Some(StatusKey::ShouldBeContacted));
//! assert_eq!(status_for_event(EventType::EmailOpened), None);
//! assert!(should_suppress(EventType::Bounced));
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigError;
use crate::status::StatusKey;

/// Event kinds emitted by the outbound campaign tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LeadEnrolled,
    EmailSent,
    EmailOpened,
    EmailClicked,
    ReplyReceived,
    Interested,
    MeetingBooked,
    OutOfOffice,
    NotInterested,
    Bounced,
    Unsubscribed,
    CampaignCompleted,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::LeadEnrolled,
        EventType::EmailSent,
        EventType::EmailOpened,
        EventType::EmailClicked,
        EventType::ReplyReceived,
        EventType::Interested,
        EventType::MeetingBooked,
        EventType::OutOfOffice,
        EventType::NotInterested,
        EventType::Bounced,
        EventType::Unsubscribed,
        EventType::CampaignCompleted,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeadEnrolled => "lead_enrolled",
            Self::EmailSent => "email_sent",
            Self::EmailOpened => "email_opened",
            Self::EmailClicked => "email_clicked",
            Self::ReplyReceived => "reply_received",
            Self::Interested => "interested",
            Self::MeetingBooked => "meeting_booked",
            Self::OutOfOffice => "out_of_office",
            Self::NotInterested => "not_interested",
            Self::Bounced => "bounced",
            Self::Unsubscribed => "unsubscribed",
            Self::CampaignCompleted => "campaign_completed",
        }
    }

    /// Static policy for this event.
    #[must_use]
    pub const fn policy(self) -> EventPolicy {
        EventPolicy::for_event(self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownEventType(s.to_string()))
    }
}

/// What an event means for a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventPolicy {
    pub target_status: Option<StatusKey>,
    pub qualification_label: Option<&'static str>,
    pub add_to_suppression_list: bool,
    pub log_activity: bool,
    pub update_engagement_metrics: bool,
}

impl EventPolicy {
    const fn new(target_status: Option<StatusKey>, qualification_label: Option<&'static str>) -> Self {
        Self {
            target_status,
            qualification_label,
            add_to_suppression_list: false,
            log_activity: true,
            update_engagement_metrics: false,
        }
    }

    const fn suppress(mut self) -> Self {
        self.add_to_suppression_list = true;
        self
    }

    const fn engagement(mut self) -> Self {
        self.update_engagement_metrics = true;
        self
    }

    const fn quiet(mut self) -> Self {
        self.log_activity = false;
        self
    }

    /// The policy table. Exhaustive over [`EventType`].
    #[must_use]
    pub const fn for_event(event: EventType) -> Self {
        use StatusKey::*;

        match event {
            EventType::LeadEnrolled => Self::new(Some(InCampaign), None),
            EventType::EmailSent => Self::new(None, None).engagement(),
            EventType::EmailOpened => Self::new(None, None).engagement().quiet(),
            EventType::EmailClicked => Self::new(None, Some("engaged")).engagement(),
            EventType::ReplyReceived => Self::new(Some(ShouldBeContacted), Some("replied")).engagement(),
            EventType::Interested => Self::new(Some(ShouldBeContacted), Some("interested")).engagement(),
            EventType::MeetingBooked => Self::new(Some(InNegotiation), Some("meeting booked")).engagement(),
            EventType::OutOfOffice => Self::new(None, None),
            EventType::NotInterested => Self::new(Some(StopContacting), Some("not interested")).suppress(),
            EventType::Bounced => Self::new(Some(StopContacting), Some("bounced")).suppress(),
            EventType::Unsubscribed => Self::new(Some(StopContacting), Some("unsubscribed")).suppress(),
            EventType::CampaignCompleted => Self::new(Some(NoReplyInCampaign), None),
        }
    }
}

#[must_use]
pub fn status_for_event(event: EventType) -> Option<StatusKey> {
    EventPolicy::for_event(event).target_status
}

#[must_use]
pub fn qualification_label_for_event(event: EventType) -> Option<&'static str> {
    EventPolicy::for_event(event).qualification_label
}

#[must_use]
pub fn should_suppress(event: EventType) -> bool {
    EventPolicy::for_event(event).add_to_suppression_list
}

#[must_use]
pub fn should_log_activity(event: EventType) -> bool {
    EventPolicy::for_event(event).log_activity
}

#[must_use]
pub fn should_update_engagement(event: EventType) -> bool {
    EventPolicy::for_event(event).update_engagement_metrics
}

/// One webhook delivery from the campaign tool.
///
/// Delivery is at-least-once; the same event may arrive more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// The lead's id in the CRM
    pub lead_id: String,
    pub event_type: EventType,
    /// Epoch millis at the source
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Value,
}

impl InboundEvent {
    pub fn new(lead_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            lead_id: lead_id.into(),
            event_type,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
            metadata: Value::Null,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn policy(&self) -> EventPolicy {
        EventPolicy::for_event(self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_negative_signals_target_stop_contacting_and_suppress() {
        for event in [EventType::Bounced, EventType::Unsubscribed, EventType::NotInterested] {
            assert_eq!(status_for_event(event), Some(StatusKey::StopContacting));
            assert!(should_suppress(event));
        }
    }

    #[test]
    fn test_only_negative_signals_suppress() {
        let suppressing: Vec<_> = EventType::ALL.into_iter().filter(|e| should_suppress(*e)).collect();
        assert_eq!(
            suppressing,
            vec![EventType::NotInterested, EventType::Bounced, EventType::Unsubscribed]
        );
    }

    #[test]
    fn test_informational_events_have_no_target() {
        for event in [EventType::EmailSent, EventType::EmailOpened, EventType::EmailClicked, EventType::OutOfOffice] {
            assert_eq!(status_for_event(event), None);
        }
    }

    #[test]
    fn test_qualification_labels() {
        assert_eq!(qualification_label_for_event(EventType::ReplyReceived), Some("replied"));
        assert_eq!(qualification_label_for_event(EventType::MeetingBooked), Some("meeting booked"));
        assert_eq!(qualification_label_for_event(EventType::EmailSent), None);
    }

    #[test]
    fn test_opens_update_engagement_without_activity() {
        assert!(should_update_engagement(EventType::EmailOpened));
        assert!(!should_log_activity(EventType::EmailOpened));
        assert!(should_log_activity(EventType::CampaignCompleted));
        assert!(!should_update_engagement(EventType::CampaignCompleted));
    }

    #[test]
    fn test_event_type_parse_roundtrip() {
        for event in EventType::ALL {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
            assert_eq!(event.to_string(), event.as_str());
        }
        assert!("email_forwarded".parse::<EventType>().is_err());
    }

    #[test]
    fn test_inbound_event_from_webhook_json() {
        let payload = json!({
            "lead_id": "crm-42",
            "event_type": "reply_received",
            "timestamp": 1_700_000_000_000_i64,
            "metadata": {"campaign": "q3-outbound"}
        });
        let event: InboundEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.lead_id, "crm-42");
        assert_eq!(event.event_type, EventType::ReplyReceived);
        assert_eq!(event.metadata["campaign"], "q3-outbound");
    }

    #[test]
    fn test_inbound_event_defaults_optional_fields() {
        let event: InboundEvent =
            serde_json::from_value(json!({"lead_id": "a", "event_type": "bounced"})).unwrap();
        assert_eq!(event.timestamp, 0);
        assert!(event.metadata.is_null());
    }

    #[test]
    fn test_unknown_event_type_rejected_by_serde() {
        let result: Result<InboundEvent, _> =
            serde_json::from_value(json!({"lead_id": "a", "event_type": "teleported"}));
        assert!(result.is_err());
    }
}
