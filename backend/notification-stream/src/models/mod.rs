use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Notification category (domain tag set by the producer)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationCategory {
    /// Platform-wide or maintenance notices
    System,
    /// Activity caused by another user
    User,
    /// Workflow step assigned, approved or rejected
    Workflow,
    /// Due date or scheduled reminder
    Reminder,
    /// Security-relevant account activity
    Security,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::System => "system",
            NotificationCategory::User => "user",
            NotificationCategory::Workflow => "workflow",
            NotificationCategory::Reminder => "reminder",
            NotificationCategory::Security => "security",
        }
    }
}

/// Notification priority level
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationPriority {
    Low,
    #[default]
    Medium,
    High,
    /// Clients are expected to surface these immediately
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }
}

/// Notification as produced by the rest of the platform.
///
/// The stream engine never creates or persists these; it reads one at
/// dispatch time and turns it into a `notification` stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Producer-assigned id, treated as opaque
    #[serde(default = "new_notification_id")]
    pub id: String,

    /// Recipient user ID
    pub user_id: String,

    /// Owning organization, if the notification is organization scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,

    pub title: String,

    pub message: String,

    pub category: NotificationCategory,

    #[serde(default)]
    pub priority: NotificationPriority,

    /// Deep link the client opens when the notification is clicked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_notification_id() -> String {
    Uuid::new_v4().to_string()
}

impl Notification {
    /// Create a user-scoped SYSTEM notification with MEDIUM priority
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: new_notification_id(),
            user_id: user_id.into(),
            organization_id: None,
            title: title.into(),
            message: message.into(),
            category: NotificationCategory::System,
            priority: NotificationPriority::default(),
            action_url: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_category(mut self, category: NotificationCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action_url(mut self, action_url: impl Into<String>) -> Self {
        self.action_url = Some(action_url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_serializes_camel_case() {
        let notification = Notification::new("u1", "Report ready", "Your export finished")
            .with_organization("o1")
            .with_action_url("/exports/42");

        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["organizationId"], "o1");
        assert_eq!(value["actionUrl"], "/exports/42");
        assert_eq!(value["category"], "SYSTEM");
        assert_eq!(value["priority"], "MEDIUM");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_notification_deserializes_with_defaults() {
        let payload = json!({
            "id": Uuid::new_v4(),
            "userId": "u7",
            "title": "Approval needed",
            "message": "Invoice #12 awaits your approval",
            "category": "WORKFLOW"
        });

        let notification: Notification = serde_json::from_value(payload).unwrap();
        assert_eq!(notification.user_id, "u7");
        assert_eq!(notification.organization_id, None);
        assert_eq!(notification.category, NotificationCategory::Workflow);
        assert_eq!(notification.priority, NotificationPriority::Medium);
    }

    #[test]
    fn test_notification_accepts_non_uuid_id() {
        let notification: Notification = serde_json::from_value(json!({
            "id": "clx9f2k0a0000qz8h3n1b2c3d",
            "userId": "u7",
            "title": "Invoice approved",
            "message": "INV-1042 was approved",
            "category": "WORKFLOW"
        }))
        .unwrap();

        assert_eq!(notification.id, "clx9f2k0a0000qz8h3n1b2c3d");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(NotificationPriority::Urgent > NotificationPriority::High);
        assert!(NotificationPriority::High > NotificationPriority::Medium);
        assert!(NotificationPriority::Medium > NotificationPriority::Low);
        assert_eq!(NotificationPriority::Urgent.as_str(), "urgent");
    }

    #[test]
    fn test_metadata_builder() {
        let notification = Notification::new("u1", "t", "m")
            .with_metadata("invoiceId", json!(12))
            .with_metadata("amount", json!("99.50"));

        let metadata = notification.metadata.unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["invoiceId"], json!(12));
        assert_eq!(NotificationCategory::Security.as_str(), "security");
    }
}
