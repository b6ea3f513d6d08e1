use serde::{Deserialize, Serialize};

/// A forum topic as reported by the gateway's topic listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicSnapshot {
    pub topic_id: i64,
    pub title: String,
    pub icon_color: u32,
    pub icon_emoji_id: Option<i64>,
    pub message_count: i64,
    pub last_activity_at: Option<i64>,
}

/// Persisted forum topic row, mirroring the gateway state plus the category
/// the organization engine filed it under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForumTopicRecord {
    pub channel_id: i64,
    pub topic_id: i64,
    pub title: String,
    pub icon_color: u32,
    pub icon_emoji_id: Option<i64>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub description: Option<String>,
    pub message_count: i64,
    pub created_at: i64,
    pub last_activity_at: Option<i64>,
    pub is_active: bool,
}

/// How a topic assignment was decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    Auto,
    Fallback,
    Manual,
}

impl AssignmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fallback => "fallback",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto" => Some(Self::Auto),
            "fallback" => Some(Self::Fallback),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Persisted classification output for one message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentMetadataRecord {
    pub message_id: i64,
    pub channel_id: i64,
    pub content_type: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub file_extension: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub duration: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub keywords: Option<String>,
    pub classification_confidence: f64,
    pub additional_metadata: Option<String>,
}

/// Persisted routing decision for one message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicAssignmentRecord {
    pub message_id: i64,
    pub channel_id: i64,
    pub topic_id: Option<i64>,
    pub topic_title: Option<String>,
    pub category: Option<String>,
    pub assignment_method: AssignmentMethod,
    pub confidence: f64,
    pub fallback_used: bool,
}

/// Additive delta applied to the per-day organization stats row.
#[derive(Clone, Debug, Default)]
pub struct StatsDelta {
    pub messages_processed: i64,
    pub topics_created: i64,
    pub successful_assignments: i64,
    pub failed_assignments: i64,
    pub fallback_used: i64,
    pub categories: std::collections::BTreeMap<String, i64>,
}

/// Accumulated per-day organization stats for one channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationStatsRecord {
    pub channel_id: i64,
    pub date: String,
    pub messages_processed: i64,
    pub topics_created: i64,
    pub successful_assignments: i64,
    pub failed_assignments: i64,
    pub fallback_used: i64,
    pub categories: std::collections::BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_method_round_trip() {
        for method in [
            AssignmentMethod::Auto,
            AssignmentMethod::Fallback,
            AssignmentMethod::Manual,
        ] {
            assert_eq!(AssignmentMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(AssignmentMethod::parse("guesswork"), None);
    }

    #[test]
    fn test_stats_delta_default_is_zero() {
        let delta = StatsDelta::default();
        assert_eq!(delta.messages_processed, 0);
        assert_eq!(delta.topics_created, 0);
        assert!(delta.categories.is_empty());
    }
}
