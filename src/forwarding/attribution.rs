//! Renders the attribution header prepended when re-sending instead of
//! natively forwarding.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::AttributionConfig;

/// Values substituted into the attribution template.
#[derive(Clone, Debug)]
pub struct AttributionContext {
    pub source_channel_name: String,
    pub source_channel_id: i64,
    pub sender_name: String,
    pub sender_id: i64,
    pub timestamp: DateTime<Utc>,
    pub message_id: i64,
}

pub struct AttributionFormatter {
    template: String,
    timestamp_format: String,
    disabled_destinations: HashSet<i64>,
}

impl AttributionFormatter {
    pub fn from_config(config: &AttributionConfig) -> Self {
        Self {
            template: config.template.clone(),
            timestamp_format: config.timestamp_format.clone(),
            disabled_destinations: config
                .disable_attribution_for_groups
                .iter()
                .copied()
                .collect(),
        }
    }

    /// Destinations listed in the config get no attribution at all.
    pub fn is_disabled_for(&self, destination_id: i64) -> bool {
        self.disabled_destinations.contains(&destination_id)
    }

    pub fn render(&self, ctx: &AttributionContext) -> String {
        let timestamp = ctx.timestamp.format(&self.timestamp_format).to_string();
        let mut rendered = self.template.clone();
        for (placeholder, value) in [
            ("{source_channel_name}", ctx.source_channel_name.clone()),
            ("{source_channel_id}", ctx.source_channel_id.to_string()),
            ("{sender_name}", ctx.sender_name.clone()),
            ("{sender_id}", ctx.sender_id.to_string()),
            ("{timestamp}", timestamp),
            ("{message_id}", ctx.message_id.to_string()),
        ] {
            rendered = rendered.replace(placeholder, &value);
        }
        rendered
    }

    /// Header for one member of a delivered group: a position marker for
    /// multi-part groups, then the rendered attribution.
    pub fn render_group_member(
        &self,
        ctx: &AttributionContext,
        member_index: usize,
        group_size: usize,
    ) -> String {
        let attribution = self.render(ctx);
        if group_size > 1 {
            format!(
                "[Group item {}/{}] {}",
                member_index + 1,
                group_size,
                attribution
            )
        } else {
            attribution
        }
    }
}
