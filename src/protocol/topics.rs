//! MQTT topic validation
//!
//! Publish topics must be concrete names; subscribe topics may be filters with
//! `+` and `#` wildcards in their MQTT-legal positions.

use crate::error::{AgentError, AgentResult};

/// Maximum topic length allowed by MQTT (UTF-8 encoded string length prefix)
pub const MAX_TOPIC_LEN: usize = 65_535;

fn validate_common(topic: &str) -> AgentResult<()> {
    if topic.is_empty() {
        return Err(AgentError::invalid_topic(topic, "topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(AgentError::invalid_topic(
            topic.chars().take(32).collect::<String>(),
            format!("topic longer than {MAX_TOPIC_LEN} bytes"),
        ));
    }
    if topic.contains('\0') {
        return Err(AgentError::invalid_topic(topic, "topic contains NUL"));
    }
    Ok(())
}

/// Validate a topic name used for publishing
pub fn validate_publish_topic(topic: &str) -> AgentResult<()> {
    validate_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(AgentError::invalid_topic(
            topic,
            "wildcards are not allowed in publish topics",
        ));
    }
    Ok(())
}

/// Validate a topic filter used for subscribing
pub fn validate_topic_filter(filter: &str) -> AgentResult<()> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(AgentError::invalid_topic(
                filter,
                "`#` must occupy the whole last level",
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(AgentError::invalid_topic(
                filter,
                "`+` must occupy a whole level",
            ));
        }
    }
    Ok(())
}

/// Whether a concrete topic matches a (validated) topic filter
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
