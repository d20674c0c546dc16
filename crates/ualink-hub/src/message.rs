//! Control messages sent by hub clients, and per-client filters.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// A parsed client control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    SubscribeAll,
    UnsubscribeAll,
}

/// Wire form: `{"action": "...", "node_ids": [...]}`
#[derive(Debug, Deserialize, Serialize)]
struct RawControlMessage {
    action: String,
    #[serde(default)]
    node_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ControlParseError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown control action: {0}")]
    UnknownAction(String),
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ControlParseError> {
        let raw: RawControlMessage = serde_json::from_str(text)?;
        match raw.action.as_str() {
            "subscribe" => Ok(ControlMessage::Subscribe(raw.node_ids)),
            "unsubscribe" => Ok(ControlMessage::Unsubscribe(raw.node_ids)),
            "subscribe_all" => Ok(ControlMessage::SubscribeAll),
            "unsubscribe_all" => Ok(ControlMessage::UnsubscribeAll),
            _ => Err(ControlParseError::UnknownAction(raw.action)),
        }
    }

    pub fn to_json(&self) -> String {
        let (action, node_ids) = match self {
            ControlMessage::Subscribe(ids) => ("subscribe", ids.clone()),
            ControlMessage::Unsubscribe(ids) => ("unsubscribe", ids.clone()),
            ControlMessage::SubscribeAll => ("subscribe_all", Vec::new()),
            ControlMessage::UnsubscribeAll => ("unsubscribe_all", Vec::new()),
        };
        serde_json::to_string(&RawControlMessage {
            action: action.to_string(),
            node_ids,
        })
        .unwrap_or_default()
    }
}

/// Which node ids a client receives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientFilter {
    pub nodes: HashSet<String>,
    pub all: bool,
}

impl ClientFilter {
    pub fn matches(&self, node_id: &str) -> bool {
        self.all || self.nodes.contains(node_id)
    }

    /// Apply a control message to the filter.
    pub fn apply(&mut self, message: &ControlMessage) {
        match message {
            ControlMessage::Subscribe(ids) => self.nodes.extend(ids.iter().cloned()),
            ControlMessage::Unsubscribe(ids) => {
                for id in ids {
                    self.nodes.remove(id);
                }
            }
            ControlMessage::SubscribeAll => self.all = true,
            ControlMessage::UnsubscribeAll => self.all = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            ControlMessage::parse(r#"{"action":"subscribe","node_ids":["ns=2;s=A"]}"#).unwrap(),
            ControlMessage::Subscribe(vec!["ns=2;s=A".to_string()])
        );
        assert_eq!(
            ControlMessage::parse(r#"{"action":"subscribe_all"}"#).unwrap(),
            ControlMessage::SubscribeAll
        );
        assert!(matches!(
            ControlMessage::parse(r#"{"action":"explode"}"#),
            Err(ControlParseError::UnknownAction(_))
        ));
        assert!(matches!(
            ControlMessage::parse("not json"),
            Err(ControlParseError::Json(_))
        ));
    }

    #[test]
    fn test_round_trip_wire_form() {
        let message = ControlMessage::Unsubscribe(vec!["i=2258".to_string()]);
        assert_eq!(ControlMessage::parse(&message.to_json()).unwrap(), message);
    }

    #[test]
    fn test_filter() {
        let mut filter = ClientFilter::default();
        assert!(!filter.matches("a"));

        filter.apply(&ControlMessage::Subscribe(vec!["a".into(), "b".into()]));
        filter.apply(&ControlMessage::Unsubscribe(vec!["b".into()]));
        assert!(filter.matches("a"));
        assert!(!filter.matches("b"));

        filter.apply(&ControlMessage::SubscribeAll);
        assert!(filter.matches("anything"));
        filter.apply(&ControlMessage::UnsubscribeAll);
        assert!(!filter.matches("anything"));
    }
}
