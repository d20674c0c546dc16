//! Reading and formatting node attributes.

use crate::convert::format_value;
use std::time::Duration;
use ualink_client::ProtocolSession;
use ualink_core::error::ProtocolError;
use ualink_core::types::{builtin_type_name, AccessLevel, AttributeId, NodeAttributes, NodeClass};
use ualink_core::value::{ArrayValue, DataValue, Variant};

/// Deadline for a single attribute read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const ATTRIBUTES: [AttributeId; 10] = [
    AttributeId::NodeId,
    AttributeId::NodeClass,
    AttributeId::DisplayName,
    AttributeId::Description,
    AttributeId::AccessLevel,
    AttributeId::UserAccessLevel,
    AttributeId::DataType,
    AttributeId::Value,
    AttributeId::ValueRank,
    AttributeId::ArrayDimensions,
];

/// Reads the attributes of one node and formats them for display.
///
/// Attributes the node does not have are left at their defaults. The user
/// access level wins over the plain access level when the server reports one.
pub async fn read_node_attributes(
    session: &dyn ProtocolSession,
    node_id: &str,
) -> Result<NodeAttributes, ProtocolError> {
    let results = tokio::time::timeout(READ_TIMEOUT, session.read_attributes(node_id, &ATTRIBUTES))
        .await
        .map_err(|_| ProtocolError::timeout("read", READ_TIMEOUT))??;

    let mut attributes = NodeAttributes {
        value_rank: -1,
        ..Default::default()
    };
    let mut raw_value = None;
    let mut access_level = None;
    let mut user_access_level = None;

    for (attribute, result) in ATTRIBUTES.iter().zip(results) {
        let DataValue { value, status, .. } = result;
        if !status.is_good() {
            continue;
        }
        match attribute {
            AttributeId::NodeId => {
                if let Some(id) = value.as_text() {
                    attributes.node_id = id.to_string();
                }
            }
            AttributeId::NodeClass => {
                if let Some(class) = value.as_i64() {
                    attributes.node_class = NodeClass::from_value(class as u32).to_string();
                }
            }
            AttributeId::DisplayName => {
                if let Some(name) = value.as_text() {
                    attributes.name = name.to_string();
                }
            }
            AttributeId::Description => {
                if let Some(description) = value.as_text() {
                    attributes.description = description.to_string();
                }
            }
            AttributeId::AccessLevel => access_level = value.as_i64(),
            AttributeId::UserAccessLevel => user_access_level = value.as_i64(),
            AttributeId::DataType => {
                if let Some(id) = value.as_text() {
                    attributes.data_type = builtin_type_name(id);
                }
            }
            AttributeId::Value => raw_value = Some(value),
            AttributeId::ValueRank => {
                if let Some(rank) = value.as_i64() {
                    attributes.value_rank = rank as i32;
                }
            }
            AttributeId::ArrayDimensions => {
                if let Variant::Array(ArrayValue::UInt32(dimensions)) = value {
                    attributes.array_dimensions = dimensions;
                }
            }
            _ => {}
        }
    }

    if attributes.node_id.is_empty() {
        attributes.node_id = node_id.to_string();
    }

    let level = match (user_access_level, access_level) {
        (Some(user), _) if user > 0 => Some(user),
        (_, Some(level)) => Some(level),
        (user, None) => user,
    };
    if let Some(level) = level {
        let level = AccessLevel(level as u8);
        attributes.access_level = level.to_string();
        attributes.writable = level.is_writable();
    }

    if let Some(value) = raw_value {
        attributes.value = format_value(&value, &attributes.data_type);
    }

    Ok(attributes)
}
