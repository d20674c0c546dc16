//! Typed writes with a type-mismatch retry ladder.

use crate::attributes::read_node_attributes;
use crate::controller::Controller;
use crate::convert::{format_value, normalize_type, parse_array, parse_literal, preferred_scalar_type};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use ualink_client::ProtocolSession;
use ualink_core::error::{ConnectionError, ProtocolError, UalinkError, WriteError};
use ualink_core::types::{builtin_type_name, AttributeId};
use ualink_core::value::Variant;

/// Deadline for reading the current value before a scalar write.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for one write request.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the read-back after a successful write.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Representations tried, in order, after the server type has been refused.
pub const FALLBACK_TYPES: [&str; 11] = [
    "bytestring",
    "double",
    "float",
    "int64",
    "int32",
    "int16",
    "uint64",
    "uint32",
    "uint16",
    "boolean",
    "string",
];

/// Runs one write against a session.
pub struct WriteEngine {
    session: Arc<dyn ProtocolSession>,
}

impl WriteEngine {
    pub fn new(session: Arc<dyn ProtocolSession>) -> Self {
        Self { session }
    }

    /// Converts `literal` and writes it to `node_id`, returning the value the
    /// server accepted.
    ///
    /// `hint` names the type to convert to. When the server declares a data
    /// type for the node, that type wins. If the attributes cannot be read the
    /// write goes ahead as a scalar of the hinted type.
    pub async fn run(&self, node_id: &str, hint: &str, literal: &str) -> Result<Variant, WriteError> {
        let attributes = match read_node_attributes(self.session.as_ref(), node_id).await {
            Ok(attributes) => Some(attributes),
            Err(e) => {
                warn!(node_id, hint, error = %e, "Attributes unavailable, writing with requested type");
                None
            }
        };

        if let Some(attributes) = attributes.as_ref().filter(|a| !a.writable) {
            let access_level = if attributes.access_level.is_empty() {
                "None".to_string()
            } else {
                attributes.access_level.clone()
            };
            return Err(WriteError::NotWritable {
                node_id: node_id.to_string(),
                access_level,
            });
        }

        let data_type = match attributes.as_ref().filter(|a| !a.data_type.is_empty()) {
            Some(attributes) => {
                if !hint.trim().is_empty() && normalize_type(hint) != normalize_type(&attributes.data_type) {
                    info!(
                        node_id,
                        hint,
                        server_type = %attributes.data_type,
                        "Server data type overrides requested type"
                    );
                }
                attributes.data_type.clone()
            }
            None => hint.to_string(),
        };
        let value_rank = attributes.as_ref().map_or(-1, |a| a.value_rank);

        let value = if value_rank >= 0 {
            parse_array(&data_type, literal)?
        } else {
            self.convert_scalar(node_id, &data_type, literal).await?
        };

        let first_error = match self.try_write(node_id, value.clone()).await {
            Ok(()) => {
                self.verify(node_id).await;
                return Ok(value);
            }
            Err(e) if e.is_type_mismatch() => e,
            Err(e) => return Err(rejected(node_id, &e)),
        };

        info!(
            node_id,
            attempted = %value.type_name(),
            error = %first_error,
            "Type mismatch, trying other representations"
        );
        self.retry_ladder(node_id, &data_type, literal, value, first_error)
            .await
    }

    /// Parses a scalar, preferring the concrete kind of the current value.
    async fn convert_scalar(&self, node_id: &str, data_type: &str, literal: &str) -> Result<Variant, WriteError> {
        let probe = tokio::time::timeout(PROBE_TIMEOUT, self.session.read_value(node_id)).await;
        let preferred = match probe {
            Ok(Ok(current)) if current.status.is_good() => preferred_scalar_type(&current.value),
            Ok(Ok(_)) | Ok(Err(_)) => None,
            Err(_) => {
                debug!(node_id, "Value probe timed out");
                None
            }
        };

        if let Some(kind) = preferred.filter(|kind| *kind != normalize_type(data_type)) {
            match parse_literal(kind, literal) {
                Ok(value) => {
                    debug!(node_id, kind, "Using type of current value");
                    return Ok(value);
                }
                Err(e) => debug!(node_id, kind, error = %e, "Current value type did not fit"),
            }
        }
        parse_literal(data_type, literal)
    }

    async fn try_write(&self, node_id: &str, value: Variant) -> Result<(), ProtocolError> {
        tokio::time::timeout(WRITE_TIMEOUT, self.session.write_value(node_id, value))
            .await
            .map_err(|_| ProtocolError::timeout("write", WRITE_TIMEOUT))?
    }

    async fn retry_ladder(
        &self,
        node_id: &str,
        data_type: &str,
        literal: &str,
        first: Variant,
        first_error: ProtocolError,
    ) -> Result<Variant, WriteError> {
        let mut candidates = Vec::new();
        if let Ok(nominal) = parse_literal(data_type, literal) {
            candidates.push(nominal.clone());
            candidates.extend(nominal.into_single_element_array());
        }
        if let Variant::Double(value) = first {
            candidates.push(Variant::Float(value as f32));
        }
        for kind in FALLBACK_TYPES {
            if let Ok(scalar) = parse_literal(kind, literal) {
                candidates.push(scalar.clone());
                candidates.extend(scalar.into_single_element_array());
            }
        }

        let mut tried = vec![first];
        let mut last_error = first_error;
        for candidate in candidates {
            if tried.contains(&candidate) {
                continue;
            }
            tried.push(candidate.clone());

            match self.try_write(node_id, candidate.clone()).await {
                Ok(()) => {
                    info!(node_id, accepted = %candidate.type_name(), "Write accepted on retry");
                    self.verify(node_id).await;
                    return Ok(candidate);
                }
                Err(e) if e.is_type_mismatch() => {
                    debug!(node_id, attempted = %candidate.type_name(), "Type mismatch");
                    last_error = e;
                }
                Err(e) => return Err(rejected(node_id, &e)),
            }
        }

        warn!(node_id, attempts = tried.len(), "All fallback attempts exhausted");
        Err(WriteError::Exhausted {
            node_id: node_id.to_string(),
            last_error: last_error.to_string(),
        })
    }

    /// Reads the value back and logs it.
    async fn verify(&self, node_id: &str) {
        let read = self
            .session
            .read_attributes(node_id, &[AttributeId::Value, AttributeId::DataType]);
        match tokio::time::timeout(VERIFY_TIMEOUT, read).await {
            Ok(Ok(results)) if results.len() == 2 => {
                let data_type = results[1]
                    .value
                    .as_text()
                    .map(builtin_type_name)
                    .unwrap_or_default();
                info!(
                    node_id,
                    value = %format_value(&results[0].value, &data_type),
                    data_type = %data_type,
                    "Read back after write"
                );
            }
            Ok(Ok(_)) => debug!(node_id, "Read back returned no values"),
            Ok(Err(e)) => debug!(node_id, error = %e, "Read back failed"),
            Err(_) => debug!(node_id, "Read back timed out"),
        }
    }
}

fn rejected(node_id: &str, error: &ProtocolError) -> WriteError {
    WriteError::Rejected {
        node_id: node_id.to_string(),
        reason: error.to_string(),
    }
}

impl Controller {
    /// Queues a typed write and returns immediately.
    ///
    /// The outcome is logged and counted in the session metrics; read the node
    /// back to observe it.
    pub fn write_value(self: &Arc<Self>, node_id: &str, hint: &str, literal: &str) -> Result<(), UalinkError> {
        let session = self.session()?;
        let token = self.generation().ok_or(ConnectionError::NotConnected)?;

        let controller = Arc::clone(self);
        let node_id = node_id.to_string();
        let hint = hint.to_string();
        let literal = literal.to_string();
        info!(node_id = %node_id, hint = %hint, "Write requested");

        self.spawn_tracked(&token, "write", async move {
            let engine = WriteEngine::new(session);
            let outcome = AssertUnwindSafe(engine.run(&node_id, &hint, &literal))
                .catch_unwind()
                .await;
            let metrics = controller.status().metrics();
            match outcome {
                Ok(Ok(value)) => {
                    metrics.record_write(true);
                    info!(node_id = %node_id, accepted = %value.type_name(), "Write succeeded");
                }
                Ok(Err(e)) => {
                    metrics.record_write(false);
                    warn!(node_id = %node_id, error = %e, "Write failed");
                }
                Err(_) => {
                    metrics.record_write(false);
                    error!(node_id = %node_id, "Write task panicked");
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected, wait_until};
    use ualink_client::{MemoryServer, SessionOpener};
    use ualink_core::types::SessionOptions;
    use ualink_core::value::ArrayValue;

    async fn engine(server: &MemoryServer) -> WriteEngine {
        let session = server
            .open("opc.tcp://memory:4840", &SessionOptions::default())
            .await
            .unwrap();
        WriteEngine::new(session)
    }

    #[tokio::test]
    async fn test_scalar_write() {
        let server = MemoryServer::demo_plant();
        server.add_variable("ns=2;s=Line1", "ns=2;s=Line1.Batch", "Batch", Variant::Int32(0));
        let engine = engine(&server).await;

        let value = engine.run("ns=2;s=Line1.Batch", "Int32", "42").await.unwrap();
        assert_eq!(value, Variant::Int32(42));
        assert_eq!(server.value("ns=2;s=Line1.Batch"), Some(Variant::Int32(42)));
    }

    #[tokio::test]
    async fn test_probe_prefers_current_value_type() {
        let server = MemoryServer::demo_plant();
        // Declared Double, holds a Float
        server.set_data_type("ns=2;s=Line1.Speed", "i=11");
        let engine = engine(&server).await;

        let value = engine.run("ns=2;s=Line1.Speed", "", "17.25").await.unwrap();
        assert_eq!(value, Variant::Float(17.25));
        assert_eq!(server.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_server_type_overrides_hint() {
        let server = MemoryServer::demo_plant();
        let engine = engine(&server).await;

        let value = engine.run("ns=2;s=Line1.Running", "String", "0").await.unwrap();
        assert_eq!(value, Variant::Boolean(false));
    }

    #[tokio::test]
    async fn test_out_of_range_literal() {
        let server = MemoryServer::demo_plant();
        server.add_variable("ns=2;s=Line1", "ns=2;s=Line1.Small", "Small", Variant::Int16(1));
        let engine = engine(&server).await;

        let err = engine.run("ns=2;s=Line1.Small", "Int16", "70000").await.unwrap_err();
        assert!(matches!(err, WriteError::Conversion { .. }));
        assert!(server.writes().is_empty());
    }

    #[tokio::test]
    async fn test_not_writable() {
        let server = MemoryServer::demo_plant();
        let engine = engine(&server).await;

        let err = engine.run("ns=2;s=Line1.Count", "UInt32", "5").await.unwrap_err();
        assert!(matches!(
            err,
            WriteError::NotWritable { ref access_level, .. } if access_level == "Read"
        ));
    }

    #[tokio::test]
    async fn test_array_write() {
        let server = MemoryServer::demo_plant();
        let engine = engine(&server).await;

        engine.run("ns=2;s=Line1.Setpoints", "Double", "[4, 5.5]").await.unwrap();
        assert_eq!(
            server.value("ns=2;s=Line1.Setpoints"),
            Some(Variant::Array(ArrayValue::Double(vec![4.0, 5.5])))
        );
    }

    #[tokio::test]
    async fn test_bytestring_write() {
        let server = MemoryServer::demo_plant();
        let engine = engine(&server).await;

        engine.run("ns=2;s=Line1.Signature", "ByteString", "0xCA 0xFE").await.unwrap();
        assert_eq!(
            server.value("ns=2;s=Line1.Signature"),
            Some(Variant::ByteString(vec![0xCA, 0xFE]))
        );
    }

    #[tokio::test]
    async fn test_mismatch_falls_back_to_single_element_array() {
        let server = MemoryServer::demo_plant();
        server.set_accepted_type("ns=2;s=Line1.Speed", "Float[]");
        let engine = engine(&server).await;

        let value = engine.run("ns=2;s=Line1.Speed", "Float", "3.5").await.unwrap();
        assert_eq!(value, Variant::Array(ArrayValue::Float(vec![3.5])));
    }

    #[tokio::test]
    async fn test_mismatch_narrows_double() {
        let server = MemoryServer::demo_plant();
        server.add_variable("ns=2;s=Line1", "ns=2;s=Line1.Ratio", "Ratio", Variant::Double(0.5));
        server.set_accepted_type("ns=2;s=Line1.Ratio", "Float");
        let engine = engine(&server).await;

        let value = engine.run("ns=2;s=Line1.Ratio", "Double", "0.25").await.unwrap();
        assert_eq!(value, Variant::Float(0.25));
    }

    #[tokio::test]
    async fn test_unreadable_attributes_fall_back_to_hint() {
        let server = MemoryServer::demo_plant();
        server.fail_reads("ns=2;s=Line1.Recipe");
        let engine = engine(&server).await;

        let value = engine.run("ns=2;s=Line1.Recipe", "String", "evening").await.unwrap();
        assert_eq!(value, Variant::String("evening".into()));
        assert_eq!(server.value("ns=2;s=Line1.Recipe"), Some(Variant::String("evening".into())));

        // A wrong hint still lands through the ladder
        let value = engine.run("ns=2;s=Line1.Recipe", "Int32", "12").await.unwrap();
        assert_eq!(value, Variant::String("12".into()));
    }

    #[tokio::test]
    async fn test_mismatch_exhausts_ladder() {
        let server = MemoryServer::demo_plant();
        server.set_accepted_type("ns=2;s=Line1.Recipe", "Guid");
        let engine = engine(&server).await;

        let err = engine.run("ns=2;s=Line1.Recipe", "String", "12").await.unwrap_err();
        assert!(matches!(err, WriteError::Exhausted { .. }));
        assert!(err.to_string().contains("BadTypeMismatch"));
        assert_eq!(server.value("ns=2;s=Line1.Recipe"), Some(Variant::String("default".into())));
    }

    #[tokio::test]
    async fn test_controller_write_is_async() {
        let (controller, server) = connected().await;
        controller.write_value("ns=2;s=Line1.Recipe", "String", "night-shift").unwrap();

        wait_until(|| {
            server.value("ns=2;s=Line1.Recipe") == Some(Variant::String("night-shift".into()))
        })
        .await;
        wait_until(|| controller.status().metrics().snapshot().writes_succeeded == 1).await;
    }

    #[tokio::test]
    async fn test_controller_write_failure_is_counted() {
        let (controller, _server) = connected().await;
        controller.write_value("ns=2;s=Line1.Count", "UInt32", "9").unwrap();
        wait_until(|| controller.status().metrics().snapshot().writes_failed == 1).await;
    }

    #[tokio::test]
    async fn test_controller_write_requires_session() {
        let controller = crate::testing::controller(&MemoryServer::demo_plant());
        let err = controller.write_value("ns=2;s=Line1.Speed", "Float", "1").unwrap_err();
        assert!(err.is_not_connected());
    }
}
