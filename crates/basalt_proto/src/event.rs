//! Server-push events carried on the reserved event stream.

use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};

use crate::types::{
    read_inet, read_string, read_string_list, write_inet, write_string, write_string_list,
};
use crate::{ProtoError, ProtocolVersion};

/// Event classes named in REGISTER requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventClass {
    pub const ALL: [EventClass; 3] = [
        EventClass::TopologyChange,
        EventClass::StatusChange,
        EventClass::SchemaChange,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventClass::TopologyChange => "TOPOLOGY_CHANGE",
            EventClass::StatusChange => "STATUS_CHANGE",
            EventClass::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyChangeType {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChangeType {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

/// What a schema change applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

impl SchemaTarget {
    fn name(self) -> &'static str {
        match self {
            SchemaTarget::Keyspace => "KEYSPACE",
            SchemaTarget::Table => "TABLE",
            SchemaTarget::Type => "TYPE",
            SchemaTarget::Function => "FUNCTION",
            SchemaTarget::Aggregate => "AGGREGATE",
        }
    }

    fn parse(raw: &str) -> Result<Self, ProtoError> {
        Ok(match raw {
            "KEYSPACE" => SchemaTarget::Keyspace,
            "TABLE" => SchemaTarget::Table,
            "TYPE" => SchemaTarget::Type,
            "FUNCTION" => SchemaTarget::Function,
            "AGGREGATE" => SchemaTarget::Aggregate,
            other => {
                return Err(ProtoError::UnknownValue {
                    what: "schema change target",
                    value: other.to_string(),
                })
            }
        })
    }
}

/// A decoded schema-change payload.
///
/// v1/v2 carry `(change, keyspace, name)` and the target is inferred from an
/// empty name; v3/v4 carry the target explicitly, omit the name for keyspace
/// targets, and append a signature for functions and aggregates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChange {
    pub change: SchemaChangeType,
    pub target: SchemaTarget,
    pub keyspace: String,
    pub name: Option<String>,
    pub signature: Option<Vec<String>>,
}

/// A server-push event frame body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    TopologyChange {
        change: TopologyChangeType,
        node: SocketAddr,
    },
    StatusChange {
        status: StatusChangeType,
        node: SocketAddr,
    },
    SchemaChange(SchemaChange),
}

impl ProtocolEvent {
    pub fn parse(buf: &mut impl Buf, version: ProtocolVersion) -> Result<Self, ProtoError> {
        let class = read_string(buf)?;
        match class.as_str() {
            "TOPOLOGY_CHANGE" => {
                let change = match read_string(buf)?.as_str() {
                    "NEW_NODE" => TopologyChangeType::NewNode,
                    "REMOVED_NODE" => TopologyChangeType::RemovedNode,
                    "MOVED_NODE" => TopologyChangeType::MovedNode,
                    other => {
                        return Err(ProtoError::UnknownValue {
                            what: "topology change",
                            value: other.to_string(),
                        })
                    }
                };
                let node = read_inet(buf)?;
                Ok(ProtocolEvent::TopologyChange { change, node })
            }
            "STATUS_CHANGE" => {
                let status = match read_string(buf)?.as_str() {
                    "UP" => StatusChangeType::Up,
                    "DOWN" => StatusChangeType::Down,
                    other => {
                        return Err(ProtoError::UnknownValue {
                            what: "status change",
                            value: other.to_string(),
                        })
                    }
                };
                let node = read_inet(buf)?;
                Ok(ProtocolEvent::StatusChange { status, node })
            }
            "SCHEMA_CHANGE" => Ok(ProtocolEvent::SchemaChange(parse_schema_change(
                buf, version,
            )?)),
            other => Err(ProtoError::UnknownValue {
                what: "event class",
                value: other.to_string(),
            }),
        }
    }

    /// Encode the event body; the inverse of [`ProtocolEvent::parse`].
    pub fn serialize(&self, version: ProtocolVersion) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ProtocolEvent::TopologyChange { change, node } => {
                write_string(&mut buf, "TOPOLOGY_CHANGE");
                write_string(
                    &mut buf,
                    match change {
                        TopologyChangeType::NewNode => "NEW_NODE",
                        TopologyChangeType::RemovedNode => "REMOVED_NODE",
                        TopologyChangeType::MovedNode => "MOVED_NODE",
                    },
                );
                write_inet(&mut buf, *node);
            }
            ProtocolEvent::StatusChange { status, node } => {
                write_string(&mut buf, "STATUS_CHANGE");
                write_string(
                    &mut buf,
                    match status {
                        StatusChangeType::Up => "UP",
                        StatusChangeType::Down => "DOWN",
                    },
                );
                write_inet(&mut buf, *node);
            }
            ProtocolEvent::SchemaChange(change) => {
                write_string(&mut buf, "SCHEMA_CHANGE");
                write_schema_change(&mut buf, change, version);
            }
        }
        buf.freeze()
    }
}

fn parse_change_type(buf: &mut impl Buf) -> Result<SchemaChangeType, ProtoError> {
    Ok(match read_string(buf)?.as_str() {
        "CREATED" => SchemaChangeType::Created,
        "UPDATED" => SchemaChangeType::Updated,
        "DROPPED" => SchemaChangeType::Dropped,
        other => {
            return Err(ProtoError::UnknownValue {
                what: "schema change",
                value: other.to_string(),
            })
        }
    })
}

pub(crate) fn parse_schema_change(
    buf: &mut impl Buf,
    version: ProtocolVersion,
) -> Result<SchemaChange, ProtoError> {
    match version {
        ProtocolVersion::V1 | ProtocolVersion::V2 => {
            let change = parse_change_type(buf)?;
            let keyspace = read_string(buf)?;
            let name = read_string(buf)?;
            let (target, name) = if name.is_empty() {
                (SchemaTarget::Keyspace, None)
            } else {
                (SchemaTarget::Table, Some(name))
            };
            Ok(SchemaChange {
                change,
                target,
                keyspace,
                name,
                signature: None,
            })
        }
        ProtocolVersion::V3 | ProtocolVersion::V4 => {
            let change = parse_change_type(buf)?;
            let target = SchemaTarget::parse(&read_string(buf)?)?;
            let keyspace = read_string(buf)?;
            let name = match target {
                SchemaTarget::Keyspace => None,
                _ => Some(read_string(buf)?),
            };
            let signature = match target {
                SchemaTarget::Function | SchemaTarget::Aggregate => {
                    Some(read_string_list(buf)?)
                }
                _ => None,
            };
            Ok(SchemaChange {
                change,
                target,
                keyspace,
                name,
                signature,
            })
        }
    }
}

pub(crate) fn write_schema_change(
    buf: &mut BytesMut,
    change: &SchemaChange,
    version: ProtocolVersion,
) {
    let change_name = match change.change {
        SchemaChangeType::Created => "CREATED",
        SchemaChangeType::Updated => "UPDATED",
        SchemaChangeType::Dropped => "DROPPED",
    };
    match version {
        ProtocolVersion::V1 | ProtocolVersion::V2 => {
            write_string(buf, change_name);
            write_string(buf, &change.keyspace);
            write_string(buf, change.name.as_deref().unwrap_or(""));
        }
        ProtocolVersion::V3 | ProtocolVersion::V4 => {
            write_string(buf, change_name);
            write_string(buf, change.target.name());
            write_string(buf, &change.keyspace);
            if change.target != SchemaTarget::Keyspace {
                write_string(buf, change.name.as_deref().unwrap_or(""));
            }
            if matches!(
                change.target,
                SchemaTarget::Function | SchemaTarget::Aggregate
            ) {
                write_string_list(buf, change.signature.as_deref().unwrap_or(&[]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(event: &ProtocolEvent, version: ProtocolVersion) -> ProtocolEvent {
        let body = event.serialize(version);
        ProtocolEvent::parse(&mut body.clone(), version).unwrap()
    }

    #[test]
    fn status_change_round_trips() {
        let event = ProtocolEvent::StatusChange {
            status: StatusChangeType::Down,
            node: "10.0.0.3:9042".parse().unwrap(),
        };
        assert_eq!(round_trip(&event, ProtocolVersion::V4), event);
        assert_eq!(round_trip(&event, ProtocolVersion::V2), event);
    }

    #[test]
    fn function_schema_change_v4_keeps_all_five_fields() {
        let event = ProtocolEvent::SchemaChange(SchemaChange {
            change: SchemaChangeType::Updated,
            target: SchemaTarget::Function,
            keyspace: "ks".into(),
            name: Some("f".into()),
            signature: Some(vec!["int".into(), "text".into()]),
        });
        let decoded = round_trip(&event, ProtocolVersion::V4);
        let ProtocolEvent::SchemaChange(change) = decoded else {
            panic!("expected schema change");
        };
        assert_eq!(change.change, SchemaChangeType::Updated);
        assert_eq!(change.target, SchemaTarget::Function);
        assert_eq!(change.keyspace, "ks");
        assert_eq!(change.name.as_deref(), Some("f"));
        assert_eq!(
            change.signature,
            Some(vec!["int".to_string(), "text".to_string()])
        );
    }

    #[test]
    fn v2_schema_change_infers_target_from_empty_name() {
        let keyspace_only = ProtocolEvent::SchemaChange(SchemaChange {
            change: SchemaChangeType::Created,
            target: SchemaTarget::Keyspace,
            keyspace: "ks".into(),
            name: None,
            signature: None,
        });
        let ProtocolEvent::SchemaChange(change) = round_trip(&keyspace_only, ProtocolVersion::V2)
        else {
            panic!("expected schema change");
        };
        assert_eq!(change.target, SchemaTarget::Keyspace);
        assert_eq!(change.name, None);

        let table = ProtocolEvent::SchemaChange(SchemaChange {
            change: SchemaChangeType::Dropped,
            target: SchemaTarget::Table,
            keyspace: "ks".into(),
            name: Some("t".into()),
            signature: None,
        });
        let ProtocolEvent::SchemaChange(change) = round_trip(&table, ProtocolVersion::V2) else {
            panic!("expected schema change");
        };
        assert_eq!(change.target, SchemaTarget::Table);
        assert_eq!(change.name.as_deref(), Some("t"));
    }
}
