//! Wire protocol shared by the hub and the agents.
//!
//! Every frame is a JSON text message carrying a complete snapshot:
//!
//! ```text
//! client -> hub   {"type":"sync","patients":[...]}    (on connect)
//! client -> hub   {"type":"update","patients":[...]}  (after a mutation)
//! hub -> client   {"type":"update","patients":[...]}  (always)
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use std::fmt;

use crate::queue::{DoctorId, PartitionFilter, Patient};

/// Which surface an agent is running in, and what it may do to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    Receptionist,
    Doctor,
    Display,
    QueueManager,
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn can_add(self) -> bool {
        matches!(self, Role::Receptionist | Role::QueueManager)
    }

    pub fn can_reorder(self) -> bool {
        matches!(self, Role::QueueManager)
    }

    pub fn can_remove(self) -> bool {
        matches!(self, Role::Doctor | Role::QueueManager)
    }

    pub fn is_read_only(self) -> bool {
        !(self.can_add() || self.can_reorder() || self.can_remove())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Receptionist => "receptionist",
            Role::Doctor => "doctor",
            Role::Display => "display",
            Role::QueueManager => "queue-manager",
            Role::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "receptionist" | "reception" => Ok(Role::Receptionist),
            "doctor" => Ok(Role::Doctor),
            "display" => Ok(Role::Display),
            "queue-manager" | "manager" => Ok(Role::QueueManager),
            other => anyhow::bail!("unknown role '{other}'"),
        }
    }
}

/// Body shared by `sync` and `update` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub patients: Vec<Patient>,
    /// Sender metadata; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<DoctorId>,
}

impl Snapshot {
    pub fn new(patients: Vec<Patient>) -> Self {
        Self {
            patients,
            role: None,
            doctor_id: None,
        }
    }

    pub fn sent_by(mut self, role: Role, doctor_id: DoctorId) -> Self {
        self.role = Some(role);
        self.doctor_id = Some(doctor_id);
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Patient>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Patient>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Announce this agent's whole cache after (re)connecting
    Sync(Snapshot),
    /// Announce a mutation; also the only shape the hub ever sends
    Update(Snapshot),
    /// Any other `type`; ignored by both sides
    #[serde(other)]
    Unknown,
}

impl SyncMessage {
    pub fn sync(snapshot: Snapshot) -> Self {
        SyncMessage::Sync(snapshot)
    }

    pub fn update(patients: Vec<Patient>) -> Self {
        SyncMessage::Update(Snapshot::new(patients))
    }

    /// Parse a text frame. Malformed JSON is an error; an unrecognised
    /// `type` decodes to [`SyncMessage::Unknown`].
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("malformed sync frame")
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode sync frame")
    }

    /// The snapshot carried by a `sync` or `update`, if any.
    pub fn into_snapshot(self) -> Option<Snapshot> {
        match self {
            SyncMessage::Sync(s) | SyncMessage::Update(s) => Some(s),
            SyncMessage::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Sync(_) => "sync",
            SyncMessage::Update(_) => "update",
            SyncMessage::Unknown => "unknown",
        }
    }
}

/// The hub's reading of an inbound frame.
///
/// Only `type` is interpreted. `patients` is carried as the sender wrote it,
/// so ids, timestamps and fields the hub knows nothing about reach peers
/// unchanged.
#[derive(Debug, Deserialize)]
pub struct RelayFrame<'a> {
    #[serde(rename = "type", default)]
    kind: serde_json::Value,
    #[serde(borrow, default)]
    patients: Option<&'a RawValue>,
}

#[derive(Serialize)]
struct RelayedUpdate<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    patients: &'a RawValue,
}

#[derive(Deserialize)]
struct LaneTag {
    #[serde(rename = "doctorId", default)]
    doctor_id: serde_json::Value,
}

impl<'a> RelayFrame<'a> {
    pub fn parse(raw: &'a str) -> Result<Self> {
        serde_json::from_str(raw).context("malformed sync frame")
    }

    pub fn kind(&self) -> &str {
        self.kind.as_str().unwrap_or("unknown")
    }

    /// `sync` and `update` are relayed alike; anything else is not.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.kind(), "sync" | "update")
    }

    /// Build the `update` frame peers receive. Missing or null `patients`
    /// become `[]`; a closed filter drops array entries whose `doctorId` it
    /// does not permit and leaves the kept entries byte-for-byte intact.
    pub fn to_update(&self, filter: &PartitionFilter) -> Result<String> {
        let empty;
        let mut patients = match self.patients {
            Some(raw) if raw.get() != "null" => raw,
            _ => {
                empty = RawValue::from_string("[]".to_string())?;
                &*empty
            }
        };

        let filtered;
        if !filter.is_open() {
            if let Ok(entries) = serde_json::from_str::<Vec<&RawValue>>(patients.get()) {
                let kept: Vec<&RawValue> = entries
                    .into_iter()
                    .filter(|entry| {
                        serde_json::from_str::<LaneTag>(entry.get())
                            .map(|tag| filter.permits_tag(tag.doctor_id.as_str()))
                            .unwrap_or(false)
                    })
                    .collect();
                filtered = serde_json::value::to_raw_value(&kept)?;
                patients = &*filtered;
            }
        }

        serde_json::to_string(&RelayedUpdate {
            kind: "update",
            patients,
        })
        .context("failed to encode relay frame")
    }
}
