use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque patient identifier, assigned once at intake and never reused.
///
/// Ids minted here are integers, but other surfaces use fractional epoch
/// millis or strings, so any JSON number or string is accepted and written
/// back as it came.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatientId {
    Number(serde_json::Number),
    Text(String),
}

static LAST_ID: AtomicU64 = AtomicU64::new(0);

impl PatientId {
    /// Allocate a fresh id: wall-clock millis scaled by 1000, bumped past the
    /// last id handed out by this process.
    pub fn next() -> Self {
        let candidate = (Utc::now().timestamp_millis().max(0) as u64).saturating_mul(1000);
        let mut last = LAST_ID.load(Ordering::Relaxed);
        loop {
            let id = candidate.max(last + 1);
            match LAST_ID.compare_exchange_weak(last, id, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return PatientId::from(id),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PatientId::Number(n) => n.as_u64(),
            PatientId::Text(_) => None,
        }
    }
}

impl From<u64> for PatientId {
    fn from(id: u64) -> Self {
        PatientId::Number(id.into())
    }
}

impl From<&str> for PatientId {
    fn from(id: &str) -> Self {
        PatientId::Text(id.to_string())
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientId::Number(n) => write!(f, "{n}"),
            PatientId::Text(s) => f.write_str(s),
        }
    }
}

/// Which doctor's sub-queue a patient belongs to.
///
/// Kept as an open string tag so snapshots from surfaces configured with
/// other doctor names still decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DoctorId(String);

impl DoctorId {
    pub const PRIMARY: &'static str = "doctor1";
    pub const SECONDARY: &'static str = "doctor2";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn primary() -> Self {
        Self(Self::PRIMARY.to_string())
    }

    pub fn secondary() -> Self {
        Self(Self::SECONDARY.to_string())
    }

    /// The well-known doctors, in lane order, for a clinic running `count` doctors.
    pub fn roster(count: u8) -> Vec<DoctorId> {
        let all = [Self::primary(), Self::secondary()];
        all.into_iter().take(usize::from(count.clamp(1, 2))).collect()
    }

    /// The doctor a patient is handed over to by a transfer.
    pub fn counterpart(&self) -> Self {
        if self.0 == Self::PRIMARY {
            Self::secondary()
        } else {
            Self::primary()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DoctorId {
    fn default() -> Self {
        Self::primary()
    }
}

impl fmt::Display for DoctorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DoctorId {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// One entry in the clinic queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: PatientId,
    pub patient_name: String,
    #[serde(default)]
    pub doctor_id: DoctorId,
    /// Zero-based rank within the doctor's lane
    #[serde(default)]
    pub position: usize,
    /// Epoch milliseconds; re-spaced whenever a lane is reordered
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Fields written by other surfaces that we carry through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Patient {
    pub fn new(patient_name: impl Into<String>, doctor_id: DoctorId, position: usize) -> Self {
        let now = Utc::now();
        Self {
            id: PatientId::next(),
            patient_name: patient_name.into(),
            doctor_id,
            position,
            timestamp: now.timestamp_millis(),
            created_at: Some(now),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_id(mut self, id: PatientId) -> Self {
        self.id = id;
        self
    }

    /// Ordering key used when positions tie (or were never assigned): FIFO by
    /// creation time, then by timestamp.
    pub fn arrival_key(&self) -> (Option<DateTime<Utc>>, i64) {
        (self.created_at, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = PatientId::next();
        let b = PatientId::next();
        let c = PatientId::next();
        let (a, b, c) = (a.as_u64().unwrap(), b.as_u64().unwrap(), c.as_u64().unwrap());
        assert!(a < b && b < c);
    }

    #[test]
    fn test_wire_names_are_camel_case() {
        let patient = Patient::new("Abebe", DoctorId::primary(), 0).with_id(PatientId::from(1));
        let json = serde_json::to_value(&patient).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["patientName"], "Abebe");
        assert_eq!(json["doctorId"], "doctor1");
        assert_eq!(json["position"], 0);
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_minimal_patient_decodes_with_defaults() {
        let patient: Patient =
            serde_json::from_str(r#"{"id":7,"patientName":"Kebede"}"#).unwrap();
        assert_eq!(patient.doctor_id, DoctorId::primary());
        assert_eq!(patient.position, 0);
        assert!(patient.created_at.is_none());
    }

    #[test]
    fn test_unknown_fields_survive_reencode() {
        let raw = r#"{"id":3,"patientName":"Almaz","doctorId":"doctor2","position":1,"phone":"0911"}"#;
        let patient: Patient = serde_json::from_str(raw).unwrap();
        let back = serde_json::to_value(&patient).unwrap();
        assert_eq!(back["phone"], "0911");
    }

    #[test]
    fn test_foreign_id_shapes_round_trip() {
        let raw = r#"[
            {"id":1739999999999.4217,"patientName":"Abebe","doctorId":"doctor1"},
            {"id":"kiosk-7","patientName":"Kebede","doctorId":"doctor2"}
        ]"#;
        let patients: Vec<Patient> = serde_json::from_str(raw).unwrap();
        assert!(matches!(patients[0].id, PatientId::Number(_)));
        assert_eq!(patients[1].id, PatientId::from("kiosk-7"));

        let back = serde_json::to_value(&patients).unwrap();
        assert_eq!(back[0]["id"], serde_json::json!(1739999999999.4217));
        assert_eq!(back[1]["id"], "kiosk-7");
    }

    #[test]
    fn test_counterpart_and_roster() {
        assert_eq!(DoctorId::primary().counterpart(), DoctorId::secondary());
        assert_eq!(DoctorId::secondary().counterpart(), DoctorId::primary());
        assert_eq!(DoctorId::roster(1), vec![DoctorId::primary()]);
        assert_eq!(DoctorId::roster(2).len(), 2);
        assert_eq!(DoctorId::roster(9).len(), 2);
    }
}
