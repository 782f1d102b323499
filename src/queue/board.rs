use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::patient::{DoctorId, Patient, PatientId};
use crate::sync::protocol::Role;

pub const DEFAULT_MAX_DISPLAYED: usize = 10;
pub const MAX_DISPLAYED_LIMIT: usize = 20;

/// The full clinic queue, partitioned into per-doctor lanes by `doctorId`.
///
/// Every mutation leaves each lane's positions dense (`0..len`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientQueue {
    patients: Vec<Patient>,
}

impl PatientQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a snapshot received from elsewhere as-is. Positions are not
    /// rebuilt: a snapshot replaces the cache verbatim.
    pub fn from_snapshot(patients: Vec<Patient>) -> Self {
        Self { patients }
    }

    pub fn patients(&self) -> &[Patient] {
        &self.patients
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn get(&self, id: &PatientId) -> Option<&Patient> {
        self.patients.iter().find(|p| &p.id == id)
    }

    /// Patients of one doctor ordered by position, ties broken by arrival.
    pub fn lane(&self, doctor: &DoctorId) -> Vec<&Patient> {
        let mut lane: Vec<&Patient> = self
            .patients
            .iter()
            .filter(|p| &p.doctor_id == doctor)
            .collect();
        lane.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.arrival_key().cmp(&b.arrival_key()))
        });
        lane
    }

    pub fn next_position(&self, doctor: &DoctorId) -> usize {
        self.patients.iter().filter(|p| &p.doctor_id == doctor).count()
    }

    /// Intake: append a new patient to the tail of `doctor`'s lane.
    pub fn add(&mut self, name: &str, doctor: DoctorId) -> Result<PatientId> {
        let name = name.trim();
        if name.is_empty() {
            bail!("invalid patient name: must not be empty");
        }
        let position = self.next_position(&doctor);
        let patient = Patient::new(name, doctor.clone(), position);
        let id = patient.id.clone();
        self.patients.push(patient);
        self.rebuild_positions(&doctor);
        Ok(id)
    }

    /// Remove a patient. Returns the removed entry, or `None` if unknown.
    pub fn remove(&mut self, id: &PatientId) -> Option<Patient> {
        let index = self.patients.iter().position(|p| &p.id == id)?;
        let removed = self.patients.remove(index);
        self.rebuild_positions(&removed.doctor_id);
        Some(removed)
    }

    /// Swap with the patient one place ahead. Returns false at the head or
    /// for an unknown id.
    pub fn move_up(&mut self, id: &PatientId) -> bool {
        self.swap_with_neighbour(id, -1)
    }

    /// Swap with the patient one place behind. Returns false at the tail or
    /// for an unknown id.
    pub fn move_down(&mut self, id: &PatientId) -> bool {
        self.swap_with_neighbour(id, 1)
    }

    fn swap_with_neighbour(&mut self, id: &PatientId, offset: isize) -> bool {
        let Some(patient) = self.get(id) else {
            return false;
        };
        let doctor = patient.doctor_id.clone();
        self.rebuild_positions(&doctor);
        let lane: Vec<PatientId> = self.lane(&doctor).iter().map(|p| p.id.clone()).collect();
        let Some(index) = lane.iter().position(|p| p == id) else {
            return false;
        };
        let Some(target) = index.checked_add_signed(offset).filter(|&t| t < lane.len()) else {
            return false;
        };

        let other = &lane[target];
        for p in self.patients.iter_mut().filter(|p| p.doctor_id == doctor) {
            if &p.id == id {
                p.position = target;
            } else if &p.id == other {
                p.position = index;
            }
        }
        self.rebuild_positions(&doctor);
        true
    }

    /// Hand a patient over to the other doctor, at the tail of that lane.
    pub fn transfer(&mut self, id: &PatientId) -> Option<DoctorId> {
        let from = self.get(id)?.doctor_id.clone();
        let to = from.counterpart();
        let position = self.next_position(&to);

        let now = Utc::now().timestamp_millis();
        if let Some(p) = self.patients.iter_mut().find(|p| &p.id == id) {
            p.doctor_id = to.clone();
            p.position = position;
            p.timestamp = now;
        }
        self.rebuild_positions(&from);
        self.rebuild_positions(&to);
        Some(to)
    }

    /// Empty one lane, or the whole queue when `doctor` is `None`.
    /// Returns how many patients were removed.
    pub fn clear(&mut self, doctor: Option<&DoctorId>) -> usize {
        let before = self.patients.len();
        match doctor {
            Some(d) => self.patients.retain(|p| &p.doctor_id != d),
            None => self.patients.clear(),
        }
        before - self.patients.len()
    }

    /// Renumber `doctor`'s lane to `0..n` in its current order and re-space
    /// timestamps one second apart so timestamp order matches position order.
    pub fn rebuild_positions(&mut self, doctor: &DoctorId) {
        let order: Vec<PatientId> = self.lane(doctor).iter().map(|p| p.id.clone()).collect();
        let count = order.len() as i64;
        let now = Utc::now().timestamp_millis();
        for p in self.patients.iter_mut().filter(|p| &p.doctor_id == doctor) {
            if let Some(rank) = order.iter().position(|id| id == &p.id) {
                p.position = rank;
                p.timestamp = now - (count - rank as i64) * 1000;
            }
        }
    }

    /// Whether every lane is numbered `0..n` without gaps or duplicates.
    pub fn positions_are_dense(&self) -> bool {
        let mut doctors: Vec<&DoctorId> = self.patients.iter().map(|p| &p.doctor_id).collect();
        doctors.sort();
        doctors.dedup();
        doctors.into_iter().all(|d| {
            let mut positions: Vec<usize> = self
                .patients
                .iter()
                .filter(|p| &p.doctor_id == d)
                .map(|p| p.position)
                .collect();
            positions.sort_unstable();
            positions.iter().enumerate().all(|(i, &pos)| i == pos)
        })
    }

    /// What a surface with `role` should show: doctors see their own lane,
    /// everyone else sees every lane.
    pub fn view(&self, role: Role, doctor: &DoctorId, lanes: &[DoctorId], max_items: usize) -> QueueView {
        let max_items = clamp_displayed(max_items);
        let shown: Vec<DoctorId> = match role {
            Role::Doctor => vec![doctor.clone()],
            _ => lanes.to_vec(),
        };
        QueueView {
            lanes: shown
                .into_iter()
                .map(|d| {
                    let lane = self.lane(&d);
                    let waiting = lane.len();
                    let patients = lane.into_iter().take(max_items).cloned().collect();
                    LaneView {
                        doctor: d,
                        patients,
                        waiting,
                    }
                })
                .collect(),
        }
    }
}

/// Out-of-range display bounds fall back to the default.
pub fn clamp_displayed(max_items: usize) -> usize {
    if (1..=MAX_DISPLAYED_LIMIT).contains(&max_items) {
        max_items
    } else {
        DEFAULT_MAX_DISPLAYED
    }
}

/// Deployment-time policy restricting which lanes are relayed or displayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFilter {
    permitted: Option<Vec<DoctorId>>,
}

impl PartitionFilter {
    /// No filtering.
    pub fn allow_all() -> Self {
        Self { permitted: None }
    }

    pub fn only(doctors: Vec<DoctorId>) -> Self {
        Self {
            permitted: Some(doctors),
        }
    }

    /// Filter for the "doctor count" toggle; `None` leaves snapshots untouched.
    pub fn for_doctor_count(count: Option<u8>) -> Self {
        match count {
            Some(n) => Self::only(DoctorId::roster(n)),
            None => Self::allow_all(),
        }
    }

    /// True when nothing is filtered out.
    pub fn is_open(&self) -> bool {
        self.permitted.is_none()
    }

    pub fn permits(&self, doctor: &DoctorId) -> bool {
        match &self.permitted {
            Some(list) => list.contains(doctor),
            None => true,
        }
    }

    /// Same check against a raw `doctorId` tag; untagged entries only pass
    /// an open filter.
    pub fn permits_tag(&self, tag: Option<&str>) -> bool {
        match (&self.permitted, tag) {
            (None, _) => true,
            (Some(list), Some(tag)) => list.iter().any(|d| d.as_str() == tag),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueView {
    pub lanes: Vec<LaneView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaneView {
    pub doctor: DoctorId,
    pub patients: Vec<Patient>,
    /// Lane length before truncation to the display bound
    pub waiting: usize,
}
