pub mod board;
pub mod patient;

pub use board::{LaneView, PartitionFilter, PatientQueue, QueueView};
pub use patient::{DoctorId, Patient, PatientId};
