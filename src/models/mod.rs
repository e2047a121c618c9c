pub mod announcement;
pub mod job;
