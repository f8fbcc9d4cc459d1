pub mod identify;
pub mod job;
