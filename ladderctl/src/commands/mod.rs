pub mod jobs;
pub mod worker;
