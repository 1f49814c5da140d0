pub mod core;
pub mod exams;
pub mod grading;
pub mod marksheets;
pub mod reports;
pub mod results;
pub mod students;
