pub mod cache;
pub mod cli;
pub mod combine;
pub mod discrepancy;
pub mod error;
pub mod gcov;
pub mod ignore;
pub mod model;
pub mod report;
pub mod scan;
pub mod source_path;
