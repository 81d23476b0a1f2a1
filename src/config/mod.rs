pub mod workload;
pub use workload::DataSpace;
pub use workload::Workload;
