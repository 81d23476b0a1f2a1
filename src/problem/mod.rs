pub mod point_set;
pub use point_set::AxisAlignedHyperRect;
pub use point_set::OperationSpace;
