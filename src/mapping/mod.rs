pub mod nest;
pub use nest::LoopKind;
pub use nest::LoopLevel;
pub use nest::Nest;
