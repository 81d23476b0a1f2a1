pub mod checkpoint;
pub mod nest_analysis;
pub mod tiling;
pub mod transform;
pub use checkpoint::Checkpoint;
pub use nest_analysis::NestAnalysis;
pub use tiling::BodyInfo;
pub use tiling::TileInfo;
