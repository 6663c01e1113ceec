//! Raster exchange, orbit geometry and external unwrapper adapters

pub mod orbit;
pub mod raster;
pub mod snaphu;

pub use orbit::{OrbitBaselines, OrbitReader};
pub use raster::GeoRaster;
pub use snaphu::{SnaphuConfig, SnaphuUnwrapper};
