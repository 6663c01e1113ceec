//! insardine: SBAS ground-deformation core for Sentinel-1 SLC stacks
//!
//! This library turns a dated stack of complex SAR images into a per-pixel
//! displacement time series: coregistration, interferogram and coherence
//! formation, phase unwrapping, small-baseline network selection and SBAS
//! inversion.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    SarComplex, SarImage, SarRealImage, SarRealCube, InsarError, InsarResult,
    CoordinateSystem, BoundingBox, GeoTransform, OrbitData, StateVector, RasterStatistics,
};

pub use io::{GeoRaster, OrbitBaselines, OrbitReader, SnaphuUnwrapper};
pub use crate::core::{
    Coregistrator, InterferogramGenerator, UnwrapEngine, SbasNetworkBuilder, SbasInverter,
    InsarPipeline, PipelineConfig, RunContext,
};
