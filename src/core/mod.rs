//! Core InSAR processing modules

pub mod coregistration;
pub mod interferogram;
pub mod phase_unwrap;
pub mod unwrap_quality;
pub mod sbas_network;
pub mod sbas_inversion;
pub mod pipeline;

// Re-export main types
pub use coregistration::{Coregistrator, CoregistrationParams, CoregistrationResult, OffsetEstimate};
pub use interferogram::{InterferogramGenerator, InterferogramParams, InterferogramProduct, InterferogramSummary};
pub use phase_unwrap::{
    CostMode, GradientUnwrapper, InitMethod, PhaseUnwrapper, UnwrapEngine, UnwrapMethod,
    UnwrapParams, UnwrapResult, UnwrapStatistics,
};
pub use unwrap_quality::{assess_unwrapping, QualityLevel, UnwrapQuality};
pub use sbas_network::{
    AcquisitionDate, BaselineProvider, BaselineTable, NetworkPair, NetworkParams, SbasNetwork,
    SbasNetworkBuilder, ZeroBaseline,
};
pub use sbas_inversion::{SbasInversionParams, SbasInversionResult, SbasInverter, InversionStatistics};
pub use pipeline::{
    InsarPipeline, PhaseCorrection, PipelineConfig, ReferencePixelCorrection, RunContext,
    RunReport, StackResult,
};
