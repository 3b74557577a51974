pub mod catalog;
pub mod clustering;
pub mod constants;
pub mod errors;
pub mod geodesy;
pub mod relocator;
pub mod solver;
pub mod ttt;
pub mod xcorr;

pub use catalog::{Catalog, EvalMode, Event, Phase, PhaseType, Station};
pub use clustering::{ClusteringOptions, Neighbours};
pub use errors::DdError;
pub use relocator::{relocate, relocate_with_cancel, RelocationReport, SolverOptions, SolverType};
pub use ttt::{HomogeneousModel, TravelTime, TravelTimeTable};
pub use xcorr::XcorrCache;
