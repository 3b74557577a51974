use thiserror::Error;

use crate::constants::EventId;

#[derive(Error, Debug)]
pub enum DdError {
    #[error("Insufficient neighbours for event {event}: {selected} selected, {required} required")]
    InsufficientNeighbours {
        event: EventId,
        selected: usize,
        required: usize,
    },

    #[error("No travel time for event {event}, station {station}, phase {phase}")]
    MissingTravelTime {
        event: EventId,
        station: String,
        phase: char,
    },

    #[error("Singular double-difference system: {0}")]
    SingularSystem(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Solver reached the iteration cap before satisfying the tolerances")]
    NonConvergence,

    #[error("Unable to perform file operation: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed catalog row ({file}, line {line}): {reason}")]
    CatalogParse {
        file: String,
        line: usize,
        reason: String,
    },
}
