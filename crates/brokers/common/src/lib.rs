pub mod simulated;

pub use simulated::{SimulatedVenue, SimulatedVenueConfig};
