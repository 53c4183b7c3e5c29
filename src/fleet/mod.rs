pub mod cost;
pub mod launcher;
pub mod state;
pub mod supervisor;

pub use cost::{CostEstimate, estimate_fleet_cost};
pub use launcher::{FleetSpec, LaunchedFleet, launch_fleet};
pub use state::{FleetSnapshot, summarize};
pub use supervisor::{FleetEvent, FleetOutcome, FleetSupervisor};
