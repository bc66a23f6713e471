/// Components that make up the dispenser: tank registry, scale sampler,
/// dispensing engine, safety supervisor, recipe store and feed dispatcher.
pub mod dispenser {
    /// Routes queued feed commands to the dispensing engine.
    pub mod dispatch;
    /// Runs a single dispensing cycle through its phase state machine.
    pub mod engine;
    /// Triple-redundant recipe storage.
    pub mod recipes;
    /// Per-tank EEPROM registry: discovery, reconciliation, persistence.
    pub mod registry;
    /// Stall/overfill watchdog.
    pub mod safety;
    /// Load-cell sampling state machine.
    pub mod scale;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::dispenser::dispatch::*;
    pub use crate::components::dispenser::engine::*;
    pub use crate::components::dispenser::recipes::*;
    pub use crate::components::dispenser::registry::*;
    pub use crate::components::dispenser::safety::*;
    pub use crate::components::dispenser::scale::*;
}
