//! Observer fan-out: the event taxonomy and the hub that sequences and
//! distributes it.

pub mod events;
pub mod hub;

pub use events::{ClientMessage, Envelope, ObserverEvent, Snapshot};
pub use hub::{EventHub, HubConfig, HubError};
