//! Session state kept across connections: delivery contexts and the
//! message identifier counter.

pub mod client_session;
pub mod delivery;
pub mod store;

pub use client_session::ClientSession;
pub use delivery::{ContextKey, DeliveryContext, DeliveryState, Flow};
pub use store::SessionStore;

use std::sync::{Arc, Mutex};

/// A session shared between the application and the connection currently using it.
pub type SharedSession = Arc<Mutex<ClientSession>>;
