pub mod peer;

pub use peer::{PeerConnection, PeerError, PeerEvent};
