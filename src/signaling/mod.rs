mod message;
mod relay;
mod reorder;
mod transport;

pub use message::{MessageKind, SignalingMessage};
pub use relay::{MemoryRelay, RelayRecord, RelayStore, RelayWatch};
pub use reorder::ReorderBuffer;
pub use transport::{SessionSubscription, SignalingTransport};
