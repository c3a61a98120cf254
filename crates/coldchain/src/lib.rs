//! Relay between an on-chain climate controller contract and its real-time control peer.
//!
//! - **ChainEventSource**: catch-up from a persisted cursor, then a live log subscription;
//!   decoded events are handed to a [ChainEventHandler].
//! - **ControlPeerLink**: reconnecting WebSocket link to the control peer.
//! - **MessageRouter**: inbound peer JSON to contract calls, chain setpoints to peer JSON.
//! - **TxSubmitter**: serialized, at-most-once signing and broadcast of contract calls.

pub mod abi;
pub mod bridge;
pub mod centi;
pub mod config;
pub mod cursor;
pub mod listener;
pub mod peer;
pub mod router;
pub mod rpc;
pub mod signer;
pub mod submitter;

pub use abi::{decode_event, AbiError, ChainEvent, OutboundTx, RawLog};
pub use bridge::Bridge;
pub use config::{BackoffConfig, BridgeConfig};
pub use cursor::{Cursor, CursorError, CursorStore, FileCursorStore, MemoryCursorStore};
pub use listener::{ChainEventHandler, ChainEventSource};
pub use peer::{ControlPeerLink, PeerOutbox};
pub use router::{encode_setpoint, InboundControlMessage, InboundError, MessageRouter};
pub use rpc::{ChainConnection, ChainTransport, LogSubscription, RpcTransport};
pub use signer::{LegacyTx, SignedTx, SignerError, TxSigner};
pub use submitter::{DryRunBackend, RpcSubmitBackend, SubmitBackend, SubmitError, TxSubmitter};
