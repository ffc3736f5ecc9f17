//! lodestar-push: delivers service changes to subscribed clients.
//!
//! Clients subscribe to a service key with the UDP address they listen on.
//! Every committed change to that key is debounced, rendered as a
//! `ServiceInfo` body and sent as a sequenced frame. Clients answer each
//! frame with an ack; unacknowledged frames are resent with exponential
//! backoff and a client that never answers is dropped.
//!
//! # Architecture
//!
//! ```text
//! NamingStore ──ChangeEvent──▶ Debouncer ──key──▶ PushService::push_key
//!                                                   ├── SubscriberRegistry (who)
//!                                                   ├── PushClient (seq, checksum, pending acks)
//!                                                   └── PushTransport::send (UDP / recording)
//! inbound ack datagrams ──▶ PushService::handle_ack
//! retry tick ──▶ resend due frames, drop exhausted clients, evict idle ones
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod info;
pub mod service;
pub mod subscriber;
pub mod transport;

pub use client::PushClient;
pub use codec::{Ack, PushFrame};
pub use error::{PushError, PushResult};
pub use info::{Host, ServiceInfo};
pub use service::{PushService, PushSettings, RetryReport};
pub use subscriber::{Subscriber, SubscriberRegistry};
pub use transport::{Inbound, PushTransport, RecordingTransport, UdpPushTransport};
