//! Core domain models, channel primitives and time abstractions.
//!
//! Provides the log event wire format, failure records, the partitioned
//! message channel used between ingress and delivery, pipeline outcome
//! events, and the clock used for every time-dependent decision. All other
//! crates depend on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use channel::{
    headers, BrokerConfig, ChannelError, InMemoryBroker, Message, OutgoingRecord,
    PartitionConsumer, PublishReceipt, Publisher,
};
pub use error::{CoreError, DocoreError, Result};
pub use events::{
    EventSubscriber, MessageDeadLetteredEvent, MessageSkippedEvent, MessageSucceededEvent,
    MulticastSubscriber, NoOpSubscriber, PipelineEvent, RetryScheduledEvent,
};
pub use models::{ErrorLog, ErrorLogId, LogEvent, LogId};
pub use time::{Clock, RealClock, TestClock};
