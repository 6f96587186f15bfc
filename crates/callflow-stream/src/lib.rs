//! Live per-call fan-out of translated transcript segments.
//!
//! Every call has one [`LiveStream`]: an append-only sequence of
//! [`SegmentEvent`]s keyed by `segment_index`, a bounded replay buffer of the
//! most recent segments, and a broadcast channel for the live tail. Any
//! number of observers subscribe through the [`StreamHub`], optionally with a
//! resume cursor. When the call ends the stream emits
//! [`StreamEvent::End`] and refuses new subscriptions.
//!
//! # Usage
//!
//! ```rust,ignore
//! let hub = StreamHub::new(StreamSettings::default());
//! let stream = hub.open("c1");
//! stream.publish(segment)?;
//!
//! let mut sub = hub.subscribe("c1", Some(5))?;
//! while let Some(event) = sub.next_event().await {
//!     // segments 6.. in order, gap markers, then End
//! }
//! ```

mod error;
mod event;
mod hub;
mod live;

pub use error::StreamError;
pub use event::{SegmentEvent, StreamEvent};
pub use hub::{StreamHub, StreamSettings};
pub use live::{LiveStream, Subscription};
