//! Utility Module
//!
//! - [`EventChannel`]: fan-out notification channel built on `flume`
//! - [`WarnOnce`]: per-owner deduplication of log warnings
//!
//! # Event Channels
//!
//! Scene lifecycle events and resource disposal notifications are broadcast
//! to every subscriber. Each subscriber gets its own unbounded `flume`
//! receiver and drains it at its own pace; dropped receivers are pruned on
//! the next emit.
//!
//! ```rust,ignore
//! let mut channel = EventChannel::new();
//! let rx = channel.subscribe();
//! channel.emit(SceneEvent::Added(node));
//! assert_eq!(rx.try_iter().count(), 1);
//! ```

pub mod events;
pub mod warn_once;

pub use events::EventChannel;
pub use warn_once::WarnOnce;
