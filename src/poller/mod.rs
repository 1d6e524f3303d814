mod epoll_poller;
mod poll_poller;

pub use epoll_poller::EpollPoller;
pub use poll_poller::PollPoller;

use std::env;

use crate::channel::Channel;
use crate::time::Timestamp;

/// One poll backend's view of the world: a set of channels it is watching,
/// translated into interest-set changes, and a way to turn one blocking
/// wait into a list of ready channels.
///
/// Implementations never own the channels they track; they are told about
/// interest-set changes and forget about a channel only when explicitly
/// asked to.
pub trait Poller {
    /// Blocks for up to `timeout_ms` (negative means "forever"), appending
    /// every channel that became ready to `active_channels`. Returns the
    /// time the wait returned.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Channel>) -> Timestamp;

    /// Applies a channel's current interest mask to the backend. Called
    /// whenever `Channel::enable_reading` et al. request an update.
    fn update_channel(&mut self, channel: &Channel);

    /// Forgets a channel entirely. The channel must have no interest left
    /// (`is_none_event()`).
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether this backend is currently tracking `channel`.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// The environment variable that, when set to `poll`, forces the portable
/// `poll(2)`-based backend instead of the kernel interest-table backend.
pub const BACKEND_ENV_VAR: &str = "REACTOR_NET_POLLER";

/// Picks the default backend for this process, honoring [`BACKEND_ENV_VAR`].
pub fn new_default_poller() -> Box<dyn Poller> {
    match env::var(BACKEND_ENV_VAR) {
        Ok(ref v) if v == "poll" => Box::new(PollPoller::new()),
        _ => Box::new(EpollPoller::new()),
    }
}
