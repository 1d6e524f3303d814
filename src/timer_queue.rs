use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::channel::Channel;
use crate::event_loop::{EventLoop, EventLoopHandle, LoopSafe};
use crate::time::{Timestamp, MICROSECONDS_PER_SECOND};
use crate::timer::{Timer, TimerCallback, TimerId};

fn create_timerfd() -> OwnedFd {
    let fd = syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
    ))
    .unwrap_or_else(|e| panic!("timerfd_create failed: {}", e));
    // SAFETY: timerfd_create returned a freshly owned, valid fd.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// How long to arm the kernel timer for, given a target expiration: never
/// zero (a zero `itimerspec` disarms the timer instead of firing
/// immediately), so sub-100-microsecond waits are rounded up.
fn how_much_time_from_now(when: Timestamp) -> libc::timespec {
    let mut micros = when.microseconds_since_epoch() - Timestamp::now().microseconds_since_epoch();
    if micros < 100 {
        micros = 100;
    }
    libc::timespec {
        tv_sec: (micros / MICROSECONDS_PER_SECOND) as libc::time_t,
        tv_nsec: ((micros % MICROSECONDS_PER_SECOND) * 1000) as libc::c_long,
    }
}

fn read_timerfd(fd: RawFd, now: Timestamp) {
    let mut how_many: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut how_many as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    log::trace!("TimerQueue::handle_read() {} at {}", how_many, now);
    if n != std::mem::size_of::<u64>() as isize {
        log::error!("TimerQueue::handle_read() reads {} bytes instead of 8", n);
    }
}

fn reset_timerfd(fd: RawFd, expiration: Timestamp) {
    let mut new_value: libc::itimerspec = unsafe { std::mem::zeroed() };
    let old_value: libc::itimerspec = unsafe { std::mem::zeroed() };
    new_value.it_value = how_much_time_from_now(expiration);
    let mut old_value = old_value;
    let ret = unsafe { libc::timerfd_settime(fd, 0, &new_value, &mut old_value) };
    if ret != 0 {
        log::error!("timerfd_settime() failed: {}", std::io::Error::last_os_error());
    }
}

struct State {
    timers: BTreeMap<(Timestamp, i64), Timer>,
    active_timers: HashMap<i64, Timestamp>,
    calling_expired_timers: bool,
    canceling_timers: HashSet<i64>,
}

impl State {
    fn insert(&mut self, timer: Timer) -> bool {
        debug_assert_eq!(self.timers.len(), self.active_timers.len());
        let when = timer.expiration();
        let sequence = timer.sequence();
        let earliest_changed = self
            .timers
            .keys()
            .next()
            .map_or(true, |&(first, _)| when < first);
        self.active_timers.insert(sequence, when);
        self.timers.insert((when, sequence), timer);
        earliest_changed
    }
}

/// A best-effort timer service: delivers callbacks on the owning loop, in
/// non-decreasing expiration order, at most once per firing unless the
/// timer repeats. No guarantee the callback runs exactly on time.
pub struct TimerQueue {
    state: Rc<RefCell<State>>,
    handle: EventLoopHandle,
    timerfd: OwnedFd,
    timerfd_channel: Channel,
}

impl TimerQueue {
    pub(crate) fn new(loop_: &Rc<RefCell<EventLoop>>, handle: EventLoopHandle) -> TimerQueue {
        let timerfd = create_timerfd();
        let raw_fd = timerfd.as_raw_fd();
        let channel = Channel::new(loop_, raw_fd);

        let state = Rc::new(RefCell::new(State {
            timers: BTreeMap::new(),
            active_timers: HashMap::new(),
            calling_expired_timers: false,
            canceling_timers: HashSet::new(),
        }));

        {
            let state = Rc::clone(&state);
            channel.set_read_callback(Box::new(move |receive_time| {
                Self::handle_read(&state, raw_fd, receive_time);
            }));
        }
        channel.enable_reading();

        TimerQueue {
            state,
            handle,
            timerfd,
            timerfd_channel: channel,
        }
    }

    fn timerfd_raw(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    /// Schedules `cb` to run at `when`, repeating every `interval` seconds
    /// if `interval > 0.0`. Safe to call from any thread; the insertion
    /// itself always happens on the owning loop's thread.
    pub fn add_timer(&self, cb: TimerCallback, when: Timestamp, interval: f64) -> TimerId {
        let timer = Timer::new(cb, when, interval);
        let sequence = timer.sequence();
        let packet = LoopSafe::new((Rc::clone(&self.state), timer, self.timerfd_raw()));
        self.handle.run_in_loop(move || {
            let (state, timer, timerfd) = packet.into_inner();
            Self::add_timer_in_loop(&state, timerfd, timer);
        });
        TimerId(sequence)
    }

    /// Cancels a previously scheduled timer. Safe to call from any thread.
    /// If the timer is currently expiring (its callback is mid-run), the
    /// cancellation suppresses only its next repeat.
    pub fn cancel(&self, id: TimerId) {
        let packet = LoopSafe::new(Rc::clone(&self.state));
        self.handle.run_in_loop(move || {
            let state = packet.into_inner();
            Self::cancel_in_loop(&state, id);
        });
    }

    fn add_timer_in_loop(state: &Rc<RefCell<State>>, timerfd: RawFd, timer: Timer) {
        let expiration = timer.expiration();
        let earliest_changed = state.borrow_mut().insert(timer);
        if earliest_changed {
            reset_timerfd(timerfd, expiration);
        }
    }

    fn cancel_in_loop(state: &Rc<RefCell<State>>, id: TimerId) {
        let mut s = state.borrow_mut();
        debug_assert_eq!(s.timers.len(), s.active_timers.len());
        if let Some(expiration) = s.active_timers.remove(&id.sequence()) {
            let removed = s.timers.remove(&(expiration, id.sequence()));
            debug_assert!(removed.is_some());
        } else if s.calling_expired_timers {
            s.canceling_timers.insert(id.sequence());
        }
        debug_assert_eq!(s.timers.len(), s.active_timers.len());
    }

    fn handle_read(state: &Rc<RefCell<State>>, timerfd: RawFd, receive_time: Timestamp) {
        read_timerfd(timerfd, receive_time);

        let mut expired = Self::get_expired(state, receive_time);

        state.borrow_mut().calling_expired_timers = true;
        state.borrow_mut().canceling_timers.clear();
        for timer in expired.iter_mut() {
            timer.run();
        }
        state.borrow_mut().calling_expired_timers = false;

        Self::reset(state, timerfd, expired, receive_time);
    }

    /// Removes and returns every timer whose expiration is `<= now`.
    fn get_expired(state: &Rc<RefCell<State>>, now: Timestamp) -> Vec<Timer> {
        let mut s = state.borrow_mut();
        debug_assert_eq!(s.timers.len(), s.active_timers.len());

        let sentry = (now, i64::MAX);
        let rest = s.timers.split_off(&sentry);
        let expired_map = std::mem::replace(&mut s.timers, rest);

        let mut expired = Vec::with_capacity(expired_map.len());
        for ((_, sequence), timer) in expired_map {
            s.active_timers.remove(&sequence);
            expired.push(timer);
        }
        debug_assert_eq!(s.timers.len(), s.active_timers.len());
        expired
    }

    fn reset(state: &Rc<RefCell<State>>, timerfd: RawFd, expired: Vec<Timer>, now: Timestamp) {
        for mut timer in expired {
            let sequence = timer.sequence();
            let canceled = state.borrow().canceling_timers.contains(&sequence);
            if timer.repeat() && !canceled {
                timer.restart(now);
                state.borrow_mut().insert(timer);
            }
            // one-shot or canceled: dropped here, closing out its slot.
        }

        let next_expiration = state
            .borrow()
            .timers
            .keys()
            .next()
            .map(|&(expiration, _)| expiration);
        if let Some(expiration) = next_expiration {
            reset_timerfd(timerfd, expiration);
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.timerfd_channel.disable_all();
        self.timerfd_channel.remove();
        // timerfd itself is closed by OwnedFd's drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn how_much_time_from_now_floors_at_100_micros() {
        let ts = how_much_time_from_now(Timestamp::now());
        assert!(ts.tv_sec > 0 || ts.tv_nsec >= 100_000);
    }

    #[test]
    fn state_insert_reports_earliest_change_correctly() {
        let mut state = State {
            timers: BTreeMap::new(),
            active_timers: HashMap::new(),
            calling_expired_timers: false,
            canceling_timers: HashSet::new(),
        };
        let t1 = Timer::new(Box::new(|| {}), Timestamp::from_micros(1_000_000), 0.0);
        assert!(state.insert(t1));

        let t2 = Timer::new(Box::new(|| {}), Timestamp::from_micros(2_000_000), 0.0);
        assert!(!state.insert(t2));

        let t3 = Timer::new(Box::new(|| {}), Timestamp::from_micros(500_000), 0.0);
        assert!(state.insert(t3));
    }
}
