use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::time::Timestamp;
use crate::timer::{TimerCallback, TimerId};
use crate::timer_queue::TimerQueue;

/// 10 seconds, matching the original's choice: short enough that a stuck
/// kernel timer backend (the `__MACH__`/Android fallback mentioned in the
/// timer service) still makes forward progress, long enough to keep idle
/// loops from spinning.
const DEFAULT_POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    static LOOP_EXISTS_ON_THIS_THREAD: Cell<bool> = Cell::new(false);
    static CURRENT_LOOP: RefCell<Option<Rc<RefCell<EventLoop>>>> = RefCell::new(None);
}

static IGNORE_SIGPIPE: Once = Once::new();

/// A write to a peer that has reset the connection raises `SIGPIPE` by
/// default, which kills the process. Every loop construction ensures it's
/// ignored process-wide so write errors surface as `EPIPE` instead.
fn ignore_sigpipe_once() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

fn create_eventfd() -> OwnedFd {
    let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
        .unwrap_or_else(|e| panic!("EventLoop: eventfd() failed: {}", e));
    // SAFETY: eventfd() returned a freshly owned, valid fd.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Smuggles a non-`Send` value through a `Send`-bounded closure.
///
/// The event loop's cross-thread task queue requires `Send` functors so
/// that submitting work from another thread type-checks. Some of that work
/// (timer bookkeeping, channel registration) legitimately needs to reach
/// data that only the loop's own thread ever touches — `Rc<RefCell<_>>`
/// state that is never `Send`. `LoopSafe` documents and contains that one
/// escape hatch: a value wrapped here is guaranteed, by the thread-affinity
/// invariant enforced throughout this module, to only ever be unwrapped on
/// the loop thread that eventually drains the queue.
pub(crate) struct LoopSafe<T>(T);

// SAFETY: see the type's documentation — only ever unwrapped on the owning
// loop's thread, which is also the only thread that drains the functor
// queue this travels through.
unsafe impl<T> Send for LoopSafe<T> {}

impl<T> LoopSafe<T> {
    pub(crate) fn new(value: T) -> LoopSafe<T> {
        LoopSafe(value)
    }

    pub(crate) fn into_inner(self) -> T {
        self.0
    }
}

type Functor = Box<dyn FnOnce() + Send>;

/// A cheap, `Send + Sync`, cloneable handle to a loop's cross-thread
/// submission surface: the pending-functor queue and the wakeup fd. Holding
/// one of these does not keep the loop itself alive or grant access to any
/// of its thread-confined state.
#[derive(Clone)]
pub struct EventLoopHandle {
    pending_functors: Arc<Mutex<VecDeque<Functor>>>,
    wakeup_fd: RawFd,
    thread_id: ThreadId,
    calling_pending_functors: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
}

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Runs `f` inline if called from the owning thread; otherwise hands it
    /// off via [`EventLoopHandle::queue_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Unconditionally enqueues `f` to run on the next (or current, if
    /// already draining) pass over the pending-functor queue. Wakes the
    /// loop unless we're already on it and it isn't mid-drain.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.pending_functors.lock().unwrap().push_back(Box::new(f));
        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Requests the loop to stop after its current iteration. Safe from any
    /// thread; not 100% race-free against a concurrent `drop` of the loop,
    /// matching the original's own caveat.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            log::error!("EventLoop::wakeup() writes {} bytes instead of 8", n);
        }
    }
}

/// A reactor: at most one per thread. Owns a poll backend, a timer
/// service, a wakeup mechanism, and a cross-thread functor queue.
pub struct EventLoop {
    handle: EventLoopHandle,
    looping: bool,
    event_handling: bool,
    iteration: i64,
    poll_return_time: Timestamp,
    poller: Box<dyn Poller>,
    timer_queue: Option<TimerQueue>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Option<Channel>,
    active_channels: Vec<Channel>,
    current_active_channel: Option<Channel>,
}

impl EventLoop {
    /// Constructs a new loop on the calling thread. Panics if a loop
    /// already exists on this thread.
    pub fn new() -> Rc<RefCell<EventLoop>> {
        ignore_sigpipe_once();
        LOOP_EXISTS_ON_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!("EventLoop::new: another EventLoop already exists in this thread");
            }
            flag.set(true);
        });

        let wakeup_fd = create_eventfd();
        let raw_wakeup_fd = wakeup_fd.as_raw_fd();

        let handle = EventLoopHandle {
            pending_functors: Arc::new(Mutex::new(VecDeque::new())),
            wakeup_fd: raw_wakeup_fd,
            thread_id: thread::current().id(),
            calling_pending_functors: Arc::new(AtomicBool::new(false)),
            quit: Arc::new(AtomicBool::new(false)),
        };

        let event_loop = EventLoop {
            handle: handle.clone(),
            looping: false,
            event_handling: false,
            iteration: 0,
            poll_return_time: Timestamp::invalid(),
            poller: poller::new_default_poller(),
            timer_queue: None,
            wakeup_fd,
            wakeup_channel: None,
            active_channels: Vec::new(),
            current_active_channel: None,
        };

        let loop_rc = Rc::new(RefCell::new(event_loop));

        let wakeup_channel = Channel::new(&loop_rc, raw_wakeup_fd);
        {
            let weak = Rc::downgrade(&loop_rc);
            wakeup_channel.set_read_callback(Box::new(move |_receive_time| {
                if let Some(loop_rc) = weak.upgrade() {
                    EventLoop::handle_wakeup_read(&loop_rc);
                }
            }));
        }
        wakeup_channel.enable_reading();

        let timer_queue = TimerQueue::new(&loop_rc, handle.clone());

        {
            let mut inner = loop_rc.borrow_mut();
            inner.wakeup_channel = Some(wakeup_channel);
            inner.timer_queue = Some(timer_queue);
        }

        log::debug!("EventLoop created in thread {:?}", handle.thread_id);
        CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(Rc::clone(&loop_rc)));
        loop_rc
    }

    /// Returns the loop that owns the calling thread. Any component that is
    /// handed only an [`EventLoopHandle`] (because it must stay `Send`) and
    /// later needs to build loop-confined state such as a [`Channel`] uses
    /// this once it knows, via [`EventLoopHandle::is_in_loop_thread`], that
    /// it is actually running on the owning thread.
    ///
    /// Panics if no loop was constructed on this thread.
    pub fn current() -> Rc<RefCell<EventLoop>> {
        CURRENT_LOOP
            .with(|c| c.borrow().clone())
            .unwrap_or_else(|| panic!("EventLoop::current: no EventLoop on this thread"))
    }

    /// Test-only constructor with the same semantics as [`EventLoop::new`];
    /// named separately so call sites read as "a loop I'm only using to
    /// exercise some unrelated component", not "the loop under test".
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Rc<RefCell<EventLoop>> {
        EventLoop::new()
    }

    pub fn handle(loop_: &Rc<RefCell<EventLoop>>) -> EventLoopHandle {
        loop_.borrow().handle.clone()
    }

    pub fn poll_return_time(loop_: &Rc<RefCell<EventLoop>>) -> Timestamp {
        loop_.borrow().poll_return_time
    }

    pub fn iteration(loop_: &Rc<RefCell<EventLoop>>) -> i64 {
        loop_.borrow().iteration
    }

    pub fn event_handling(loop_: &Rc<RefCell<EventLoop>>) -> bool {
        loop_.borrow().event_handling
    }

    pub fn is_in_loop_thread(loop_: &Rc<RefCell<EventLoop>>) -> bool {
        loop_.borrow().handle.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(loop_: &Rc<RefCell<EventLoop>>) {
        if !EventLoop::is_in_loop_thread(loop_) {
            panic!(
                "EventLoop::assert_in_loop_thread - loop was created in thread {:?}, current thread is {:?}",
                loop_.borrow().handle.thread_id,
                thread::current().id()
            );
        }
    }

    pub fn run_in_loop(loop_: &Rc<RefCell<EventLoop>>, f: impl FnOnce() + Send + 'static) {
        EventLoop::handle(loop_).run_in_loop(f);
    }

    pub fn queue_in_loop(loop_: &Rc<RefCell<EventLoop>>, f: impl FnOnce() + Send + 'static) {
        EventLoop::handle(loop_).queue_in_loop(f);
    }

    pub fn run_at(loop_: &Rc<RefCell<EventLoop>>, when: Timestamp, cb: TimerCallback) -> TimerId {
        loop_
            .borrow()
            .timer_queue
            .as_ref()
            .expect("EventLoop not fully initialized")
            .add_timer(cb, when, 0.0)
    }

    pub fn run_after(loop_: &Rc<RefCell<EventLoop>>, delay: f64, cb: TimerCallback) -> TimerId {
        let when = Timestamp::now().add_seconds(delay);
        EventLoop::run_at(loop_, when, cb)
    }

    pub fn run_every(loop_: &Rc<RefCell<EventLoop>>, interval: f64, cb: TimerCallback) -> TimerId {
        let when = Timestamp::now().add_seconds(interval);
        loop_
            .borrow()
            .timer_queue
            .as_ref()
            .expect("EventLoop not fully initialized")
            .add_timer(cb, when, interval)
    }

    pub fn cancel(loop_: &Rc<RefCell<EventLoop>>, id: TimerId) {
        loop_
            .borrow()
            .timer_queue
            .as_ref()
            .expect("EventLoop not fully initialized")
            .cancel(id);
    }

    pub fn quit(loop_: &Rc<RefCell<EventLoop>>) {
        loop_.borrow().handle.quit();
    }

    /// Runs the reactor loop until [`EventLoopHandle::quit`] is called.
    /// Must be called on the thread that constructed `loop_`.
    pub fn run(loop_: &Rc<RefCell<EventLoop>>) {
        {
            let inner = loop_.borrow();
            assert!(!inner.looping, "EventLoop::run: already looping");
        }
        EventLoop::assert_in_loop_thread(loop_);

        {
            let mut inner = loop_.borrow_mut();
            inner.looping = true;
            inner.handle.quit.store(false, Ordering::SeqCst);
        }

        log::trace!("EventLoop start looping");

        loop {
            if loop_.borrow().handle.quit.load(Ordering::SeqCst) {
                break;
            }

            let mut active_channels = Vec::new();
            let poll_return_time = {
                let mut inner = loop_.borrow_mut();
                inner.active_channels.clear();
                inner.poller.poll(DEFAULT_POLL_TIMEOUT_MS, &mut active_channels)
            };

            {
                let mut inner = loop_.borrow_mut();
                inner.poll_return_time = poll_return_time;
                inner.iteration += 1;
                inner.active_channels = active_channels.clone();
                inner.event_handling = true;
            }

            for channel in &active_channels {
                loop_.borrow_mut().current_active_channel = Some(channel.clone());
                channel.handle_event(poll_return_time);
            }

            {
                let mut inner = loop_.borrow_mut();
                inner.current_active_channel = None;
                inner.event_handling = false;
            }

            EventLoop::do_pending_functors(loop_);
        }

        log::trace!("EventLoop stop looping");
        loop_.borrow_mut().looping = false;
    }

    fn do_pending_functors(loop_: &Rc<RefCell<EventLoop>>) {
        let handle = loop_.borrow().handle.clone();
        handle.calling_pending_functors.store(true, Ordering::SeqCst);

        let mut functors = VecDeque::new();
        {
            let mut guard = handle.pending_functors.lock().unwrap();
            std::mem::swap(&mut *guard, &mut functors);
        }

        for f in functors {
            f();
        }

        handle.calling_pending_functors.store(false, Ordering::SeqCst);
    }

    fn handle_wakeup_read(loop_: &Rc<RefCell<EventLoop>>) {
        let fd = loop_.borrow().wakeup_fd.as_raw_fd();
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                fd,
                &mut one as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            log::error!("EventLoop::handle_read() reads {} bytes instead of 8", n);
        }
    }

    pub(crate) fn update_channel(loop_: &Rc<RefCell<EventLoop>>, channel: &Channel) {
        EventLoop::assert_in_loop_thread(loop_);
        loop_.borrow_mut().poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(loop_: &Rc<RefCell<EventLoop>>, channel: &Channel) {
        EventLoop::assert_in_loop_thread(loop_);
        {
            let inner = loop_.borrow();
            if inner.event_handling {
                let is_current = inner
                    .current_active_channel
                    .as_ref()
                    .map(|c| c.ptr_eq(channel))
                    .unwrap_or(false);
                let still_active = inner.active_channels.iter().any(|c| c.ptr_eq(channel));
                assert!(is_current || !still_active);
            }
        }
        loop_.borrow_mut().poller.remove_channel(channel);
    }

    pub fn has_channel(loop_: &Rc<RefCell<EventLoop>>, channel: &Channel) -> bool {
        EventLoop::assert_in_loop_thread(loop_);
        loop_.borrow().poller.has_channel(channel)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        log::debug!("EventLoop destructs in thread {:?}", self.handle.thread_id);
        if let Some(channel) = self.wakeup_channel.take() {
            channel.disable_all();
            channel.remove();
        }
        LOOP_EXISTS_ON_THIS_THREAD.with(|flag| flag.set(false));
        CURRENT_LOOP.with(|c| *c.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn construction_sets_thread_affinity() {
        let l = EventLoop::new_for_test();
        assert!(EventLoop::is_in_loop_thread(&l));
    }

    #[test]
    #[should_panic(expected = "another EventLoop already exists")]
    fn second_loop_on_same_thread_panics() {
        let _first = EventLoop::new_for_test();
        let _second = EventLoop::new_for_test();
    }

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let l = EventLoop::new_for_test();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        EventLoop::run_in_loop(&l, move || r.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn quit_stops_a_running_loop() {
        let l = EventLoop::new_for_test();
        let handle = EventLoop::handle(&l);
        let count = Arc::new(AtomicI32::new(0));
        let c = count.clone();
        EventLoop::run_after(
            &l,
            0.0,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        EventLoop::run_after(
            &l,
            0.01,
            Box::new(move || {
                handle.quit();
            }),
        );
        EventLoop::run(&l);
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
