use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::event_loop::{EventLoop, EventLoopHandle};

/// Runs a single [`EventLoop`] on a dedicated OS thread and hands the caller
/// a handle to it once it's up.
///
/// `init_callback` runs on the new thread before the loop starts spinning —
/// the right place to register channels or start timers that must exist
/// from the very first iteration.
pub struct EventLoopThread {
    handle: Option<EventLoopHandle>,
    join_handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            handle: None,
            join_handle: None,
        }
    }

    /// Spawns the thread and blocks until its loop is constructed, returning
    /// a cross-thread handle to it.
    pub fn start_loop(&mut self, init_callback: Option<Box<dyn FnOnce(&Rc<RefCell<EventLoop>>) + Send>>) -> EventLoopHandle {
        let (tx, rx) = mpsc::channel::<EventLoopHandle>();

        let join_handle = std::thread::spawn(move || {
            let loop_rc = EventLoop::new();
            if let Some(cb) = init_callback {
                cb(&loop_rc);
            }
            tx.send(EventLoop::handle(&loop_rc))
                .expect("EventLoopThread: start_loop receiver dropped before handoff");
            EventLoop::run(&loop_rc);
        });

        let handle = rx
            .recv()
            .expect("EventLoopThread: loop thread died before starting");
        self.handle = Some(handle.clone());
        self.join_handle = Some(join_handle);
        handle
    }
}

impl Default for EventLoopThread {
    fn default() -> EventLoopThread {
        EventLoopThread::new()
    }
}

impl Drop for EventLoopThread {
    /// Not 100% race-free (the thread could be mid-way through its init
    /// callback), but by the time a process is tearing down its loop
    /// threads it is usually exiting anyway.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_loop_blocks_until_loop_exists() {
        let mut t = EventLoopThread::new();
        let handle = t.start_loop(None);
        assert!(!handle.is_in_loop_thread());
    }

    #[test]
    fn drop_joins_the_thread() {
        let mut t = EventLoopThread::new();
        t.start_loop(None);
        drop(t);
    }
}
