use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_thread::EventLoopThread;

/// A pool of worker loops spawned up front and handed out round-robin (or by
/// hash) to distribute accepted connections. With zero worker threads,
/// every loop handed out is the base loop — all I/O happens inline.
pub struct EventLoopThreadPool {
    base_loop: Rc<RefCell<EventLoop>>,
    started: AtomicBool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Rc<RefCell<EventLoop>>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            started: AtomicBool::new(false),
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawns `num_threads` worker loops, each initialized with a clone of
    /// `init_callback` if given. Must be called on the base loop's thread.
    pub fn start(
        &mut self,
        init_callback: Option<Rc<dyn Fn(&Rc<RefCell<EventLoop>>)>>,
    ) {
        assert!(!self.started.load(Ordering::SeqCst));
        EventLoop::assert_in_loop_thread(&self.base_loop);

        self.started.store(true, Ordering::SeqCst);

        for _ in 0..self.num_threads {
            let mut thread = EventLoopThread::new();
            let cb = init_callback.clone();
            let boxed: Option<Box<dyn FnOnce(&Rc<RefCell<EventLoop>>) + Send>> = cb.map(|cb| {
                // SAFETY: `Rc<dyn Fn>` is not `Send`, but the closure is only
                // ever invoked on the freshly spawned loop thread before that
                // thread is observable from anywhere else, so no other
                // thread ever touches this `Rc`.
                let packet = crate::event_loop::LoopSafe::new(cb);
                let boxed: Box<dyn FnOnce(&Rc<RefCell<EventLoop>>) + Send> =
                    Box::new(move |loop_: &Rc<RefCell<EventLoop>>| {
                        (packet.into_inner())(loop_);
                    });
                boxed
            });
            let handle = thread.start_loop(boxed);
            self.loops.push(handle);
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(cb) = init_callback {
                cb(&self.base_loop);
            }
        }
    }

    /// Round-robin selection; the base loop if the pool has no worker
    /// threads.
    pub fn get_next_loop(&mut self) -> EventLoopHandle {
        EventLoop::assert_in_loop_thread(&self.base_loop);
        assert!(self.started.load(Ordering::SeqCst));

        if self.loops.is_empty() {
            return EventLoop::handle(&self.base_loop);
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    pub fn get_loop_for_hash(&self, hash_code: usize) -> EventLoopHandle {
        EventLoop::assert_in_loop_thread(&self.base_loop);
        if self.loops.is_empty() {
            EventLoop::handle(&self.base_loop)
        } else {
            self.loops[hash_code % self.loops.len()].clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<EventLoopHandle> {
        EventLoop::assert_in_loop_thread(&self.base_loop);
        assert!(self.started.load(Ordering::SeqCst));
        if self.loops.is_empty() {
            vec![EventLoop::handle(&self.base_loop)]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_hands_out_the_base_loop() {
        let base = EventLoop::new_for_test();
        let base_thread = EventLoop::handle(&base).is_in_loop_thread();
        let mut pool = EventLoopThreadPool::new(base);
        pool.start(None);
        let next = pool.get_next_loop();
        assert_eq!(next.is_in_loop_thread(), base_thread);
    }

    #[test]
    fn worker_threads_are_round_robined() {
        let base = EventLoop::new_for_test();
        let mut pool = EventLoopThreadPool::new(base);
        pool.set_thread_num(2);
        pool.start(None);
        let all = pool.get_all_loops();
        assert_eq!(all.len(), 2);

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();
        assert!(!first.is_in_loop_thread());
        assert_ne!(first.thread_id(), second.thread_id());
        assert_eq!(first.thread_id(), third.thread_id());
    }
}
