//! Thread-safe epoll multiplexer.
//!
//! [`Poller`] owns the epoll descriptor, the live-fd count, and the scratch
//! buffer `epoll_wait` fills. Registration calls (`add`/`modify`/`remove`)
//! are plain `epoll_ctl` invocations and never touch the scratch buffer, so
//! they proceed while another thread is blocked in [`Poller::wait`] — the
//! kernel delivers readiness for descriptors added mid-wait. Only `wait` and
//! [`Poller::resize`] contend on the scratch buffer lock.
//!
//! Every registration carries an opaque `u64` tag that comes back with the
//! ready event; callers use it to identify the owning connection (or the
//! listener).

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Minimum scratch-buffer capacity; resizing never goes below this, which
/// keeps a mostly-idle server from thrashing the allocation.
pub const DEFAULT_MIN_CAPACITY: usize = 4 * 1024;

/// Interest set for a registration.
///
/// `READABLE`/`WRITABLE` select the readiness conditions; `EDGE` switches the
/// descriptor to edge-triggered delivery; `ONESHOT` silences the descriptor
/// after one event until it is re-armed with [`Poller::modify`]; `RDHUP`
/// reports peer half-close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    pub const RDHUP: Interest = Interest(libc::EPOLLRDHUP as u32);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// A ready event: the registration's tag plus the readiness bits.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    tag: u64,
    bits: u32,
}

impl Event {
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn is_readable(&self) -> bool {
        self.bits & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hang-up: RDHUP or HUP.
    pub fn is_closed(&self) -> bool {
        self.bits & (libc::EPOLLRDHUP as u32 | libc::EPOLLHUP as u32) != 0
    }

    pub fn is_error(&self) -> bool {
        self.bits & libc::EPOLLERR as u32 != 0
    }
}

/// Reusable output buffer for [`Poller::wait`].
pub type Events = Vec<Event>;

pub struct Poller {
    epfd: RawFd,
    min_capacity: usize,
    /// Number of descriptors currently registered.
    live: AtomicUsize,
    /// Scratch buffer `epoll_wait` fills. Held for the duration of a wait;
    /// registration paths never take this lock.
    scratch: Mutex<Vec<libc::epoll_event>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Self::with_min_capacity(DEFAULT_MIN_CAPACITY)
    }

    pub fn with_min_capacity(min_capacity: usize) -> io::Result<Self> {
        let min_capacity = min_capacity.max(1);
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epfd,
            min_capacity,
            live: AtomicUsize::new(0),
            scratch: Mutex::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                min_capacity
            ]),
        })
    }

    /// Register `fd` with the given interest set and tag.
    pub fn add(&self, fd: RawFd, interest: Interest, tag: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some((interest, tag)))?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the interest set for an already-registered `fd`. This is the
    /// re-arm path for ONESHOT registrations.
    pub fn modify(&self, fd: RawFd, interest: Interest, tag: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some((interest, tag)))
    }

    /// Remove `fd` from the interest table.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, ev: Option<(Interest, u64)>) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut event = ev.map(|(interest, tag)| libc::epoll_event {
            events: interest.bits(),
            u64: tag,
        });
        let evp = event
            .as_mut()
            .map(|e| e as *mut libc::epoll_event)
            .unwrap_or(std::ptr::null_mut());
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, evp) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until readiness is available (or `timeout` elapses), copying the
    /// ready events into `out`. Returns the number of events delivered.
    ///
    /// `None` blocks indefinitely. EINTR is surfaced to the caller, which
    /// restarts the wait.
    pub fn wait(&self, timeout: Option<Duration>, out: &mut Events) -> io::Result<usize> {
        out.clear();
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let mut scratch = self.scratch.lock().unwrap();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                scratch.as_mut_ptr(),
                scratch.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for ev in scratch.iter().take(n as usize) {
            out.push(Event {
                tag: ev.u64,
                bits: ev.events,
            });
        }
        Ok(n as usize)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current scratch-buffer capacity.
    pub fn capacity(&self) -> usize {
        self.scratch.lock().unwrap().len()
    }

    /// Adapt the scratch buffer to the live-fd count.
    ///
    /// Shrinks when the live count drops below half the buffer (never below
    /// the configured minimum) and grows when the live count exceeds the
    /// buffer. Both directions target 3/2 of the live count — growing by
    /// less than 2x damps oscillation when the count hovers, and shrinking
    /// to the same target leaves room for registrations in flight.
    pub fn resize(&self) {
        let live = self.live.load(Ordering::Relaxed);
        let target = self.min_capacity.max(live + live / 2);
        let mut scratch = self.scratch.lock().unwrap();
        let cap = scratch.len();
        if (live < cap / 2 && cap > self.min_capacity) || live > cap {
            scratch.resize(target, libc::epoll_event { events: 0, u64: 0 });
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn delivers_readiness_with_tag() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe();
        poller.add(rd, Interest::READABLE, 42).unwrap();
        write_byte(wr);

        let mut events = Events::new();
        let n = poller
            .wait(Some(Duration::from_millis(500)), &mut events)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].tag(), 42);
        assert!(events[0].is_readable());

        poller.remove(rd).unwrap();
        close(rd);
        close(wr);
    }

    #[test]
    fn oneshot_silences_until_rearm() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe();
        poller
            .add(rd, Interest::READABLE | Interest::ONESHOT, 7)
            .unwrap();
        write_byte(wr);

        let mut events = Events::new();
        assert_eq!(
            poller
                .wait(Some(Duration::from_millis(500)), &mut events)
                .unwrap(),
            1
        );
        // Data still pending, but the registration is silenced.
        assert_eq!(
            poller
                .wait(Some(Duration::from_millis(50)), &mut events)
                .unwrap(),
            0
        );
        // Re-arming delivers again.
        poller
            .modify(rd, Interest::READABLE | Interest::ONESHOT, 7)
            .unwrap();
        assert_eq!(
            poller
                .wait(Some(Duration::from_millis(500)), &mut events)
                .unwrap(),
            1
        );

        poller.remove(rd).unwrap();
        close(rd);
        close(wr);
    }

    #[test]
    fn add_during_blocked_wait_is_delivered() {
        let poller = Arc::new(Poller::new().unwrap());
        let (rd, wr) = pipe();

        let registrar = {
            let poller = poller.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                poller.add(rd, Interest::READABLE, 9).unwrap();
                write_byte(wr);
            })
        };

        let mut events = Events::new();
        let start = Instant::now();
        let n = poller
            .wait(Some(Duration::from_secs(5)), &mut events)
            .unwrap();
        registrar.join().unwrap();

        assert_eq!(n, 1);
        assert_eq!(events[0].tag(), 9);
        assert!(start.elapsed() < Duration::from_secs(5));

        poller.remove(rd).unwrap();
        close(rd);
        close(wr);
    }

    #[test]
    fn resize_stays_within_bounds() {
        let poller = Poller::with_min_capacity(16).unwrap();
        let mut fds = Vec::new();
        for i in 0..40 {
            let (rd, wr) = pipe();
            poller.add(rd, Interest::READABLE, i).unwrap();
            fds.push((rd, wr));
        }

        poller.resize();
        let live = poller.len();
        assert!(poller.capacity() >= 16);
        assert!(poller.capacity() <= 16usize.max(live + live / 2));

        // Drop most registrations and shrink back down.
        for (rd, wr) in fds.drain(8..) {
            poller.remove(rd).unwrap();
            close(rd);
            close(wr);
        }
        poller.resize();
        let live = poller.len();
        assert!(poller.capacity() >= 16);
        assert!(poller.capacity() <= 16usize.max(live + live / 2));

        for (rd, wr) in fds {
            poller.remove(rd).unwrap();
            close(rd);
            close(wr);
        }
    }

    #[test]
    fn remove_stops_delivery() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe();
        poller.add(rd, Interest::READABLE, 1).unwrap();
        poller.remove(rd).unwrap();
        write_byte(wr);

        let mut events = Events::new();
        assert_eq!(
            poller
                .wait(Some(Duration::from_millis(50)), &mut events)
                .unwrap(),
            0
        );
        assert_eq!(poller.len(), 0);
        close(rd);
        close(wr);
    }

    #[test]
    fn add_rejects_negative_fd() {
        let poller = Poller::new().unwrap();
        assert!(poller.add(-1, Interest::READABLE, 0).is_err());
        assert_eq!(poller.len(), 0);
    }
}
