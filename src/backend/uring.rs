// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The completion-ring (`io_uring`) backend.
//!
//! Grounded on `ext/polyphony/backend_io_uring.c` in full. Submissions
//! are batched (`defer_submit`) and flushed either when the ring fills
//! up or when an immediate submit is required (wakeup, cancellation, a
//! blocking wait). Every op below has a same-named counterpart in the
//! original C (`Backend_read`, `Backend_accept_loop`,
//! `Backend_multishot_accept`, `Backend_double_splice`,
//! `Backend_splice_chunks`, `Backend_chain`, `Backend_timeout`,
//! `Backend_timer_loop`, `Backend_waitpid`, `Backend_wait_event`).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use crate::backend::{BackendBase, PollOutcome};
use crate::context::{ContextId, ContextStore, OpKind, RefCount};
use crate::error::{Error, Result};
use crate::fiber::{FiberId, ResumeValue};
use crate::runqueue::RunQueue;
use crate::watcher::Interest;

/// Default submission-queue depth; halved on `ENOMEM` during ring setup,
/// matching `Backend_initialize`'s retry loop.
const DEFAULT_RING_ENTRIES: u32 = 256;

struct MultishotAccept {
    listener: RawFd,
    queue: VecDeque<io::Result<RawFd>>,
    done: bool,
}

/// Scratch allocations a submission needs to outlive the `push` call but
/// that nothing downstream ever reads back (a `connect` sockaddr, a
/// `timeout` timespec). Freed the moment the matching completion lands.
enum Scratch {
    SockAddr(Box<libc::sockaddr_storage>),
    Timespec(Box<types::Timespec>),
    Msg(Box<MsgScratch>),
}

/// Everything a `recvmsg`/`sendmsg` submission needs to stay pinned at a
/// stable address for the kernel to read/write through: the payload
/// buffer, the peer address, and the `iovec`/`msghdr` pointing into
/// both. Once boxed, moving the `Box` around (e.g. into `self.scratch`)
/// never moves the pointee, so the pointers taken at construction stay
/// valid for as long as this stays alive.
struct MsgScratch {
    buf: Box<[u8]>,
    name: Box<libc::sockaddr_storage>,
    iov: libc::iovec,
    hdr: libc::msghdr,
}

impl MsgScratch {
    fn recv(len: usize) -> Box<Self> {
        let mut scratch = Box::new(MsgScratch {
            buf: vec![0u8; len].into_boxed_slice(),
            name: Box::new(unsafe { std::mem::zeroed() }),
            iov: unsafe { std::mem::zeroed() },
            hdr: unsafe { std::mem::zeroed() },
        });
        scratch.iov.iov_base = scratch.buf.as_mut_ptr().cast();
        scratch.iov.iov_len = scratch.buf.len();
        scratch.hdr.msg_name = std::ptr::from_mut(scratch.name.as_mut()).cast();
        scratch.hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
        scratch.hdr.msg_iov = &mut scratch.iov;
        scratch.hdr.msg_iovlen = 1;
        scratch
    }

    fn send(buf: &[u8], addr: SocketAddr) -> Box<Self> {
        let (storage, len) = sockaddr_from(addr);
        let mut scratch = Box::new(MsgScratch {
            buf: Box::from(buf),
            name: Box::new(storage),
            iov: unsafe { std::mem::zeroed() },
            hdr: unsafe { std::mem::zeroed() },
        });
        scratch.iov.iov_base = scratch.buf.as_mut_ptr().cast();
        scratch.iov.iov_len = scratch.buf.len();
        scratch.hdr.msg_name = std::ptr::from_mut(scratch.name.as_mut()).cast();
        scratch.hdr.msg_namelen = len;
        scratch.hdr.msg_iov = &mut scratch.iov;
        scratch.hdr.msg_iovlen = 1;
        scratch
    }

    fn hdr_mut_ptr(&mut self) -> *mut libc::msghdr {
        &mut self.hdr
    }

    fn hdr_const_ptr(&self) -> *const libc::msghdr {
        &self.hdr
    }
}

pub struct UringBackend {
    pub base: BackendBase,
    ring: IoUring,
    pending: u32,
    prepared_limit: u32,
    multishot: HashMap<ContextId, MultishotAccept>,
    multishot_by_fd: HashMap<RawFd, ContextId>,
    read_buffers: HashMap<ContextId, (*mut u8, usize)>,
    scratch: HashMap<ContextId, Scratch>,
}

impl UringBackend {
    pub fn new() -> Result<Self> {
        Self::with_entries(DEFAULT_RING_ENTRIES)
    }

    pub fn with_entries(mut entries: u32) -> Result<Self> {
        let ring = loop {
            match IoUring::builder().build(entries) {
                Ok(ring) => break ring,
                Err(e) if e.raw_os_error() == Some(libc::ENOMEM) && entries > 4 => {
                    entries /= 2;
                    continue;
                }
                Err(e) => return Err(Error::Sys(e)),
            }
        };
        Ok(UringBackend {
            base: BackendBase::new(),
            ring,
            pending: 0,
            prepared_limit: entries,
            multishot: HashMap::new(),
            multishot_by_fd: HashMap::new(),
            read_buffers: HashMap::new(),
            scratch: HashMap::new(),
        })
    }

    fn user_data(id: ContextId) -> u64 {
        id.0 as u64
    }

    fn context_id(user_data: u64) -> ContextId {
        ContextId(user_data as usize)
    }

    /// Push one SQE, deferring the actual `io_uring_enter` until the
    /// ring fills up or an immediate submit is requested.
    fn push(&mut self, entry: squeue::Entry) -> Result<()> {
        unsafe {
            while self.ring.submission().push(&entry).is_err() {
                self.immediate_submit()?;
            }
        }
        self.pending += 1;
        if self.pending >= self.prepared_limit {
            self.immediate_submit()?;
        }
        Ok(())
    }

    fn immediate_submit(&mut self) -> Result<()> {
        self.ring.submit().map_err(Error::Sys)?;
        self.pending = 0;
        Ok(())
    }

    pub fn cancel(&mut self, ctx: ContextId) -> Result<()> {
        if let Some(c) = self.base.contexts.get_mut(ctx) {
            c.cancelling = true;
        }
        let entry = opcode::AsyncCancel::new(Self::user_data(ctx))
            .build()
            .user_data(u64::MAX);
        self.push(entry)?;
        self.immediate_submit()
    }

    pub fn outstanding(&self) -> usize {
        self.base.outstanding
    }

    pub fn wakeup(&mut self) -> Result<()> {
        let nop = opcode::Nop::new().build().user_data(u64::MAX);
        self.push(nop)?;
        self.immediate_submit()
    }

    pub fn post_fork(&mut self) -> Result<()> {
        self.base = BackendBase::new();
        self.multishot.clear();
        self.multishot_by_fd.clear();
        self.read_buffers.clear();
        self.scratch.clear();
        self.pending = 0;
        let entries = self.prepared_limit;
        let ring = IoUring::builder().build(entries).map_err(Error::Sys)?;
        self.ring = ring;
        Ok(())
    }

    pub fn poll(&mut self, run_queue: &mut RunQueue, blocking: bool) -> Result<PollOutcome> {
        if self.pending > 0 {
            self.immediate_submit()?;
        }
        if blocking {
            loop {
                match self.ring.submit_and_wait(1) {
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted && run_queue.is_empty() => {
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
                    Err(e) => return Err(Error::Sys(e)),
                }
            }
        } else {
            self.ring.submit().map_err(Error::Sys)?;
        }

        let mut completions = 0;
        let cqes: Vec<cqueue::Entry> = self.ring.completion().map(Into::into).collect();
        for cqe in cqes {
            if cqe.user_data() == u64::MAX {
                continue; // NOP wakeup / cancel acknowledgement
            }
            let id = Self::context_id(cqe.user_data());
            completions += self.handle_completion(id, cqe.result(), cqueue::more(cqe.flags()), run_queue);
        }
        Ok(PollOutcome { completions })
    }

    fn handle_completion(
        &mut self,
        id: ContextId,
        result: i32,
        more: bool,
        run_queue: &mut RunQueue,
    ) -> usize {
        if let Some(m) = self.multishot.get_mut(&id) {
            if result >= 0 {
                m.queue.push_back(Ok(result));
            } else {
                m.queue.push_back(Err(io::Error::from_raw_os_error(-result)));
            }
            if !more {
                m.done = true;
            }
            // Whichever fiber is currently parked waiting on this
            // context (the loop that owns `multishot_accept`, or a
            // plain `accept` draining the same queue) gets woken to
            // pop the new item; it re-arms itself on the same context
            // if more are still expected.
            let fiber = self.base.contexts.get(id).and_then(|c| c.fiber);
            if !more {
                self.base.contexts.force_release(id);
            }
            if let Some(fiber) = fiber {
                run_queue.schedule(fiber, ResumeValue::Value(0), false);
            }
            return 1;
        }

        let Some(ctx) = self.base.contexts.get_mut(id) else {
            self.scratch.remove(&id);
            return 0;
        };

        // A chain links `n` SQEs under one context seeded with `n + 1`
        // refs (the legs plus the awaiting fiber); each leg's completion
        // releases one ref. Only the leg that leaves exactly the fiber's
        // own ref behind is terminal, so its result - the last leg's -
        // is what gets latched and reported back.
        if !matches!(ctx.ref_count, RefCount::Shared(n) if n <= 2) {
            self.base.contexts.release(id);
            return 1;
        }

        ctx.result = result;
        let fiber = ctx.fiber;
        let cancelling = ctx.cancelling;
        // A `recvmsg`/`sendmsg` scratch buffer is reclaimed by the op
        // surface (`take_recvmsg`) once it reads the result off this
        // context; everything else's scratch is pure kernel-facing
        // bookkeeping nothing downstream reads back.
        if !matches!(self.scratch.get(&id), Some(Scratch::Msg(_))) {
            self.scratch.remove(&id);
        }
        self.base.outstanding = self.base.outstanding.saturating_sub(1);
        self.base.contexts.release(id);
        if cancelling {
            return 1;
        }
        if let Some(fiber) = fiber {
            run_queue.schedule(fiber, ResumeValue::Value(i64::from(result)), false);
        }
        1
    }

    // -- core single-shot ops --

    pub fn start_read(&mut self, fd: RawFd, len: usize, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Read, Some(fiber));
        let buf = vec![0u8; len].into_boxed_slice();
        let ptr = Box::leak(buf).as_mut_ptr();
        self.read_buffers.insert(id, (ptr, len));
        let entry = opcode::Read::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    /// Reclaim the scratch buffer a completed `read` wrote into. Must be
    /// called at most once per context, after its completion has been
    /// observed.
    pub fn take_read_buffer(&mut self, id: ContextId) -> Option<Box<[u8]>> {
        let (ptr, len) = self.read_buffers.remove(&id)?;
        // Safety: `ptr` was produced by `Box::leak` on a `[u8]` of
        // exactly `len` elements in `start_read` and is reclaimed here
        // exactly once.
        Some(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) })
    }

    pub fn start_write(&mut self, fd: RawFd, buf: Arc<[u8]>, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Write, Some(fiber));
        if let Some(c) = self.base.contexts.get_mut(id) {
            c.attach_buffer(buf.clone());
        }
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    pub fn start_accept(&mut self, fd: RawFd, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Accept, Some(fiber));
        let entry = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    /// `recvmsg(2)` via a boxed [`MsgScratch`]: unlike plain `read`, the
    /// peer address the datagram arrived from is preserved in
    /// `msg_name` for [`take_recvmsg`](Self::take_recvmsg) to decode.
    pub fn start_recvmsg(&mut self, fd: RawFd, len: usize, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Recvmsg, Some(fiber));
        let mut scratch = MsgScratch::recv(len);
        let hdr_ptr = scratch.hdr_mut_ptr();
        self.scratch.insert(id, Scratch::Msg(scratch));
        let entry = opcode::RecvMsg::new(types::Fd(fd), hdr_ptr)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    /// Reclaim the payload and decoded peer address from a completed
    /// `recvmsg`. Must be called at most once per context.
    pub fn take_recvmsg(&mut self, id: ContextId, n: usize) -> Option<(Vec<u8>, Option<SocketAddr>)> {
        let Some(Scratch::Msg(scratch)) = self.scratch.remove(&id) else {
            return None;
        };
        let addr = sockaddr_to_socket_addr(&scratch.name, scratch.hdr.msg_namelen);
        Some((scratch.buf[..n].to_vec(), addr))
    }

    /// `sendmsg(2)` to `addr`, preserving datagram semantics (unlike
    /// `send`/`write`, which require an already-connected fd).
    pub fn start_sendmsg(
        &mut self,
        fd: RawFd,
        buf: &[u8],
        addr: SocketAddr,
        fiber: FiberId,
    ) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Sendmsg, Some(fiber));
        let scratch = MsgScratch::send(buf, addr);
        let hdr_ptr = scratch.hdr_const_ptr();
        self.scratch.insert(id, Scratch::Msg(scratch));
        let entry = opcode::SendMsg::new(types::Fd(fd), hdr_ptr)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    pub fn start_connect(&mut self, fd: RawFd, addr: SocketAddr, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Connect, Some(fiber));
        let (sockaddr, len) = sockaddr_from(addr);
        let boxed = Box::new(sockaddr);
        let ptr: *const libc::sockaddr_storage = boxed.as_ref();
        self.scratch.insert(id, Scratch::SockAddr(boxed));
        let entry = opcode::Connect::new(types::Fd(fd), ptr.cast(), len)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    pub fn start_poll(&mut self, fd: RawFd, interest: Interest, fiber: Option<FiberId>) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Poll, fiber);
        let entry = opcode::PollAdd::new(types::Fd(fd), interest.to_poll_events() as u32)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    pub fn start_timeout(&mut self, dur: Duration, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Timeout, Some(fiber));
        let ts = Box::new(duration_to_timespec(dur));
        let ptr: *const types::Timespec = ts.as_ref();
        self.scratch.insert(id, Scratch::Timespec(ts));
        let entry = opcode::Timeout::new(ptr)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    // -- completion-ring-only ops --

    pub fn start_splice(
        &mut self,
        src: RawFd,
        dst: RawFd,
        len: u32,
        fiber: FiberId,
    ) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Splice, Some(fiber));
        let entry = opcode::Splice::new(types::Fd(src), -1, types::Fd(dst), -1, len)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    pub fn start_tee(&mut self, src: RawFd, dst: RawFd, len: u32, fiber: FiberId) -> Result<ContextId> {
        let id = self.base.contexts.acquire(OpKind::Splice, Some(fiber));
        let entry = opcode::Tee::new(types::Fd(src), types::Fd(dst), len)
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    /// `n` linked SQEs sharing one context, ref-counted `n + 1` (the
    /// `+1` is the awaiting fiber). The kernel cancels the remainder of
    /// the chain the moment one op fails.
    pub fn start_chain(&mut self, ops: Vec<ChainOp>, fiber: FiberId) -> Result<ContextId> {
        if ops.is_empty() {
            return Err(Error::argument("chain requires at least one operation"));
        }
        let n = ops.len() as u32;
        let id = self
            .base
            .contexts
            .acquire_with_refs(OpKind::Chain, Some(fiber), RefCount::Shared(n + 1));
        let last = ops.len() - 1;
        for op in &ops {
            // Pin every chain leg's buffer for the lifetime of the
            // context; the kernel may still be reading/writing through
            // it after this function returns.
            if let Some(buf) = op.buffer() {
                if let Some(c) = self.base.contexts.get_mut(id) {
                    c.attach_buffer(buf);
                }
            }
        }
        for (i, op) in ops.iter().enumerate() {
            let mut entry = op.to_entry().user_data(Self::user_data(id));
            if i != last {
                entry = entry.flags(squeue::Flags::IO_LINK);
            }
            self.push(entry)?;
        }
        self.base.outstanding += 1;
        Ok(id)
    }

    pub fn start_multishot_accept(&mut self, listener: RawFd, fiber: FiberId) -> Result<ContextId> {
        let id = self
            .base
            .contexts
            .acquire_with_refs(OpKind::MultishotAccept, Some(fiber), RefCount::Multishot);
        self.multishot.insert(
            id,
            MultishotAccept {
                listener,
                queue: VecDeque::new(),
                done: false,
            },
        );
        self.multishot_by_fd.insert(listener, id);
        let entry = opcode::AcceptMulti::new(types::Fd(listener))
            .build()
            .user_data(Self::user_data(id));
        self.base.outstanding += 1;
        self.push(entry)?;
        Ok(id)
    }

    /// The live multishot-accept context already queuing connections for
    /// `listener`, if one is running. A plain `accept` drains this queue
    /// instead of racing a brand new single-shot submission against it.
    pub fn multishot_accept_for(&self, listener: RawFd) -> Option<ContextId> {
        self.multishot_by_fd.get(&listener).copied()
    }

    /// Non-blocking pop of one accepted connection, or `None` if the
    /// next completion hasn't arrived yet and the multishot op is still
    /// live.
    pub fn poll_multishot_accept(&mut self, id: ContextId) -> Option<io::Result<RawFd>> {
        self.multishot.get_mut(&id).and_then(|m| m.queue.pop_front())
    }

    pub fn multishot_accept_done(&self, id: ContextId) -> bool {
        self.multishot.get(&id).map(|m| m.done).unwrap_or(true)
    }

    pub fn cleanup_multishot_accept(&mut self, id: ContextId) -> Result<()> {
        if let Some(m) = self.multishot.get(&id) {
            let done = m.done;
            let listener = m.listener;
            if !done {
                self.cancel(id)?;
            }
            self.multishot_by_fd.remove(&listener);
        }
        self.multishot.remove(&id);
        self.base.contexts.force_release(id);
        Ok(())
    }

    pub fn start_waitpid_poll(&mut self, pidfd: RawFd, fiber: FiberId) -> Result<ContextId> {
        self.start_poll(pidfd, Interest::READ, Some(fiber))
    }

    /// Drop the scratch buffer a completed `sendmsg` pinned for the
    /// kernel. Must be called at most once per context.
    pub fn take_sendmsg(&mut self, id: ContextId) {
        self.scratch.remove(&id);
    }

    /// Cancel any still-live multishot accepts (so the kernel stops
    /// writing into buffers we are about to drop) and free the
    /// op-context store. The ring itself closes via `IoUring`'s own
    /// `Drop` once this backend is dropped.
    pub fn shutdown(&mut self) {
        for id in self.multishot.keys().copied().collect::<Vec<_>>() {
            let _ = self.cancel(id);
        }
        self.multishot.clear();
        self.multishot_by_fd.clear();
        self.read_buffers.clear();
        self.scratch.clear();
        self.base.contexts = ContextStore::new();
    }
}

/// One leg of a `chain` call: everything `Backend_chain_prepare_*`
/// could produce a linked SQE for.
pub enum ChainOp {
    Write { fd: RawFd, buf: Arc<[u8]> },
    Send { fd: RawFd, buf: Arc<[u8]> },
    Splice { src: RawFd, dst: RawFd, len: u32 },
}

impl ChainOp {
    fn to_entry(&self) -> squeue::Entry {
        match self {
            ChainOp::Write { fd, buf } => {
                opcode::Write::new(types::Fd(*fd), buf.as_ptr(), buf.len() as u32).build()
            }
            ChainOp::Send { fd, buf } => {
                opcode::Send::new(types::Fd(*fd), buf.as_ptr(), buf.len() as u32).build()
            }
            ChainOp::Splice { src, dst, len } => {
                opcode::Splice::new(types::Fd(*src), -1, types::Fd(*dst), -1, *len).build()
            }
        }
    }

    fn buffer(&self) -> Option<Arc<[u8]>> {
        match self {
            ChainOp::Write { buf, .. } | ChainOp::Send { buf, .. } => Some(buf.clone()),
            ChainOp::Splice { .. } => None,
        }
    }
}

/// Inverse of [`sockaddr_from`]: decode a `recvmsg` completion's
/// `msg_name`/`msg_namelen` back into a [`SocketAddr`], or `None` if the
/// peer address wasn't filled in (e.g. a connected socket).
pub fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage, len: u32) -> Option<SocketAddr> {
    if len == 0 {
        return None;
    }
    match i32::from(storage.ss_family) {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin: libc::sockaddr_in =
                unsafe { std::ptr::read(std::ptr::from_ref(storage).cast()) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6: libc::sockaddr_in6 =
                unsafe { std::ptr::read(std::ptr::from_ref(storage).cast()) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

fn duration_to_timespec(dur: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(dur.as_secs())
        .nsec(dur.subsec_nanos())
}

/// Exposed for the readiness backend's `connect`, which issues the
/// syscall directly instead of through a submitted op.
pub fn sockaddr_for_connect(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    sockaddr_from(addr)
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, u32) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(std::ptr::from_mut(&mut storage).cast(), sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(std::ptr::from_mut(&mut storage).cast(), sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as u32)
}
