//! The application-facing blocking receive path.
//!
//! A receiver declares interest (for one RPC, or for whole categories),
//! reaps a little dead-RPC storage, busy-polls, then parks. Whichever way an
//! RPC arrives, the thread tears down its registrations, copies payload out
//! with the RPC lock dropped, and returns the RPC only once its message is
//! complete.

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::{HomaError, Result};
use crate::interest::Interest;
use crate::metrics::inc_metric;
use crate::msgin::copy_to_user;
use crate::rpc::{
    is_client_id, LockedRpc, RpcHandle, RpcState, FLAG_HANDING_OFF, FLAG_PKTS_READY,
    FLAG_QUEUED_READY,
};
use crate::socket::{HomaSocket, SockState};
use crate::timing;

/// A yield that took longer than this ran somebody else; that time counts as
/// blocked, not polled.
const YIELD_BLOCKED_CYCLES: u64 = 5_000;

/// Upper bound on one park while sleeping; bounds the latency of noticing
/// shutdown or a signal delivered without an unpark.
const SLEEP_CHECK_INTERVAL: Duration = Duration::from_millis(2);

bitflags::bitflags! {
    /// What a receive call is willing to accept.
    pub struct RecvFlags: u32 {
        /// Accept inbound requests.
        const REQUEST = 0x01;
        /// Accept responses to our requests.
        const RESPONSE = 0x02;
        /// Fail with `WouldBlock` instead of waiting.
        const NONBLOCKING = 0x04;
    }
}

impl HomaSocket {
    /// Wait for a complete inbound message.
    ///
    /// With nonzero `id`, waits for the response to that client RPC;
    /// otherwise `flags` selects the request and/or response categories.
    /// Returns the RPC locked, either message-complete or with its `error`
    /// field set; the caller inspects `error` before trusting the payload.
    pub fn wait_for_message(self: &Arc<Self>, flags: RecvFlags, id: u64) -> Result<LockedRpc> {
        let homa = Arc::clone(&self.homa);
        let config = &homa.config;

        // Each iteration finds an RPC, but not necessarily one that can be
        // returned (its message may still be incomplete after copy-out).
        loop {
            let interest = Interest::new(timing::current_core());
            let mut pending_err = self.register_interests(&interest, flags, id).err();
            let mut polled = false;
            let mut slept = false;

            if pending_err.is_none() && !interest.ready.is_ready() {
                // Put idle time to use before parking.
                loop {
                    if interest.ready.is_ready() {
                        break;
                    }
                    if self.reap(config.reap_limit) == 0 {
                        break;
                    }
                    thread::yield_now();
                }

                if !interest.ready.is_ready() {
                    if flags.contains(RecvFlags::NONBLOCKING) {
                        pending_err = Some(HomaError::WouldBlock);
                    } else {
                        polled = self.poll_for_handoff(&interest);
                        if !interest.ready.is_ready() {
                            slept = self.sleep_for_handoff(&interest);
                        }
                    }
                }
            }

            // Tear down registrations before anything else: until this is
            // done, a handoff can still be delivered to us.
            if interest.maybe_linked() {
                let mut state = self.lock_state();
                self.clear_interest_links(&mut state, &interest);
            }

            // The handoff may have landed at any point up to the teardown.
            if let Some(rpc) = interest.ready.take() {
                let mut locked = rpc.lock();
                rpc.clear_flags(FLAG_HANDING_OFF);
                if locked.state == RpcState::Dead {
                    continue;
                }
                if locked.error == 0 {
                    let err = copy_to_user(homa.pool.as_ref(), &mut locked);
                    if err != 0 {
                        locked.error = err;
                    }
                }
                if locked.error != 0 {
                    return Ok(locked);
                }
                rpc.clear_flags(FLAG_PKTS_READY);
                // The lock has been held since the last copy batch, so an
                // empty queue here is definitive.
                if rpc.sched.bytes_remaining() == 0 && locked.msgin.packets.is_empty() {
                    if slept {
                        inc_metric!(homa.metrics.slow_wakeups);
                    } else if polled {
                        inc_metric!(homa.metrics.fast_wakeups);
                    }
                    return Ok(locked);
                }
                // Message not complete; keep waiting.
            }

            if let Some(err) = pending_err {
                return Err(err);
            }
            if homa.signal_pending() {
                return Err(HomaError::Interrupted);
            }
        }
    }

    /// Busy-poll for a handoff for the configured budget. Yield time during
    /// which another thread ran is discounted from the budget.
    fn poll_for_handoff(&self, interest: &Arc<Interest>) -> bool {
        let homa = &self.homa;
        let mut poll_start = timing::rdtsc();
        let mut now = poll_start;
        loop {
            if interest.ready.is_ready() {
                inc_metric!(homa.metrics.poll_cycles, now.saturating_sub(poll_start));
                return true;
            }
            if now >= poll_start + homa.config.poll_cycles {
                inc_metric!(homa.metrics.poll_cycles, now.saturating_sub(poll_start));
                return false;
            }
            let yielded = timing::rdtsc();
            thread::yield_now();
            now = timing::rdtsc();
            let blocked = now - yielded;
            if blocked > YIELD_BLOCKED_CYCLES {
                inc_metric!(homa.metrics.blocked_cycles, blocked);
                poll_start += blocked;
            }
        }
    }

    /// Park until a handoff, shutdown, or a signal. Returns true if the
    /// thread actually slept.
    fn sleep_for_handoff(&self, interest: &Arc<Interest>) -> bool {
        let homa = &self.homa;
        homa.cores.note_app_active(interest.core);
        let mut slept = false;
        while !interest.ready.is_ready() && !self.is_shutdown() && !homa.signal_pending() {
            let start = timing::rdtsc();
            thread::park_timeout(SLEEP_CHECK_INTERVAL);
            inc_metric!(
                homa.metrics.blocked_cycles,
                timing::rdtsc().saturating_sub(start)
            );
            slept = true;
        }
        slept
    }

    /// Record everything needed for this thread to be woken when a matching
    /// RPC becomes ready. If one is ready already, it is claimed and
    /// published into the interest before returning.
    fn register_interests(
        self: &Arc<Self>,
        interest: &Arc<Interest>,
        flags: RecvFlags,
        id: u64,
    ) -> Result<()> {
        let mut targeted: Option<LockedRpc> = None;
        if id != 0 {
            if !is_client_id(id) {
                return Err(HomaError::InvalidId(id));
            }
            let Some(rpc) = self.find_client(id) else {
                return Err(HomaError::InvalidId(id));
            };
            targeted = Some(rpc.lock());
        }

        // The RPC lock (if any) is held; the socket lock nests inside it.
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(HomaError::Shutdown);
        }

        if let Some(locked) = targeted.take() {
            {
                let slot = locked
                    .rpc()
                    .interest
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if slot.as_ref().is_some_and(|i| !Arc::ptr_eq(i, interest)) {
                    // Another thread is already waiting on this RPC.
                    return Err(HomaError::InvalidId(id));
                }
            }
            let rpc = Arc::clone(locked.rpc());
            if rpc.test_flags(FLAG_PKTS_READY) || locked.error != 0 {
                if rpc.test_flags(FLAG_QUEUED_READY) {
                    state.ready_responses.retain(|r| !Arc::ptr_eq(r, &rpc));
                    state.ready_requests.retain(|r| !Arc::ptr_eq(r, &rpc));
                    rpc.clear_flags(FLAG_QUEUED_READY);
                }
                self.claim(state, Some(locked), rpc, interest);
                return Ok(());
            }
            *rpc.interest.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(interest));
            *interest.reg_rpc.lock().unwrap_or_else(|e| e.into_inner()) = Some(rpc);
            interest.has_reg.store(true, Ordering::Release);
            // The socket lock stays held; only the RPC lock drops here.
            drop(locked);
        }

        if flags.contains(RecvFlags::RESPONSE) {
            if let Some(rpc) = Self::pop_ready(&mut state.ready_responses) {
                self.claim(state, None, rpc, interest);
                return Ok(());
            }
            // Front of the list: reusing the most recent waiter keeps its
            // cache warm.
            state.response_interests.push_front(Arc::clone(interest));
            interest.on_response_list.store(true, Ordering::Release);
        }
        if flags.contains(RecvFlags::REQUEST) {
            if let Some(rpc) = Self::pop_ready(&mut state.ready_requests) {
                // Make sure this interest can't also be handed a response.
                if interest.on_response_list.swap(false, Ordering::AcqRel) {
                    state.response_interests.retain(|i| !Arc::ptr_eq(i, interest));
                }
                self.claim(state, None, rpc, interest);
                return Ok(());
            }
            state.request_interests.push_front(Arc::clone(interest));
            interest.on_request_list.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Hand an already-ready RPC to `interest`. `HANDING_OFF` pins the RPC
    /// across the gap between dropping the socket lock and re-locking it.
    fn claim(
        &self,
        state: MutexGuard<'_, SockState>,
        already_locked: Option<LockedRpc>,
        rpc: RpcHandle,
        interest: &Arc<Interest>,
    ) {
        if Self::more_ready(&state) {
            // Other RPCs are still queued; let poll/select know.
            Self::notify_data_ready(&state);
        }
        rpc.set_flags(FLAG_HANDING_OFF);
        drop(state);
        let locked = match already_locked {
            Some(locked) => locked,
            None => rpc.lock(),
        };
        rpc.clear_flags(FLAG_HANDING_OFF);
        drop(locked);
        interest.ready.publish(rpc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::config::HomaConfig;
    use crate::msgin::DataSegment;
    use crate::transport::RecordingSink;
    use crate::Homa;
    use std::net::{IpAddr, Ipv4Addr};

    fn setup() -> (Arc<Homa>, Arc<HomaSocket>) {
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(crate::buffer::PageBufferPool::new(64).unwrap());
        let homa = Arc::new(Homa::new(
            HomaConfig::default().with_poll_usecs(0),
            pool,
            sink,
        ));
        let sock = HomaSocket::new(&homa, 4000);
        (homa, sock)
    }

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    /// A server RPC whose one-segment message has fully arrived and is
    /// queued ready.
    fn ready_request(sock: &Arc<HomaSocket>) -> RpcHandle {
        let (rpc, _) = sock
            .find_or_create_server(addr(), 99, 43, 1000, 1000)
            .unwrap();
        let mut locked = rpc.lock();
        assert!(locked.msgin.add_packet(
            &rpc.sched,
            DataSegment {
                offset: 0,
                length: 1000,
                retransmit: false,
                payload: vec![7; 1000],
            }
        ));
        rpc.set_flags(FLAG_PKTS_READY);
        sock.handoff(&mut locked);
        drop(locked);
        rpc
    }

    #[test]
    fn test_nonblocking_empty_returns_wouldblock() {
        let (_homa, sock) = setup();
        let err = sock
            .wait_for_message(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0)
            .unwrap_err();
        assert_eq!(err, HomaError::WouldBlock);
    }

    #[test]
    fn test_register_then_cancel_leaves_no_trace() {
        let (_homa, sock) = setup();
        let client = sock.new_client_rpc(addr(), 99, 100).unwrap();

        let err = sock
            .wait_for_message(
                RecvFlags::REQUEST | RecvFlags::RESPONSE | RecvFlags::NONBLOCKING,
                client.id,
            )
            .unwrap_err();
        assert_eq!(err, HomaError::WouldBlock);

        let state = sock.lock_state();
        assert!(state.request_interests.is_empty());
        assert!(state.response_interests.is_empty());
        drop(state);
        assert!(client.interest.lock().unwrap().is_none());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let (_homa, sock) = setup();
        // Odd id: not a client RPC.
        assert_eq!(
            sock.wait_for_message(RecvFlags::RESPONSE, 43).unwrap_err(),
            HomaError::InvalidId(43)
        );
        // Even but unknown.
        assert_eq!(
            sock.wait_for_message(RecvFlags::RESPONSE, 88).unwrap_err(),
            HomaError::InvalidId(88)
        );
    }

    #[test]
    fn test_claims_queued_request() {
        let (homa, sock) = setup();
        let rpc = ready_request(&sock);

        let locked = sock
            .wait_for_message(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0)
            .unwrap();
        assert!(Arc::ptr_eq(locked.rpc(), &rpc));
        assert_eq!(locked.rpc().sched.bytes_remaining(), 0);
        assert_eq!(locked.msgin.packets.len(), 0);
        assert!(!rpc.test_flags(FLAG_PKTS_READY | FLAG_HANDING_OFF | FLAG_QUEUED_READY));

        // The payload actually landed in the buffer pages.
        let (ptr, _) = homa.pool.get_buffer(rpc.id, 0).unwrap();
        let first = unsafe { *ptr.as_ptr() };
        assert_eq!(first, 7);
    }

    #[test]
    fn test_dead_handoff_skipped() {
        let (_homa, sock) = setup();
        let rpc = ready_request(&sock);
        {
            let mut locked = rpc.lock();
            sock.rpc_free(&mut locked);
        }
        // The queued entry is dead; a nonblocking wait must not return it.
        let err = sock
            .wait_for_message(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0)
            .unwrap_err();
        assert_eq!(err, HomaError::WouldBlock);
    }

    #[test]
    fn test_aborted_rpc_surfaces_error() {
        let (_homa, sock) = setup();
        let client = sock.new_client_rpc(addr(), 99, 100).unwrap();
        {
            let mut locked = client.lock();
            sock.rpc_abort(&mut locked, -libc::ENOTCONN);
        }
        let locked = sock
            .wait_for_message(RecvFlags::RESPONSE | RecvFlags::NONBLOCKING, client.id)
            .unwrap();
        assert_eq!(locked.error, -libc::ENOTCONN);
        assert!(Arc::ptr_eq(locked.rpc(), &client));
    }

    #[test]
    fn test_shutdown_fails_new_waits() {
        let (_homa, sock) = setup();
        sock.shutdown();
        assert_eq!(
            sock.wait_for_message(RecvFlags::REQUEST, 0).unwrap_err(),
            HomaError::Shutdown
        );
    }

    #[test]
    fn test_shutdown_wakes_blocked_wait() {
        let (_homa, sock) = setup();
        let waiter = {
            let sock = Arc::clone(&sock);
            thread::spawn(move || sock.wait_for_message(RecvFlags::REQUEST, 0))
        };
        thread::sleep(Duration::from_millis(20));
        sock.shutdown();
        assert_eq!(waiter.join().unwrap().unwrap_err(), HomaError::Shutdown);
    }

    #[test]
    fn test_signal_interrupts_wait() {
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(crate::buffer::PageBufferPool::new(16).unwrap());
        let mut homa = Homa::new(HomaConfig::default().with_poll_usecs(0), pool, sink);
        homa.set_signal_check(Box::new(|| true));
        let homa = Arc::new(homa);
        let sock = HomaSocket::new(&homa, 4000);
        assert_eq!(
            sock.wait_for_message(RecvFlags::REQUEST, 0).unwrap_err(),
            HomaError::Interrupted
        );
    }

    #[test]
    fn test_handoff_wakes_parked_thread() {
        let (_homa, sock) = setup();
        let waiter = {
            let sock = Arc::clone(&sock);
            thread::spawn(move || {
                sock.wait_for_message(RecvFlags::REQUEST, 0)
                    .map(|locked| locked.rpc().id)
            })
        };
        // Give the waiter time to park.
        thread::sleep(Duration::from_millis(30));
        let rpc = ready_request(&sock);
        assert_eq!(waiter.join().unwrap().unwrap(), rpc.id);
    }
}
