//! Timer callback queue.
//!
//! Registered callbacks are kept sorted by expiry; the head's deadline is
//! programmed into the timer hardware's compare register. The interrupt
//! handler pops every expired entry, fires its action, and reprograms the
//! deadline for the new head.

use std::sync::Arc;

use sos_kernel_model::ReplyCap;

use crate::error::{SosError, SosResult};
use crate::server::Server;

/// What to do when a timer fires.
pub enum TimerAction {
    /// Reply `0` to a sleeping client.
    WakeClient(ReplyCap),
    /// Record the timer id; used by tests observing firing order.
    Probe(Arc<spin::Mutex<Vec<u32>>>),
}

struct TimerEntry {
    id: u32,
    expire_us: u64,
    action: TimerAction,
}

pub struct Clock {
    /// Pending timers, soonest first; FIFO among equal expiries.
    pending: Vec<TimerEntry>,
    next_id: u32,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            next_id: 1,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a callback `delay_us` from now. Returns its id.
pub fn register_timer(server: &Server, delay_us: u64, action: TimerAction) -> u32 {
    let mut clock = server.clock.lock();
    let mut kernel = server.kernel.lock();
    let expire_us = kernel.now_us() + delay_us;
    let id = clock.next_id;
    clock.next_id += 1;
    // Insert after any entry with the same expiry so equal delays fire in
    // registration order.
    let at = clock
        .pending
        .partition_point(|e| e.expire_us <= expire_us);
    clock.pending.insert(
        at,
        TimerEntry {
            id,
            expire_us,
            action,
        },
    );
    if at == 0 {
        kernel.set_timer_deadline(Some(expire_us));
    }
    id
}

/// Cancel a pending timer by id.
pub fn remove_timer(server: &Server, id: u32) -> SosResult<TimerAction> {
    let mut clock = server.clock.lock();
    let at = clock
        .pending
        .iter()
        .position(|e| e.id == id)
        .ok_or(SosError::NotFound)?;
    let entry = clock.pending.remove(at);
    if at == 0 {
        let deadline = clock.pending.first().map(|e| e.expire_us);
        server.kernel.lock().set_timer_deadline(deadline);
    }
    Ok(entry.action)
}

/// Timer interrupt: fire everything that has expired and reprogram the
/// compare register for the new head.
pub fn timer_interrupt(server: &Arc<Server>) {
    loop {
        let entry = {
            let mut clock = server.clock.lock();
            let mut kernel = server.kernel.lock();
            let now = kernel.now_us();
            let head_expired = clock
                .pending
                .first()
                .is_some_and(|head| head.expire_us <= now);
            if head_expired {
                Some(clock.pending.remove(0))
            } else {
                let deadline = clock.pending.first().map(|e| e.expire_us);
                kernel.set_timer_deadline(deadline);
                None
            }
        };
        let Some(entry) = entry else { break };
        log::trace!("timer {} fired", entry.id);
        match entry.action {
            TimerAction::WakeClient(reply) => server.reply(reply, &[0]),
            TimerAction::Probe(order) => order.lock().push(entry.id),
        }
    }
}

/// Microseconds since boot.
pub fn time_stamp(server: &Server) -> u64 {
    server.kernel.lock().now_us()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher;
    use crate::server::{BootConfig, Server};

    fn fire_all(server: &Arc<Server>, advance_us: u64) {
        server.kernel.lock().advance_time(advance_us);
        dispatcher::run_pending(server);
    }

    #[test]
    fn test_earlier_timer_fires_first() {
        let server = Server::boot(BootConfig::default());
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let late = register_timer(&server, 10_000, TimerAction::Probe(Arc::clone(&order)));
        let early = register_timer(&server, 5_000, TimerAction::Probe(Arc::clone(&order)));

        let t0 = time_stamp(&server);
        fire_all(&server, 6_000);
        let t1 = time_stamp(&server);
        assert_eq!(*order.lock(), vec![early]);
        fire_all(&server, 6_000);
        assert_eq!(*order.lock(), vec![early, late]);
        let t2 = time_stamp(&server);
        assert!(t0 < t1 && t1 < t2, "time must be monotonic");
    }

    #[test]
    fn test_remove_timer() {
        let server = Server::boot(BootConfig::default());
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let id = register_timer(&server, 1_000, TimerAction::Probe(Arc::clone(&order)));
        assert!(remove_timer(&server, id).is_ok());
        assert!(matches!(remove_timer(&server, id), Err(SosError::NotFound)));
        fire_all(&server, 2_000);
        assert!(order.lock().is_empty());
    }

    #[test]
    fn test_equal_expiries_fire_in_registration_order() {
        let server = Server::boot(BootConfig::default());
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let a = register_timer(&server, 1_000, TimerAction::Probe(Arc::clone(&order)));
        let b = register_timer(&server, 1_000, TimerAction::Probe(Arc::clone(&order)));
        fire_all(&server, 1_500);
        assert_eq!(*order.lock(), vec![a, b]);
    }
}
