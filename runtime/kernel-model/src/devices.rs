//! Host devices: the serial port and the virtual clock.

use crate::{KernelModel, Word, IRQ_BADGE_SERIAL, IRQ_BADGE_TIMER};

impl KernelModel {
    /// Transmit bytes on the serial port. Returns the count sent (always
    /// all of them; the modelled UART has no flow control).
    pub fn serial_send(&mut self, bytes: &[u8]) -> usize {
        self.serial_out.extend_from_slice(bytes);
        bytes.len()
    }

    /// Everything transmitted so far; drains the buffer.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.serial_out)
    }

    /// Deliver bytes typed at the console and raise the serial interrupt.
    pub fn inject_serial_input(&mut self, bytes: &[u8]) {
        self.serial_in.extend(bytes.iter().copied());
        self.post_interrupt(IRQ_BADGE_SERIAL, 0);
    }

    /// Next received byte, if any.
    pub fn serial_recv(&mut self) -> Option<u8> {
        self.serial_in.pop_front()
    }

    /// Microseconds since boot.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Program the one-shot timer compare register (absolute time).
    /// `None` disables it.
    pub fn set_timer_deadline(&mut self, deadline_us: Option<u64>) {
        self.timer_deadline = deadline_us;
    }

    /// Advance the clock, raising the timer interrupt if the deadline was
    /// crossed.
    pub fn advance_time(&mut self, delta_us: u64) {
        self.now_us += delta_us;
        if let Some(d) = self.timer_deadline {
            if d <= self.now_us {
                self.timer_deadline = None;
                self.post_interrupt(IRQ_BADGE_TIMER, 0);
            }
        }
    }

    /// Post a disk-completion interrupt carrying an opaque token (the
    /// server passes a coroutine id through it).
    pub fn post_disk_completion(&mut self, token: Word) {
        self.post_interrupt(crate::IRQ_BADGE_DISK, token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectType;

    #[test]
    fn test_clock_deadline_fires_once() {
        let mut model = KernelModel::new(0x1000_0000, 0x1004_0000);
        let paddr = model.ut_alloc(ObjectType::Endpoint.size_bits()).unwrap();
        let ep = model.untyped_retype(paddr, ObjectType::Endpoint).unwrap();
        model.route_interrupts(ep).unwrap();

        model.set_timer_deadline(Some(100));
        model.advance_time(50);
        assert!(model.wait(ep).unwrap().is_none());
        model.advance_time(60);
        let msg = model.wait(ep).unwrap().unwrap();
        assert_eq!(msg.badge & !crate::IRQ_EP_BADGE, IRQ_BADGE_TIMER);
        model.advance_time(1000);
        assert!(model.wait(ep).unwrap().is_none());
    }

    #[test]
    fn test_serial_echo() {
        let mut model = KernelModel::new(0x1000_0000, 0x1004_0000);
        let paddr = model.ut_alloc(ObjectType::Endpoint.size_bits()).unwrap();
        let ep = model.untyped_retype(paddr, ObjectType::Endpoint).unwrap();
        model.route_interrupts(ep).unwrap();

        model.inject_serial_input(b"hi\n");
        assert_eq!(model.serial_recv(), Some(b'h'));
        model.serial_send(b"ok");
        assert_eq!(model.take_serial_output(), b"ok");
        let _ = model.wait(ep).unwrap().unwrap();
    }
}
