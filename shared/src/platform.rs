use core::time::Duration;

/// Access to the platform's free-running microsecond counter and interrupt
/// masking.
///
/// The counter wraps; intervals are always computed with [`elapsed_us`] which
/// is valid for spans below `u32::MAX / 2` microseconds (about 35 minutes).
///
/// `interrupts_off`/`interrupts_on` must nest: interrupts are re-enabled only
/// when the last of the stacked `interrupts_off` calls has been undone.
pub trait Platform {
    fn micros(&self) -> u32;

    fn interrupts_off(&self);
    fn interrupts_on(&self);

    /// For platforms with an interrupt watchdog (ESP-class): the maximum time
    /// interrupts may stay disabled before the watchdog must be fed. Wait
    /// loops running inside an interrupt-free scope briefly re-enable
    /// interrupts once this budget is used up. This is the sole exception to
    /// the "no interrupts inside the scope" contract.
    fn watchdog_budget(&self) -> Option<Duration> {
        None
    }
}

/// Microseconds elapsed from `start` to `now`, modulo counter wrap.
#[inline]
pub fn elapsed_us(now: u32, start: u32) -> u32 {
    now.wrapping_sub(start)
}

/// A scope for withholding interrupts.
///
/// Interrupts are re-enabled (subject to nesting) when the guard is dropped.
pub struct InterruptsGuard<'a, P: Platform + ?Sized> {
    platform: &'a P,
}

impl<'a, P: Platform + ?Sized> InterruptsGuard<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        platform.interrupts_off();
        InterruptsGuard { platform }
    }

    /// Briefly re-enable interrupts so a pending watchdog can run, then
    /// disable them again. Only meaningful inside long polling loops, see
    /// [`Platform::watchdog_budget`].
    pub fn feed_watchdog(&self) {
        self.platform.interrupts_on();
        self.platform.interrupts_off();
    }
}

impl<P: Platform + ?Sized> Drop for InterruptsGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.interrupts_on();
    }
}

/// Run `f` with interrupts disabled.
pub fn scoped_no_interrupts<P: Platform + ?Sized, R>(platform: &P, f: impl FnOnce() -> R) -> R {
    let _guard = InterruptsGuard::new(platform);
    f()
}

/// Busy-wait for `us` microseconds.
///
/// Works when interrupts are disabled since it only polls the counter;
/// platforms whose counter advances in ISR context must provide a
/// cycle-counting `micros` implementation instead.
pub fn delay_isafe<P: Platform + ?Sized>(platform: &P, us: u32) {
    let start = platform.micros();
    while elapsed_us(platform.micros(), start) < us {}
}

/// Busy-wait until `deadline_us` microseconds have elapsed since `start`.
///
/// The fast-loader engines schedule all bit edges of a byte relative to one
/// reference edge; this keeps their cumulative error at the resolution of the
/// counter rather than the sum of per-step errors.
#[inline]
pub fn wait_until<P: Platform + ?Sized>(platform: &P, start: u32, deadline_us: u32) {
    while elapsed_us(platform.micros(), start) < deadline_us {}
}

#[cfg(test)]
mod test {
    use super::*;
    use core::cell::Cell;

    struct TickPlatform {
        now: Cell<u32>,
        depth: Cell<u32>,
        enables: Cell<u32>,
    }

    impl Platform for TickPlatform {
        fn micros(&self) -> u32 {
            let t = self.now.get();
            self.now.set(t.wrapping_add(1));
            t
        }
        fn interrupts_off(&self) {
            self.depth.set(self.depth.get() + 1);
        }
        fn interrupts_on(&self) {
            self.depth.set(self.depth.get() - 1);
            if self.depth.get() == 0 {
                self.enables.set(self.enables.get() + 1);
            }
        }
    }

    fn platform() -> TickPlatform {
        TickPlatform {
            now: Cell::new(0),
            depth: Cell::new(0),
            enables: Cell::new(0),
        }
    }

    #[test]
    fn elapsed_handles_wrap() {
        assert_eq!(elapsed_us(5, u32::MAX - 4), 10);
        assert_eq!(elapsed_us(100, 40), 60);
    }

    #[test]
    fn guard_nests() {
        let p = platform();
        {
            let _outer = InterruptsGuard::new(&p);
            {
                let _inner = InterruptsGuard::new(&p);
            }
            // inner drop must not have re-enabled interrupts
            assert_eq!(p.enables.get(), 0);
        }
        assert_eq!(p.enables.get(), 1);
    }

    #[test]
    fn delay_advances_clock() {
        let p = platform();
        delay_isafe(&p, 50);
        assert!(p.now.get() >= 50);
    }
}
