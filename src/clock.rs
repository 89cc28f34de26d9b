use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::Duration;

/// Source of local time and the only way the process waits.
pub trait Clock {
    fn now(&self) -> DateTime<Tz>;
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Tz> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Wall clock in the configured timezone.
pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;

    /// Clock that advances only when slept on.
    pub struct FakeClock {
        now: RefCell<DateTime<Tz>>,
        pub sleeps: RefCell<Vec<Duration>>,
    }

    impl FakeClock {
        pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Self {
            let now = chrono_tz::Europe::Amsterdam
                .with_ymd_and_hms(year, month, day, hour, minute, second)
                .unwrap();
            Self {
                now: RefCell::new(now),
                sleeps: RefCell::new(Vec::new()),
            }
        }

        pub fn slept(&self) -> Vec<Duration> {
            self.sleeps.borrow().clone()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Tz> {
            self.now.borrow().clone()
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
            let step = chrono::Duration::from_std(duration).unwrap();
            let advanced = self.now.borrow().clone() + step;
            *self.now.borrow_mut() = advanced;
        }
    }

    #[test]
    fn fake_clock_advances_on_sleep() {
        let clock = FakeClock::at(2024, 6, 1, 12, 0, 0);
        clock.sleep(Duration::from_secs(90));
        assert_eq!(clock.now().format("%H:%M:%S").to_string(), "12:01:30");
        assert_eq!(clock.slept(), vec![Duration::from_secs(90)]);
    }

    #[test]
    fn system_clock_uses_timezone() {
        let clock = SystemClock::new(chrono_tz::Asia::Tokyo);
        assert_eq!(clock.now().timezone(), chrono_tz::Asia::Tokyo);
    }
}
