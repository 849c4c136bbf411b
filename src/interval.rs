/// Fires at most once per check, once `interval` seconds have elapsed since
/// the last firing. The first check always fires.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    interval: f64,
    last_fire: Option<f64>,
    fire_count: u64,
}

impl IntervalTimer {
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            last_fire: None,
            fire_count: 0,
        }
    }

    pub fn is_due(&self, now: f64) -> bool {
        match self.last_fire {
            Some(last_fire) => now - last_fire >= self.interval,
            None => true,
        }
    }

    /// Records a firing at `now` without checking the interval.
    pub fn mark(&mut self, now: f64) {
        self.last_fire = Some(now);
        self.fire_count += 1;
    }

    pub fn check(&mut self, now: f64) -> bool {
        if self.is_due(now) {
            self.mark(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_fire = None;
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn set_interval(&mut self, interval: f64) {
        self.interval = interval;
    }

    pub fn last_fire(&self) -> Option<f64> {
        self.last_fire
    }

    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_check_fires() {
        let mut timer = IntervalTimer::new(0.1);
        assert!(timer.check(5.0));
        assert_eq!(timer.last_fire(), Some(5.0));
    }

    #[test]
    fn test_fires_once_per_interval() {
        let mut timer = IntervalTimer::new(0.5);

        assert!(timer.check(0.0));
        assert!(!timer.check(0.2));
        assert!(!timer.check(0.49));
        assert!(timer.check(0.5));
        assert!(!timer.check(0.5));
        assert!(timer.check(10.0));
        assert_eq!(timer.fire_count(), 3);
    }

    #[test]
    fn test_mark_moves_last_fire() {
        let mut timer = IntervalTimer::new(1.0);
        assert!(timer.check(0.0));

        timer.mark(0.8);
        assert!(!timer.check(1.2));
        assert!(timer.check(1.8));
    }

    #[test]
    fn test_reset() {
        let mut timer = IntervalTimer::new(1.0);
        timer.check(0.0);
        timer.reset();
        assert!(timer.is_due(0.1));
    }
}
