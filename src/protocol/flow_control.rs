//! SENDME flow control
//!
//! Delivery-window credit scheme applied at both circuit and stream
//! granularity. A counter starts at the configured window size and drops by
//! one for every delivered data-bearing cell; once it falls to
//! `window - increment` a SENDME is owed to the remote sender and the
//! counter is restored by `increment`. The scheme never blocks sending —
//! it is purely a credit signal back to the peer.

/// Delivery-window counter shared by circuit- and stream-level flow
/// control; only the window/increment sizes differ.
#[derive(Debug, Clone)]
pub struct DeliveryWindow {
    window: u32,
    increment: u32,
    counter: u32,
}

impl DeliveryWindow {
    pub fn new(window: u32, increment: u32) -> Self {
        Self {
            window,
            increment,
            counter: window,
        }
    }

    /// Record one delivered data-bearing cell.
    ///
    /// Returns `true` when a SENDME is now owed; the counter has already
    /// been restored by the increment in that case.
    pub fn deliver(&mut self) -> bool {
        self.counter = self.counter.saturating_sub(1);
        if self.counter <= self.window - self.increment {
            self.counter += self.increment;
            return true;
        }
        false
    }

    /// Remaining credit before the next SENDME is owed
    pub fn remaining(&self) -> u32 {
        self.counter - (self.window - self.increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendme_cadence() {
        let mut window = DeliveryWindow::new(1000, 100);

        // No SENDME for the first 99 deliveries
        for _ in 0..99 {
            assert!(!window.deliver());
        }
        // The 100th delivery owes one, and the counter is replenished
        assert!(window.deliver());
        assert_eq!(window.remaining(), 100);
    }

    #[test]
    fn test_exactly_one_sendme_per_increment() {
        let mut window = DeliveryWindow::new(1000, 100);
        let sendmes = (0..350).filter(|_| window.deliver()).count();
        assert_eq!(sendmes, 3);
    }

    #[test]
    fn test_small_window() {
        let mut window = DeliveryWindow::new(10, 2);
        assert_eq!(window.remaining(), 2);

        assert!(!window.deliver());
        assert_eq!(window.remaining(), 1);
        assert!(window.deliver());
        assert_eq!(window.remaining(), 2);

        // Cadence holds over a longer run
        let sendmes = (0..8).filter(|_| window.deliver()).count();
        assert_eq!(sendmes, 4);
    }

    #[test]
    fn test_stream_sized_window() {
        let mut window = DeliveryWindow::new(500, 50);
        let sendmes = (0..500).filter(|_| window.deliver()).count();
        assert_eq!(sendmes, 10);
        assert_eq!(window.remaining(), 50);
    }
}
