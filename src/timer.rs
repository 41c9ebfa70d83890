use std::ops::Mul;
use std::time::Duration;

/// Retransmission timeout that doubles on every attempt.
///
/// There is no jitter. With a start of T and N retries the flight is resent
/// after T, 2T, .. 2^(N-1)T, and the timeout after the last resend (2^N T)
/// is the one that gives up.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    retries: usize,
    rto: Duration,
    left: usize,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, retries: usize) -> Self {
        Self {
            retries,
            rto: start_rto,
            left: retries,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Resends done so far.
    pub fn attempts(&self) -> usize {
        self.retries - self.left
    }

    pub fn attempt(&mut self) {
        let (n, overflow) = self.left.overflowing_sub(1);

        if overflow {
            return;
        }

        self.left = n;
        self.rto = self.rto.mul(2);
    }

    pub fn can_retry(&self) -> bool {
        self.left > 0
    }
}
