/// Sliding replay window for DTLS record sequence numbers of one read epoch.
///
/// Maintains the latest accepted sequence number and a 64-bit bitmap of the
/// last 64 seen sequence numbers to reject duplicates and old records.
///
/// The check and the update are separate: a record is first checked with
/// [`is_processable`](Self::is_processable), and only marked read once it
/// authenticated. A forged record can therefore never advance the window.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    epoch: u16,
    max_seq: Option<u64>,
    window: u64,
}

impl ReplayWindow {
    pub fn new(epoch: u16) -> Self {
        ReplayWindow {
            epoch,
            ..Default::default()
        }
    }

    /// Whether a record with this epoch and sequence number has not been seen
    /// and is not too old.
    pub fn is_processable(&self, epoch: u16, seqno: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        let Some(max_seq) = self.max_seq else {
            return true;
        };
        if seqno > max_seq {
            return true;
        }
        let offset = max_seq - seqno;
        if offset >= 64 {
            return false; // too old
        }
        self.window & (1u64 << offset) == 0
    }

    /// Record `seqno` as received.
    pub fn mark_read(&mut self, epoch: u16, seqno: u64) {
        if epoch != self.epoch {
            return;
        }
        match self.max_seq {
            Some(max_seq) if seqno <= max_seq => {
                let offset = max_seq - seqno;
                if offset < 64 {
                    self.window |= 1u64 << offset;
                }
            }
            Some(max_seq) => {
                let delta = seqno - max_seq;
                self.window = if delta >= 64 { 0 } else { self.window << delta };
                self.window |= 1; // mark newest as seen
                self.max_seq = Some(seqno);
            }
            None => {
                self.window = 1;
                self.max_seq = Some(seqno);
            }
        }
    }
}
