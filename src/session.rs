use std::fmt;
use std::net::SocketAddr;

use zeroize::Zeroizing;

use crate::context::EndpointContext;
use crate::crypto::{Aad, RecordCipher};
use crate::message::{CipherSuite, ContentType, MaxFragmentLength, ProtocolVersion, Record};
use crate::message::{SessionId, MAX_PLAINTEXT_FRAGMENT_LENGTH};
use crate::window::ReplayWindow;
use crate::Error;

/// IPv4 (20) + UDP (8)
const IP_UDP_HEADER_LEN: usize = 28;

/// Handshake header (12) + record header (13) + UDP (8) + IPv4 (20).
///
/// Subtracted from the MTU to get the fragment length usable before any
/// session exists.
pub const HEADER_LENGTH: usize = 53;

const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

/// The resumable part of a session.
///
/// Carries what an abbreviated handshake needs to derive fresh keys:
/// session id, cipher suite and master secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionTicket {
    session_id: SessionId,
    cipher_suite: CipherSuite,
    master_secret: Zeroizing<[u8; 48]>,
    max_fragment_length: Option<MaxFragmentLength>,
}

impl SessionTicket {
    pub fn new(
        session_id: SessionId,
        cipher_suite: CipherSuite,
        master_secret: [u8; 48],
        max_fragment_length: Option<MaxFragmentLength>,
    ) -> Self {
        SessionTicket {
            session_id,
            cipher_suite,
            master_secret: Zeroizing::new(master_secret),
            max_fragment_length,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn max_fragment_length(&self) -> Option<MaxFragmentLength> {
        self.max_fragment_length
    }

    pub(crate) fn master_secret(&self) -> &[u8; 48] {
        &self.master_secret
    }
}

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTicket")
            .field("session_id", &self.session_id)
            .field("cipher_suite", &self.cipher_suite)
            .finish_non_exhaustive()
    }
}

/// Negotiated security state with one peer.
///
/// Epochs only move forward. The write side counts sequence numbers for
/// epoch 0 separately, so handshake records of epoch 0 can still be
/// retransmitted after the switch to epoch 1.
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    cipher_suite: Option<CipherSuite>,
    master_secret: Option<Zeroizing<[u8; 48]>>,
    max_fragment_length: Option<MaxFragmentLength>,
    expansion: usize,

    read_epoch: u16,
    write_epoch: u16,
    pending_read: Option<Box<dyn RecordCipher>>,
    pending_write: Option<Box<dyn RecordCipher>>,
    read_cipher: Option<Box<dyn RecordCipher>>,
    write_cipher: Option<Box<dyn RecordCipher>>,
    replay: ReplayWindow,

    sequence_epoch_0: u64,
    sequence_epoch_n: u64,
}

impl Session {
    /// A fresh session at epoch 0.
    pub fn new(peer: SocketAddr) -> Self {
        Session {
            id: SessionId::EMPTY,
            peer,
            cipher_suite: None,
            master_secret: None,
            max_fragment_length: None,
            expansion: 0,
            read_epoch: 0,
            write_epoch: 0,
            pending_read: None,
            pending_write: None,
            read_cipher: None,
            write_cipher: None,
            replay: ReplayWindow::new(0),
            sequence_epoch_0: 0,
            sequence_epoch_n: 0,
        }
    }

    /// A server session continues the record sequence of the ClientHello
    /// that created it, since the HelloVerifyRequest reused that number.
    pub fn with_initial_sequence(peer: SocketAddr, initial_sequence: u64) -> Self {
        let mut session = Session::new(peer);
        session.sequence_epoch_0 = initial_sequence;
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn set_id(&mut self, id: SessionId) {
        self.id = id;
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher_suite
    }

    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    pub fn write_epoch(&self) -> u16 {
        self.write_epoch
    }

    pub fn set_max_fragment_length(&mut self, mfl: Option<MaxFragmentLength>) {
        self.max_fragment_length = mfl;
    }

    pub(crate) fn set_master_secret(&mut self, suite: CipherSuite, master_secret: &[u8; 48]) {
        self.cipher_suite = Some(suite);
        self.master_secret = Some(Zeroizing::new(*master_secret));
    }

    /// Install the ciphers of the next epoch. They take effect on
    /// [`activate_read`](Self::activate_read) and
    /// [`activate_write`](Self::activate_write).
    pub(crate) fn install_ciphers(
        &mut self,
        read: Box<dyn RecordCipher>,
        write: Box<dyn RecordCipher>,
        expansion: usize,
    ) {
        self.pending_read = Some(read);
        self.pending_write = Some(write);
        self.expansion = expansion;
    }

    pub fn has_pending_read(&self) -> bool {
        self.pending_read.is_some()
    }

    /// Switch the read side to the next epoch (on ChangeCipherSpec received).
    pub(crate) fn activate_read(&mut self) -> Result<(), Error> {
        let cipher = self
            .pending_read
            .take()
            .ok_or_else(|| Error::Crypto("No pending read cipher".into()))?;
        self.read_cipher = Some(cipher);
        self.read_epoch += 1;
        self.replay = ReplayWindow::new(self.read_epoch);
        Ok(())
    }

    /// Switch the write side to the next epoch (after ChangeCipherSpec sent).
    pub(crate) fn activate_write(&mut self) -> Result<(), Error> {
        let cipher = self
            .pending_write
            .take()
            .ok_or_else(|| Error::Crypto("No pending write cipher".into()))?;
        self.write_cipher = Some(cipher);
        self.write_epoch += 1;
        self.sequence_epoch_n = 0;
        Ok(())
    }

    /// Replay check, without updating the window.
    pub fn is_record_processable(&self, epoch: u16, sequence_number: u64) -> bool {
        self.replay.is_processable(epoch, sequence_number)
    }

    /// Update the replay window, once a record authenticated.
    pub fn mark_record_as_read(&mut self, epoch: u16, sequence_number: u64) {
        self.replay.mark_read(epoch, sequence_number);
    }

    fn next_sequence_number(&mut self, epoch: u16) -> Result<u64, Error> {
        let counter = if epoch == 0 {
            &mut self.sequence_epoch_0
        } else {
            &mut self.sequence_epoch_n
        };
        if *counter > MAX_SEQUENCE_NUMBER {
            return Err(Error::Crypto("Sequence number exhausted".into()));
        }
        let seq = *counter;
        *counter += 1;
        Ok(seq)
    }

    /// Build a record for `payload`, encrypted unless `epoch` is 0.
    ///
    /// Each call consumes a sequence number, so a retransmitted record
    /// never repeats the number of the original.
    pub fn protect(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        payload: &[u8],
    ) -> Result<Record, Error> {
        if epoch != 0 && epoch != self.write_epoch {
            return Err(Error::Crypto(format!("No write cipher for epoch {}", epoch)));
        }
        let sequence_number = self.next_sequence_number(epoch)?;

        let fragment = if epoch == 0 {
            payload.to_vec()
        } else {
            let cipher = self
                .write_cipher
                .as_ref()
                .ok_or_else(|| Error::Crypto("No write cipher".into()))?;
            let aad = Aad {
                content_type,
                epoch,
                sequence_number,
            };
            cipher.seal(&aad, payload).map_err(Error::Crypto)?
        };

        Ok(Record {
            content_type,
            version: ProtocolVersion::DTLS1_2,
            epoch,
            sequence_number,
            fragment,
        })
    }

    /// Plaintext of `record`, decrypted under the current read epoch.
    pub fn unprotect(&self, record: &Record) -> Result<Vec<u8>, Error> {
        if record.epoch == 0 {
            if self.read_epoch != 0 && record.content_type == ContentType::ApplicationData {
                return Err(Error::Crypto("Plaintext application data".into()));
            }
            return Ok(record.fragment.clone());
        }
        if record.epoch != self.read_epoch {
            return Err(Error::Crypto(format!(
                "No read cipher for epoch {}",
                record.epoch
            )));
        }
        let cipher = self
            .read_cipher
            .as_ref()
            .ok_or_else(|| Error::Crypto("No read cipher".into()))?;
        let aad = Aad {
            content_type: record.content_type,
            epoch: record.epoch,
            sequence_number: record.sequence_number,
        };
        cipher.open(&aad, &record.fragment).map_err(Error::Crypto)
    }

    /// The resumable state, once keys are negotiated.
    pub fn ticket(&self) -> Option<SessionTicket> {
        let suite = self.cipher_suite?;
        let master = self.master_secret.as_ref()?;
        if self.id.is_empty() {
            return None;
        }
        Some(SessionTicket::new(
            self.id,
            suite,
            **master,
            self.max_fragment_length,
        ))
    }

    pub fn context(&self) -> EndpointContext {
        EndpointContext::with_session(self.peer, self.id, self.read_epoch, self.cipher_suite)
    }

    /// Negotiated plaintext limit, or 2^14.
    pub fn max_fragment_length(&self) -> usize {
        self.max_fragment_length
            .map(|mfl| mfl.length())
            .unwrap_or(MAX_PLAINTEXT_FRAGMENT_LENGTH)
    }

    /// Largest datagram to send to this peer.
    ///
    /// Bounded by the MTU, and by what the peer can receive when a maximum
    /// fragment length was negotiated.
    pub fn max_datagram_size(&self, mtu: usize) -> usize {
        let by_mtu = mtu.saturating_sub(IP_UDP_HEADER_LEN);
        match self.max_fragment_length {
            Some(mfl) => by_mtu.min(mfl.length() + self.expansion + HEADER_LENGTH - IP_UDP_HEADER_LEN),
            None => by_mtu,
        }
    }

    /// Largest application payload that fits a single datagram.
    pub fn max_application_fragment(&self, mtu: usize) -> usize {
        let by_mtu = mtu.saturating_sub(HEADER_LENGTH + self.expansion);
        by_mtu.min(self.max_fragment_length())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("cipher_suite", &self.cipher_suite)
            .field("read_epoch", &self.read_epoch)
            .field("write_epoch", &self.write_epoch)
            .finish_non_exhaustive()
    }
}
