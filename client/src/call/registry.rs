//! Sparse per-peer call table indexed by peer slot.

use super::state::{Call, CallStateError};
use super::PeerSlot;
use crate::audio::FrameFormat;

/// Highest peer slot + 1 the registry will hold a record for
pub const MAX_PEERS: usize = 4096;

pub struct CallRegistry {
    calls: Vec<Option<Call>>,
    audio_bit_rate: u32,
    format: FrameFormat,
}

impl CallRegistry {
    /// New calls start with `audio_bit_rate` and transmit in `format`.
    pub const fn new(audio_bit_rate: u32, format: FrameFormat) -> Self {
        Self {
            calls: Vec::new(),
            audio_bit_rate,
            format,
        }
    }

    pub fn get(&self, peer: PeerSlot) -> Option<&Call> {
        self.calls.get(peer).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, peer: PeerSlot) -> Option<&mut Call> {
        self.calls.get_mut(peer).and_then(Option::as_mut)
    }

    /// Bit rate a new record starts with.
    pub const fn default_bit_rate(&self) -> u32 {
        self.audio_bit_rate
    }

    /// The record for `peer`, created on first reference.
    pub fn get_or_create(&mut self, peer: PeerSlot) -> Result<&mut Call, CallStateError> {
        if peer >= MAX_PEERS {
            return Err(CallStateError::InvalidPeer(peer));
        }
        if self.calls.len() <= peer {
            self.calls.resize_with(peer + 1, || None);
        }
        let (bit_rate, format) = (self.audio_bit_rate, self.format);
        Ok(self.calls[peer].get_or_insert_with(|| Call::new(bit_rate, format)))
    }

    /// Destroy the record for `peer`; trailing empty slots are released.
    pub fn remove(&mut self, peer: PeerSlot) -> Option<Call> {
        let call = self.calls.get_mut(peer).and_then(Option::take);
        while matches!(self.calls.last(), Some(None)) {
            self.calls.pop();
        }
        call
    }

    /// Slots up to the highest peer referenced.
    pub fn capacity(&self) -> usize {
        self.calls.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerSlot, &Call)> {
        self.calls
            .iter()
            .enumerate()
            .filter_map(|(peer, call)| call.as_ref().map(|c| (peer, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::state::CallStatus;

    #[test]
    fn test_grows_to_highest_peer() {
        let mut registry = CallRegistry::new(64, FrameFormat::default());
        registry.get_or_create(4).unwrap();
        assert_eq!(registry.capacity(), 5);
        assert!(registry.get(2).is_none());
        assert_eq!(registry.get(4).map(Call::status), Some(CallStatus::None));
        assert_eq!(registry.get(4).map(Call::audio_bit_rate), Some(64));
    }

    #[test]
    fn test_get_or_create_keeps_existing_record() {
        let mut registry = CallRegistry::new(64, FrameFormat::default());
        registry.get_or_create(1).unwrap().audio_bit_rate = 32;
        assert_eq!(registry.get_or_create(1).unwrap().audio_bit_rate(), 32);
    }

    #[test]
    fn test_shrinks_only_from_the_tail() {
        let mut registry = CallRegistry::new(64, FrameFormat::default());
        for peer in [0, 3, 7] {
            registry.get_or_create(peer).unwrap();
        }

        assert!(registry.remove(3).is_some());
        assert_eq!(registry.capacity(), 8);

        assert!(registry.remove(7).is_some());
        assert_eq!(registry.capacity(), 1);
        assert_eq!(registry.iter().map(|(p, _)| p).collect::<Vec<_>>(), vec![0]);

        assert!(registry.remove(9).is_none());
        assert!(registry.remove(0).is_some());
        assert_eq!(registry.capacity(), 0);
    }

    #[test]
    fn test_rejects_peers_beyond_limit() {
        let mut registry = CallRegistry::new(64, FrameFormat::default());
        assert!(registry.get_or_create(MAX_PEERS - 1).is_ok());
        for peer in [MAX_PEERS, usize::MAX] {
            assert_eq!(
                registry.get_or_create(peer).map(|_| ()),
                Err(CallStateError::InvalidPeer(peer))
            );
        }
        assert_eq!(registry.capacity(), MAX_PEERS);
    }
}
