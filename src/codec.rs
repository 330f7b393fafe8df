//! # BLOB Encoding for Collection Columns
//!
//! Most record fields map to plain SQLite columns. Two do not: the set of
//! anonymous groups in a [`crate::model::Usage`] and the channel allocation
//! map in a channel-0 [`crate::model::Subscription`]. They are stored as
//! little-endian BLOBs followed by an XXH3 checksum.
//!
//! ## Formats
//!
//! ```text
//! group set:    [count u32] ([member u64][name_len u32][name bytes])*  [xxh3 u64]
//! allocations:  [count u32] ([subscriber u64][n u32][channel u32]*)*   [xxh3 u64]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::{ChannelId, SubscriberGroupId, SubscriberId};

// =============================================================================
// Group Sets
// =============================================================================

/// Encodes a set of subscriber groups.
pub fn encode_group_set(groups: &BTreeSet<SubscriberGroupId>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(groups.len() as u32).to_le_bytes());
    for group in groups {
        out.extend_from_slice(&group.member().to_le_bytes());
        let name = group.name().as_bytes();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
    }
    seal(out)
}

/// Decodes a set written by [`encode_group_set`].
pub fn decode_group_set(data: &[u8]) -> Result<BTreeSet<SubscriberGroupId>> {
    let mut reader = Reader::new(unseal(data)?);
    let count = reader.u32()?;
    let mut groups = BTreeSet::new();
    for _ in 0..count {
        let member = reader.u64()?;
        let len = reader.u32()? as usize;
        let name = std::str::from_utf8(reader.bytes(len)?)
            .map_err(|e| Error::Corrupt(format!("group name is not utf-8: {e}")))?;
        groups.insert(SubscriberGroupId::from_parts(name, member));
    }
    reader.finish()?;
    Ok(groups)
}

// =============================================================================
// Channel Allocations
// =============================================================================

/// Encodes a subscriber to channels allocation.
pub fn encode_allocations(allocations: &BTreeMap<SubscriberId, Vec<ChannelId>>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(allocations.len() as u32).to_le_bytes());
    for (subscriber, channels) in allocations {
        out.extend_from_slice(&subscriber.as_raw().to_le_bytes());
        out.extend_from_slice(&(channels.len() as u32).to_le_bytes());
        for channel in channels {
            out.extend_from_slice(&channel.as_raw().to_le_bytes());
        }
    }
    seal(out)
}

/// Decodes an allocation written by [`encode_allocations`].
pub fn decode_allocations(data: &[u8]) -> Result<BTreeMap<SubscriberId, Vec<ChannelId>>> {
    let mut reader = Reader::new(unseal(data)?);
    let count = reader.u32()?;
    let mut allocations = BTreeMap::new();
    for _ in 0..count {
        let subscriber = SubscriberId::from_raw(reader.u64()?);
        let n = reader.u32()?;
        let mut channels = Vec::with_capacity(n as usize);
        for _ in 0..n {
            channels.push(ChannelId::from_raw(reader.u32()?));
        }
        allocations.insert(subscriber, channels);
    }
    reader.finish()?;
    Ok(allocations)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes the XXH3-64 checksum used as the BLOB trailer.
pub fn compute_checksum(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let checksum = compute_checksum(&body);
    body.extend_from_slice(&checksum.to_le_bytes());
    body
}

fn unseal(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 8 {
        return Err(Error::Corrupt(format!("blob too short ({} bytes)", data.len())));
    }
    let (body, trailer) = data.split_at(data.len() - 8);
    let mut expected = [0u8; 8];
    expected.copy_from_slice(trailer);
    if compute_checksum(body) != u64::from_le_bytes(expected) {
        return Err(Error::Corrupt("blob checksum mismatch".into()));
    }
    Ok(body)
}

/// Cursor over a little-endian byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(Error::Corrupt(format!(
                "unexpected end of blob at {} (need {} more bytes)",
                self.pos, len
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(Error::Corrupt(format!(
                "{} trailing bytes in blob",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_set_preserves_kinds() {
        let mut groups = BTreeSet::new();
        groups.insert(SubscriberGroupId::durable("audit"));
        groups.insert(SubscriberGroupId::anonymous(42));

        let decoded = decode_group_set(&encode_group_set(&groups)).unwrap();
        assert_eq!(decoded, groups);
        assert_eq!(decoded.iter().filter(|g| g.is_anonymous()).count(), 1);
    }

    #[test]
    fn test_allocations_keep_channel_order() {
        let mut allocations = BTreeMap::new();
        allocations.insert(
            SubscriberId::from_raw(7),
            vec![ChannelId::from_raw(3), ChannelId::from_raw(1)],
        );
        allocations.insert(SubscriberId::from_raw(9), vec![]);

        let decoded = decode_allocations(&encode_allocations(&allocations)).unwrap();
        assert_eq!(decoded[&SubscriberId::from_raw(7)][0], ChannelId::from_raw(3));
        assert!(decoded[&SubscriberId::from_raw(9)].is_empty());
    }

    #[test]
    fn test_corrupted_blob_is_rejected() {
        let mut blob = encode_group_set(&BTreeSet::from([SubscriberGroupId::durable("x")]));
        blob[5] ^= 0xff;
        assert!(matches!(decode_group_set(&blob), Err(Error::Corrupt(_))));
        assert!(matches!(decode_allocations(&[1, 2]), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_current_time_is_recent() {
        // 2020-01-01 in ms
        assert!(current_time_ms() > 1_577_836_800_000);
    }
}
