//! Tag codec for message matching.
//!
//! A 64-bit tag carries the io-message marker bit, a connection id, and a
//! sequence number. Senders use the remote side's connection id so the
//! receiver can route by its own local id; data receives match the full
//! tag exactly, while the single io-message receive matches only the
//! marker bit and decodes the sender's connection id afterwards.

/// Marker bit and match mask for in-band io messages.
pub const IOMSG_TAG: u64 = 1 << 63;

/// Mask for exact-match data receives.
pub const DATA_TAG_MASK: u64 = u64::MAX;

/// Tag for a data message on connection `conn_id` with sequence number `sn`.
#[inline]
pub fn data_tag(conn_id: u32, sn: u32) -> u64 {
    ((conn_id as u64) << 32) | sn as u64
}

/// Tag for an io message on connection `conn_id` with sequence number `sn`.
#[inline]
pub fn iomsg_tag(conn_id: u32, sn: u32) -> u64 {
    IOMSG_TAG | data_tag(conn_id, sn)
}

/// Split a data tag back into `(conn_id, sn)`.
#[inline]
pub fn decode_data_tag(tag: u64) -> (u32, u32) {
    ((tag >> 32) as u32, tag as u32)
}

/// Connection id of the sender of an io message, from the received
/// sender tag.
#[inline]
pub fn iomsg_sender(sender_tag: u64) -> u32 {
    ((sender_tag & !IOMSG_TAG) >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_tag_round_trip() {
        for &(conn_id, sn) in &[
            (0u32, 0u32),
            (1, 0),
            (0, 1),
            (7, 42),
            (0x8000_0000, 5),
            (u32::MAX, u32::MAX),
        ] {
            assert_eq!(decode_data_tag(data_tag(conn_id, sn)), (conn_id, sn));
        }
    }

    #[test]
    fn test_iomsg_tag_carries_marker() {
        let tag = iomsg_tag(3, 9);
        assert_ne!(tag & IOMSG_TAG, 0);
        assert_eq!(data_tag(3, 9) & IOMSG_TAG, 0);
    }

    #[test]
    fn test_iomsg_sender_decoding() {
        assert_eq!(iomsg_sender(iomsg_tag(17, 0)), 17);
        assert_eq!(iomsg_sender(iomsg_tag(17, 12345)), 17);
        // The marker bit must be stripped before the shift.
        assert_eq!(iomsg_sender(iomsg_tag(1, 0)), 1);
    }

    #[test]
    fn test_iomsg_never_matches_data_receive() {
        // A data receive matches with a full mask; an io message differs
        // in the marker bit even for the same conn id and sequence number.
        let data = data_tag(5, 1);
        let iomsg = iomsg_tag(5, 1);
        assert_ne!(data & DATA_TAG_MASK, iomsg & DATA_TAG_MASK);
        // The io-message receive matches only messages with the marker.
        assert_eq!(iomsg & IOMSG_TAG, IOMSG_TAG & IOMSG_TAG);
        assert_ne!(data & IOMSG_TAG, IOMSG_TAG);
    }
}
