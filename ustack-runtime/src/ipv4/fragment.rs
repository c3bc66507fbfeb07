use crate::error::{Error, Result};
use ustack_packets::{Ipv4Header, IPV4_MAX_PACKET_LEN};

/// Builds the wire packets carrying `payload` under `header` on a link of `mtu` bytes.
///
/// A datagram that fits goes out whole. Otherwise the payload is cut into the largest blocks of
/// a multiple of 8 bytes that fit beside the header; every fragment but the last has more
/// fragments set and each carries its offset in 8 byte units. Every packet gets its own checksum.
pub fn fragment(header: &Ipv4Header, payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>> {
    let header_len = header.header_len();
    let size = header_len + payload.len();
    if size > IPV4_MAX_PACKET_LEN {
        return Err(Error::PacketTooBig { size, mtu });
    }
    if size <= mtu {
        return Ok(vec![header.clone().encap(payload)]);
    }
    if header.dont_fragment {
        return Err(Error::PacketTooBig { size, mtu });
    }

    let block = mtu.saturating_sub(header_len) / 8 * 8;
    if block == 0 {
        return Err(Error::PacketTooBig { size, mtu });
    }

    let count = (payload.len() + block - 1) / block;
    let packets = payload
        .chunks(block)
        .enumerate()
        .map(|(i, chunk)| {
            let mut piece = header.clone();
            piece.more_fragments = i + 1 < count;
            piece.fragment_offset = (i * block / 8) as u16;
            piece.encap(chunk)
        })
        .collect();
    Ok(packets)
}
