//! Frame assembly: turn a slot's fetched segments back into the encoded
//! frame, recovering erased segments from parity when possible

use bytes::Bytes;

use crate::error::AssembleError;
use crate::fec::ReedSolomon;
use crate::name::PlaybackNo;
use crate::slot::Slot;
use crate::wire::{crc32, FrameHeader, FramePacket};

/// Frame delivery descriptor handed to the downstream consumer
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Producer publish timestamp in microseconds
    pub timestamp_us: u64,
    pub playback_no: PlaybackNo,
    pub frame_prefix: String,
    pub is_key: bool,
}

/// A reconstructed encoded frame
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub header: FrameHeader,
    /// Opaque codec bytes
    pub payload: Bytes,
    /// True when parity segments were needed to rebuild the frame
    pub recovered: bool,
}

/// Reconstruct the encoded frame from a slot.
///
/// All data segments fetched: the contiguous slot buffer is the frame.
/// Some missing but `fetched + parity >= total`: erasure-decode over the
/// zero-padded shard layout and trim to the frame length carried by the
/// parity segments. Anything less is unrecoverable and the caller drops
/// the slot.
pub fn assemble(slot: &Slot) -> Result<AssembledFrame, AssembleError> {
    let total = slot.total_segments().ok_or(AssembleError::Empty)? as usize;
    if total == 0 {
        return Err(AssembleError::Empty);
    }
    let stride = slot.segment_payload_size();
    let fetched = slot.fetched_segments() as usize;
    let parity_fetched = slot.parity_shards().len();

    if fetched >= total {
        let last_size = slot.segment_size(total as u32 - 1).unwrap_or(stride);
        let frame_len = (total - 1) * stride + last_size;
        let packet = Bytes::copy_from_slice(&slot.storage()[..frame_len]);
        verify_crc(slot, &packet)?;
        let (header, payload) = FramePacket::unpack(&packet)?;
        return Ok(AssembledFrame {
            header,
            payload,
            recovered: false,
        });
    }

    if fetched + parity_fetched >= total {
        let parity_total = slot.parity_total().ok_or(AssembleError::NotRecoverable {
            missing: (total - fetched) as u32,
            total: total as u32,
        })? as usize;
        let frame_len = slot.parity_frame_len().ok_or(AssembleError::NotRecoverable {
            missing: (total - fetched) as u32,
            total: total as u32,
        })? as usize;

        let rs = ReedSolomon::new(total, parity_total)?;
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(total + parity_total);
        let fetched_set: std::collections::BTreeSet<u32> = slot.fetched_indices().collect();
        for i in 0..total {
            if fetched_set.contains(&(i as u32)) {
                shards.push(Some(slot.storage()[i * stride..(i + 1) * stride].to_vec()));
            } else {
                shards.push(None);
            }
        }
        for p in 0..parity_total as u32 {
            shards.push(slot.parity_shards().get(&p).map(|b| b.to_vec()));
        }

        rs.reconstruct(&mut shards)?;

        let mut packet = Vec::with_capacity(total * stride);
        for shard in shards.into_iter().take(total) {
            packet.extend_from_slice(&shard.expect("data shards reconstructed"));
        }
        packet.truncate(frame_len);
        let packet = Bytes::from(packet);
        verify_crc(slot, &packet)?;
        let (header, payload) = FramePacket::unpack(&packet)?;
        return Ok(AssembledFrame {
            header,
            payload,
            recovered: true,
        });
    }

    Err(AssembleError::NotRecoverable {
        missing: (total - fetched) as u32,
        total: total as u32,
    })
}

fn verify_crc(slot: &Slot, packet: &[u8]) -> Result<(), AssembleError> {
    if let Some(expected) = slot.crc() {
        let computed = crc32(packet);
        if computed != expected {
            return Err(AssembleError::Wire(
                crate::error::WireError::ChecksumMismatch { expected, computed },
            ));
        }
    }
    Ok(())
}
