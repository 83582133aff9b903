//! Startup recovery: load the metadata snapshot, then scan segments above
//! it in descending order to reconstruct whatever the snapshot missed.
//!
//! The scan walks potentially many segments, descending, since the snapshot
//! only remembers per-stream tails, not which segments still need replay.

use log::{debug, info, warn};

use crate::metadata::LogMetadata;
use crate::segment_map::SegmentMap;
use crate::Options;

pub fn recover(metadata: &LogMetadata, segment_map: &SegmentMap, opts: &Options) -> std::io::Result<()> {
    let n = opts.records_per_segment.get();

    let (starting_address, tail_segment, highest_loaded) = metadata.with(|m| {
        let highest_loaded = m.stream_tails.values().copied().max();
        (m.starting_address, m.tail_segment, highest_loaded)
    });

    let first_segment = starting_address / n;
    if first_segment > tail_segment {
        debug!("recovery: nothing to scan (starting_address past tail_segment)");
    } else {
        for segment_id in (first_segment..=tail_segment).rev() {
            let handle = match segment_map.get_or_open(segment_id) {
                Ok(h) => h,
                Err(e) => {
                    warn!("recovery: segment {segment_id} could not be opened: {e}, skipping");
                    continue;
                }
            };
            let mut file = handle.file.lock();

            let mut addrs: Vec<u64> = file.addresses().collect();
            addrs.sort_unstable_by(|a, b| b.cmp(a));

            let mut replayed = 0u64;
            for addr in addrs {
                if Some(addr) <= highest_loaded || addr < starting_address {
                    continue;
                }
                match file.read(addr) {
                    Ok(Some(entry)) => {
                        metadata.with(|m| m.record_append(addr, entry.stream_ids.iter().copied()));
                        replayed += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("recovery: segment {segment_id} address {addr} unreadable: {e}");
                    }
                }
            }
            debug!("recovery: segment {segment_id} replayed {replayed} addresses");
            drop(file);
        }
    }

    segment_map.evict_all();

    metadata.with(|m| {
        let boundary = starting_address.checked_sub(1);
        if m.global_tail < boundary {
            let seg = starting_address / n;
            info!("recovery: trim mark beyond any write, advancing tail_segment to {seg}");
            m.tail_segment = m.tail_segment.max(seg);
        }
    });

    Ok(())
}
