//! # Commit Worker
//!
//! A dedicated thread promotes the in-memory batch to disk. Either the
//! whole batch is visible after a crash or none of it:
//!
//! 1. Under the lock: swap `p1` into `p0`, take the pending data buffer
//!    (it stays visible through `State::flushing`), copy the dirty bucket
//!    set into owned blocks, and capture the size watermarks.
//! 2. **Log phase** - journal the on-disk pre-image of every bucket about
//!    to be overwritten, then the log header with the watermarks; sync.
//!    Runs even when no bucket has a pre-image so recovery always knows
//!    where to truncate.
//! 3. **Data phase** - append the batch's records and spills; sync.
//! 4. **Key phase** - write each dirty bucket to its slot, refresh the
//!    header's geometry; sync.
//! 5. **Truncate phase** - truncate the log to zero and sync. This is the
//!    atomic commit point.
//! 6. Under the lock: advance the watermarks, drop the flush buffer, clear
//!    `p0`; wake back-pressured inserts.
//!
//! A crash before step 5 leaves a non-empty log and `recover` restores the
//! pre-commit state; a crash after it leaves the database post-commit
//! consistent. The worker also drives the arenas' once-per-second retuning
//! while it holds the lock. A failed round parks its error in the sticky
//! slot and stops the worker; every later mutation reports it.

use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::config::{COMMIT_BUCKET_TRIGGER, COMMIT_DATA_TRIGGER, COMMIT_INTERVAL};
use crate::storage::file;
use crate::storage::headers::{self, KeyHeader, LogHeader, LOG_HEADER_SIZE};

use super::Shared;

pub(super) fn run(shared: Arc<Shared>) {
    loop {
        {
            let mut s = shared.state.lock();
            if s.stop {
                break;
            }
            let due = s.pending.len() >= COMMIT_DATA_TRIGGER || s.p1.len() >= COMMIT_BUCKET_TRIGGER;
            if !due {
                let _ = shared.work.wait_for(&mut s, COMMIT_INTERVAL);
            }
            s.p0.periodic_activity();
            s.p1.periodic_activity();
            if s.stop {
                break;
            }
            if !s.has_work() {
                continue;
            }
        }
        if let Err(e) = commit_round(&shared) {
            let mut s = shared.state.lock();
            if s.commit_err.is_none() {
                s.commit_err = Some(format!("{e:#}"));
            }
            drop(s);
            shared.done.notify_all();
            tracing::debug!(error = %e, "commit worker stopping after failed round");
            break;
        }
    }
}

/// Runs one full commit. Called by the worker thread and synchronously
/// from `close`. A round with nothing to do is a no-op.
pub(super) fn commit_round(shared: &Shared) -> Result<()> {
    // snapshot under the lock
    let (dirty, snapshot, dat_size_before, disk_buckets_before, buckets_after, modulus_after) = {
        let mut s = shared.state.lock();
        if !s.has_work() {
            drop(s);
            shared.done.notify_all();
            return Ok(());
        }
        debug_assert!(s.flushing.is_none(), "overlapping commit rounds");
        let s = &mut *s;
        std::mem::swap(&mut s.p0, &mut s.p1);
        let snapshot = Arc::new(std::mem::take(&mut s.pending));
        s.flushing = Some(Arc::clone(&snapshot));
        let mut dirty: Vec<(u64, Vec<u8>)> =
            s.p0.iter().map(|(index, block)| (index, block.to_vec())).collect();
        dirty.sort_unstable_by_key(|&(index, _)| index);
        (
            dirty,
            snapshot,
            s.dat_size,
            s.disk_buckets,
            s.buckets,
            s.modulus,
        )
    };

    let key_size_before = shared.bucket_offset(disk_buckets_before);
    let preimages: SmallVec<[u64; 16]> = dirty
        .iter()
        .map(|&(index, _)| index)
        .filter(|&index| index < disk_buckets_before)
        .collect();

    tracing::debug!(
        buckets = dirty.len(),
        preimages = preimages.len(),
        bytes = snapshot.len(),
        "commit round"
    );

    let result = write_phases(
        shared,
        &dirty,
        &snapshot,
        &preimages,
        dat_size_before,
        key_size_before,
        buckets_after,
        modulus_after,
    );

    {
        let mut s = shared.state.lock();
        if result.is_ok() {
            s.dat_size += snapshot.len() as u64;
            s.disk_buckets = buckets_after;
            s.flushing = None;
            s.p0.clear();
            if dirty.len() >= COMMIT_BUCKET_TRIGGER {
                // an unusually fat round; hand the slabs back rather than
                // holding peak memory forever
                s.p0.shrink_to_fit();
            }
        }
        // on failure p0 and the flush buffer stay visible so fetches keep
        // working against a coherent in-memory picture
    }
    shared.done.notify_all();
    result
}

#[allow(clippy::too_many_arguments)]
fn write_phases(
    shared: &Shared,
    dirty: &[(u64, Vec<u8>)],
    snapshot: &[u8],
    preimages: &[u64],
    dat_size_before: u64,
    key_size_before: u64,
    buckets_after: u64,
    modulus_after: u64,
) -> Result<()> {
    let block_size = shared.info.block_size;

    // log phase: records first, header last, one sync. A torn log without
    // its header means no later phase started and recovery is a no-op.
    let mut log_buf =
        Vec::with_capacity(preimages.len() * headers::log_record_size(block_size));
    let mut preimage = vec![0u8; block_size];
    for &index in preimages {
        file::read_at(&shared.kf, shared.bucket_offset(index), &mut preimage)?;
        headers::append_log_record(&mut log_buf, index, &preimage);
    }
    file::write_at(&shared.lf, LOG_HEADER_SIZE as u64, &log_buf)?;
    let key_header = current_key_header(shared, buckets_after, modulus_after);
    let log_header = LogHeader::new(&key_header, key_size_before, dat_size_before);
    file::write_at(&shared.lf, 0, log_header.as_bytes())?;
    file::sync(&shared.lf)?;

    // data phase
    if !snapshot.is_empty() {
        file::write_at(&shared.df, dat_size_before, snapshot)?;
        file::sync(&shared.df)?;
    }

    // key phase
    for (index, block) in dirty {
        file::write_at(&shared.kf, shared.bucket_offset(*index), block)?;
    }
    file::write_at(&shared.kf, 0, key_header.as_bytes())?;
    file::sync(&shared.kf)?;

    // truncate phase: the atomic commit point
    file::truncate(&shared.lf, 0)?;
    file::sync(&shared.lf)?;
    Ok(())
}

/// Rebuilds the key header from the store's immutable facts plus the
/// current geometry.
fn current_key_header(shared: &Shared, buckets: u64, modulus: u64) -> KeyHeader {
    let info = &shared.info;
    KeyHeader::new(
        info.uid,
        info.appnum,
        info.key_size,
        info.salt,
        info.hash_kind,
        info.block_size,
        info.load_factor,
        buckets,
        modulus,
    )
}
