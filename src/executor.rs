//! The parallel Pass 2 executor.
//!
//! The calling thread owns the [`BatchProducer`] and cuts batches; workers of a dedicated
//! rayon pool decode them and feed the handler. At most two batches per worker are in
//! flight, which bounds the memory held by copied records. The first failure on any worker
//! is captured, raises the abort flag and is returned once the scope has joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::error::{HprofError, Result};
use crate::handler::Pass2Handler;
use crate::hprof::SubRecordTag;
use crate::io::PositionInput;
use crate::monitor::{BuildHook, ProgressMonitor};
use crate::parser::decode::{DecodeContext, decode_object};
use crate::parser::pass2::{Batch, BatchProducer};

/// Counters of one Pass 2 run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pass2Stats {
    /// Batches decoded.
    pub batches: u64,
    /// Object records decoded.
    pub records: u64,
    /// Worker threads used; 1 for sequential runs.
    pub threads: usize,
}

/// Context shared among all worker threads.
struct ExecutionContext<'a> {
    handler: &'a Pass2Handler,
    decode: DecodeContext<'a>,
    hooks: &'a [Arc<dyn BuildHook>],
    monitor: &'a dyn ProgressMonitor,
    abort_flag: AtomicBool,
    error_capture: Mutex<Option<HprofError>>,
    in_flight: Mutex<usize>,
    slot_freed: Condvar,
    batches: AtomicU64,
    records: AtomicU64,
}

impl ExecutionContext<'_> {
    fn signal_error(&self, err: HprofError) {
        let mut guard = self.error_capture.lock();
        if guard.is_none() {
            *guard = Some(err);
            self.abort_flag.store(true, Ordering::SeqCst);
        }
    }

    fn should_abort(&self) -> bool {
        self.abort_flag.load(Ordering::Relaxed)
    }

    fn take_error(&self) -> Option<HprofError> {
        self.error_capture.lock().take()
    }

    /// Blocks until fewer than `limit` batches are in flight, then claims a slot.
    fn acquire_slot(&self, limit: usize) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= limit {
            self.slot_freed.wait(&mut in_flight);
        }
        *in_flight += 1;
    }

    fn release_slot(&self) {
        *self.in_flight.lock() -= 1;
        self.slot_freed.notify_one();
    }

    fn process_batch(&self, batch: &Batch) -> Result<()> {
        let warn = |message: String| self.handler.warn(message);
        for mut record in batch.records() {
            if self.should_abort() {
                return Ok(());
            }
            let position = record.position();
            let tag = SubRecordTag::decode(record.read_u8()?, position)?;
            let object = decode_object(&mut record, tag, position, &self.decode, &warn)?;
            for hook in self.hooks {
                hook.on_object(&object);
            }
            self.handler.add_object(&object)?;
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.monitor.advance(batch.covered());
        Ok(())
    }
}

/// Runs Pass 2 over every batch of `producer`.
///
/// With `threads <= 1` the batches are decoded on the calling thread.
pub fn execute_pass2<I: PositionInput>(
    producer: &mut BatchProducer<'_, I>,
    handler: &Pass2Handler,
    decode: DecodeContext<'_>,
    hooks: &[Arc<dyn BuildHook>],
    monitor: &dyn ProgressMonitor,
    threads: usize,
) -> Result<Pass2Stats> {
    let ctx = ExecutionContext {
        handler,
        decode,
        hooks,
        monitor,
        abort_flag: AtomicBool::new(false),
        error_capture: Mutex::new(None),
        in_flight: Mutex::new(0),
        slot_freed: Condvar::new(),
        batches: AtomicU64::new(0),
        records: AtomicU64::new(0),
    };

    if threads <= 1 {
        info!("pass 2: sequential decode");
        for batch in producer.by_ref() {
            ctx.process_batch(&batch?)?;
        }
        return Ok(Pass2Stats {
            batches: ctx.batches.load(Ordering::Relaxed),
            records: ctx.records.load(Ordering::Relaxed),
            threads: 1,
        });
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("hprof-pass2-{i}"))
        .build()
        .map_err(|e| HprofError::Internal(format!("cannot start worker pool: {e}")))?;
    info!("pass 2: decoding on {threads} workers");
    let limit = threads * 2;

    pool.in_place_scope(|s| {
        let ctx_ref = &ctx;
        while !ctx_ref.should_abort() {
            ctx_ref.acquire_slot(limit);
            match producer.next_batch() {
                Ok(Some(batch)) => s.spawn(move |_| {
                    if let Err(e) = ctx_ref.process_batch(&batch) {
                        ctx_ref.signal_error(e);
                    }
                    ctx_ref.release_slot();
                }),
                Ok(None) => {
                    ctx_ref.release_slot();
                    break;
                }
                Err(e) => {
                    ctx_ref.release_slot();
                    ctx_ref.signal_error(e);
                }
            }
        }
    });

    if let Some(err) = ctx.take_error() {
        debug!("pass 2 aborted: {err}");
        return Err(err);
    }
    Ok(Pass2Stats {
        batches: ctx.batches.load(Ordering::Relaxed),
        records: ctx.records.load(Ordering::Relaxed),
        threads,
    })
}
