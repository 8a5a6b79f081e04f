//! Dump strategies
//!
//! A run serializes scanned items with one of two strategies, chosen once
//! from the snapshot mode:
//!
//! | Strategy | Modes | Per item | Trailer |
//! |----------|-------|----------|---------|
//! | `Keys` | KEY | `"<type> <key> <expiry>\n"` | summary line |
//! | `Records` | DATA, CHKPT | ItemLink + one CollectionElement per element | Done record |

use std::io::Write;
use std::time::Instant;

use cachesnap_core::limits::KEY_LINE_OVERHEAD;
use cachesnap_core::{now_secs, Expiry, Item, PrefixFilter, Result, SnapshotMode};
use cachesnap_durability::{LogRecordRef, SnapshotWriter};

use crate::scan::ScannedItem;

/// Mode-specific serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStrategy {
    /// Text key listing
    Keys,
    /// Replayable log records
    Records,
}

/// Per-run dump state
#[derive(Debug)]
pub struct DumpContext {
    prefix: PrefixFilter,
    started: Instant,
    snapped: u64,
    line: Vec<u8>,
}

impl DumpContext {
    /// Fresh context for a run over `prefix`
    pub fn new(prefix: PrefixFilter) -> Self {
        DumpContext {
            prefix,
            started: Instant::now(),
            snapped: 0,
            line: Vec::new(),
        }
    }

    /// Items dumped so far
    pub fn snapped(&self) -> u64 {
        self.snapped
    }
}

impl DumpStrategy {
    /// Strategy for a snapshot mode
    pub fn for_mode(mode: SnapshotMode) -> Self {
        if mode.writes_records() {
            DumpStrategy::Records
        } else {
            DumpStrategy::Keys
        }
    }

    /// Serialize one scan batch.
    ///
    /// Stops at the first failure; items written before it stay counted.
    pub fn dump(
        &self,
        writer: &mut SnapshotWriter<'_>,
        batch: &[ScannedItem],
        ctx: &mut DumpContext,
    ) -> Result<()> {
        match self {
            DumpStrategy::Keys => {
                let now = now_secs();
                for scanned in batch {
                    let item = &scanned.item;
                    writer.ensure_space(item.key.len() + KEY_LINE_OVERHEAD)?;
                    format_key_line(&mut ctx.line, item, now)?;
                    writer.append(&ctx.line)?;
                    ctx.snapped += 1;
                }
            }
            DumpStrategy::Records => {
                for scanned in batch {
                    writer.append_record(LogRecordRef::ItemLink(&scanned.item))?;
                    if scanned.item.is_collection() {
                        for element in &scanned.elements {
                            writer.append_record(LogRecordRef::CollectionElement(element))?;
                        }
                    }
                    ctx.snapped += 1;
                }
            }
        }
        Ok(())
    }

    /// Write the trailer and flush.
    pub fn done(&self, writer: &mut SnapshotWriter<'_>, ctx: &mut DumpContext) -> Result<()> {
        match self {
            DumpStrategy::Keys => {
                ctx.line.clear();
                writeln!(
                    ctx.line,
                    "SNAPSHOT SUMMARY: {{ prefix={}, count={}, elapsed={} }}",
                    ctx.prefix,
                    ctx.snapped,
                    ctx.started.elapsed().as_secs()
                )?;
                writer.append(&ctx.line)?;
            }
            DumpStrategy::Records => {
                writer.append_record(LogRecordRef::Done)?;
            }
        }
        writer.flush()
    }
}

/// `"<type> <key> <expiry>\n"`: expiry is 0 for none, -1 for sticky,
/// otherwise the remaining seconds, at least 1
fn format_key_line(line: &mut Vec<u8>, item: &Item, now: u64) -> Result<()> {
    line.clear();
    line.extend_from_slice(item.item_type.letter().as_bytes());
    line.push(b' ');
    line.extend_from_slice(&item.key);
    match item.expiry {
        Expiry::Never => line.extend_from_slice(b" 0\n"),
        Expiry::Sticky => line.extend_from_slice(b" -1\n"),
        Expiry::At(_) => {
            let remaining = item.expiry.remaining(now).unwrap_or(1);
            writeln!(line, " {}", remaining)?;
        }
    }
    Ok(())
}
