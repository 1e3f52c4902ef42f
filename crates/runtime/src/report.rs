//! Resource Report
//!
//! End-of-run summary of what a Process consumed and produced: records,
//! instructions, heap traffic, undef accounting and proto telemetry.
//! Enabled with the `SZL_REPORT` environment variable (`plain` or
//! `json`), written to stderr by `maybe_report`.

use std::collections::BTreeMap;
use std::io;

use serde::Serialize;

use crate::process::Process;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub records: u64,
    pub failed_records: u64,
    pub instructions: u64,
    pub undef_cnt: u64,
    pub undef_details: BTreeMap<String, u64>,
    pub proto_bytes_read: u64,
    pub proto_bytes_skipped: u64,
    pub heap_allocated_bytes: u64,
    pub heap_allocated_blocks: u64,
    pub heap_used_bytes: usize,
    pub heap_chunk_bytes: usize,
    pub heap_sweeps: u64,
}

/// Snapshot the process counters.
pub fn gather(p: &Process) -> ProcessStats {
    let heap = p.heap_stats();
    ProcessStats {
        records: p.records_processed(),
        failed_records: p.records_failed(),
        instructions: p.instructions_executed(),
        undef_cnt: p.undef_cnt(),
        undef_details: p
            .undef_details()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect(),
        proto_bytes_read: p.proto_bytes_read(),
        proto_bytes_skipped: p.proto_bytes_skipped(),
        heap_allocated_bytes: heap.allocated_bytes,
        heap_allocated_blocks: heap.allocated_blocks,
        heap_used_bytes: heap.used_bytes,
        heap_chunk_bytes: heap.chunk_bytes,
        heap_sweeps: heap.sweeps,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Plain,
    Json,
}

/// Report format requested through the environment, if any.
pub fn report_mode() -> Option<ReportFormat> {
    match std::env::var("SZL_REPORT").ok()?.as_str() {
        "plain" | "text" | "1" => Some(ReportFormat::Plain),
        "json" => Some(ReportFormat::Json),
        _ => None,
    }
}

pub fn write_plain(stats: &ProcessStats, w: &mut dyn io::Write) -> io::Result<()> {
    writeln!(w, "szl resource report:")?;
    writeln!(
        w,
        "  records: {} processed, {} failed",
        stats.records, stats.failed_records
    )?;
    writeln!(w, "  instructions: {}", stats.instructions)?;
    writeln!(
        w,
        "  heap: {} bytes in {} blocks allocated, {} live, {} sweeps",
        stats.heap_allocated_bytes,
        stats.heap_allocated_blocks,
        stats.heap_used_bytes,
        stats.heap_sweeps
    )?;
    writeln!(
        w,
        "  proto: {} bytes read, {} skipped",
        stats.proto_bytes_read, stats.proto_bytes_skipped
    )?;
    writeln!(w, "  undefined records: {}", stats.undef_cnt)?;
    for (msg, n) in &stats.undef_details {
        writeln!(w, "    {n} x {msg}")?;
    }
    Ok(())
}

pub fn write_json(stats: &ProcessStats, w: &mut dyn io::Write) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *w, stats)?;
    writeln!(w)
}

/// Write the report to stderr when `SZL_REPORT` asks for one.
pub fn maybe_report(p: &Process) {
    let Some(mode) = report_mode() else { return };
    let stats = gather(p);
    let mut err = io::stderr().lock();
    let r = match mode {
        ReportFormat::Plain => write_plain(&stats, &mut err),
        ReportFormat::Json => write_json(&stats, &mut err),
    };
    if let Err(e) = r {
        tracing::warn!(error = %e, "resource report failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Process, ProcessConfig};
    use crate::program::ProgramBuilder;
    use serial_test::serial;

    fn stats() -> ProcessStats {
        let mut b = ProgramBuilder::new();
        b.function("main", 0, 0, 0);
        let program = b.finish();
        let p = Process::new(&program, ProcessConfig::default());
        gather(&p)
    }

    #[test]
    fn test_plain_report_renders() {
        let mut out = Vec::new();
        write_plain(&stats(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("szl resource report"));
        assert!(text.contains("records: 0 processed, 0 failed"));
    }

    #[test]
    fn test_json_report_parses() {
        let mut out = Vec::new();
        write_json(&stats(), &mut out).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["records"], 0);
        assert!(v["undef_details"].is_object());
    }

    #[test]
    #[serial]
    fn test_report_mode_env() {
        unsafe {
            std::env::remove_var("SZL_REPORT");
        }
        assert_eq!(report_mode(), None);
        unsafe {
            std::env::set_var("SZL_REPORT", "plain");
        }
        assert_eq!(report_mode(), Some(ReportFormat::Plain));
        unsafe {
            std::env::set_var("SZL_REPORT", "json");
        }
        assert_eq!(report_mode(), Some(ReportFormat::Json));
        unsafe {
            std::env::remove_var("SZL_REPORT");
        }
    }
}
