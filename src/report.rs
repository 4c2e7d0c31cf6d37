//! Latency profiles captured at shutdown: persistence, merging, and the
//! percentile report.
//!
//! Unlike recording, nothing here runs inside the allocator, so it is free to
//! allocate.  Percentiles are computed by loading the captured buckets into an
//! [`hdrhistogram::Histogram`] with the same bounds as the recording side.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    fs,
    path::{Path, PathBuf},
    process,
    str::FromStr,
};

use anyhow::{anyhow, bail, Context};
use hdrhistogram::Histogram;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

use crate::{
    config::ReportConfig,
    histogram::{HistogramSet, LAYOUT},
    symbols::Operation,
};

/// Layout of the percentile distribution table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// Fixed-width columns.
    Classic,
    /// Comma-separated values.
    Csv,
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(Format::Classic),
            "csv" => Ok(Format::Csv),
            other => Err(anyhow!("unknown report format '{}'", other)),
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Format::Classic => f.write_str("classic"),
            Format::Csv => f.write_str("csv"),
        }
    }
}

/// Headline numbers for one operation, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
    pub mean: f64,
    pub stdev: f64,
}

/// Nonempty buckets of one operation's histogram.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub operation: String,
    /// `(lowest value in bucket, count)` pairs in value order.
    pub buckets: Vec<(u64, u64)>,
}

impl OperationSnapshot {
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|(_, count)| count).sum()
    }

    pub fn to_histogram(
        &self,
        lowest: u64,
        highest: u64,
        sigfigs: u8,
    ) -> anyhow::Result<Histogram<u64>> {
        let mut hist = Histogram::<u64>::new_with_bounds(lowest, highest, sigfigs)?;
        for (value, count) in self.buckets.iter() {
            hist.record_n(*value, *count)
                .with_context(|| format!("{}: cannot record {}ns", self.operation, value))?;
        }
        Ok(hist)
    }

    fn summarize(hist: &Histogram<u64>) -> Summary {
        Summary {
            count: hist.len(),
            p50: hist.value_at_quantile(0.5),
            p90: hist.value_at_quantile(0.9),
            p99: hist.value_at_quantile(0.99),
            p999: hist.value_at_quantile(0.999),
            max: hist.max(),
            mean: hist.mean(),
            stdev: hist.stdev(),
        }
    }

    fn merge(&mut self, other: &OperationSnapshot) {
        let mut merged: BTreeMap<u64, u64> = self.buckets.iter().copied().collect();
        for (value, count) in other.buckets.iter() {
            *merged.entry(*value).or_insert(0) += count;
        }
        self.buckets = merged.into_iter().collect();
    }
}

/// Latency profile of one process (or of several, once merged).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub pid: u32,
    pub lowest_ns: u64,
    pub highest_ns: u64,
    pub significant_figures: u8,
    pub operations: Vec<OperationSnapshot>,
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.fmt_report(&ReportConfig::default(), f)
    }
}

impl Snapshot {
    /// An empty profile using the compiled-in histogram bounds.
    pub fn new(pid: u32) -> Self {
        Snapshot {
            pid,
            lowest_ns: LAYOUT.lowest,
            highest_ns: LAYOUT.highest,
            significant_figures: LAYOUT.sigfigs,
            operations: Operation::ALL
                .iter()
                .map(|op| OperationSnapshot {
                    operation: op.name().to_string(),
                    buckets: Vec::new(),
                })
                .collect(),
        }
    }

    /// Copy the current contents of `histograms`.
    pub fn capture(histograms: &HistogramSet) -> Self {
        let mut snapshot = Snapshot::new(process::id());
        for (op, entry) in Operation::ALL.iter().zip(snapshot.operations.iter_mut()) {
            entry.buckets = histograms.get(*op).buckets();
        }
        snapshot
    }

    pub fn operation(&self, op: Operation) -> Option<&OperationSnapshot> {
        self.operations.iter().find(|o| o.operation == op.name())
    }

    pub fn summary(&self, op: Operation) -> anyhow::Result<Option<Summary>> {
        let Some(entry) = self.operation(op) else {
            return Ok(None);
        };
        if entry.count() == 0 {
            return Ok(None);
        }
        let hist = self.histogram(entry)?;
        Ok(Some(OperationSnapshot::summarize(&hist)))
    }

    fn histogram(&self, entry: &OperationSnapshot) -> anyhow::Result<Histogram<u64>> {
        entry.to_histogram(self.lowest_ns, self.highest_ns, self.significant_figures)
    }

    /// Add `other`'s samples to this profile.  Profiles recorded with
    /// different histogram bounds cannot be combined.
    pub fn merge(&mut self, other: &Snapshot) -> anyhow::Result<()> {
        if (self.lowest_ns, self.highest_ns, self.significant_figures)
            != (other.lowest_ns, other.highest_ns, other.significant_figures)
        {
            bail!(
                "cannot merge profile of process {} recorded with bounds {}..{}ns/{} digits \
                 into one with bounds {}..{}ns/{} digits",
                other.pid,
                other.lowest_ns,
                other.highest_ns,
                other.significant_figures,
                self.lowest_ns,
                self.highest_ns,
                self.significant_figures
            );
        }
        for entry in other.operations.iter() {
            match self
                .operations
                .iter_mut()
                .find(|o| o.operation == entry.operation)
            {
                Some(existing) => existing.merge(entry),
                None => self.operations.push(entry.clone()),
            }
        }
        Ok(())
    }

    /// Path the profile of process `pid` is saved under in `dir`.
    pub fn file_name(dir: &Path, pid: u32) -> PathBuf {
        dir.join(format!("latalloc.{}.yaml", pid))
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create profile directory {}", dir.display()))?;
        let path = Self::file_name(dir, self.pid);
        let yaml =
            serde_yaml::to_string(self).context("failed to convert latency profile to YAML")?;
        fs::write(&path, yaml)
            .with_context(|| format!("failed to write latency profile to {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_slice(&bytes[..])
            .with_context(|| format!("{} is not a latency profile", path.display()))
    }

    /// Render one block per operation.
    pub fn fmt_report<W: fmt::Write>(&self, config: &ReportConfig, f: &mut W) -> fmt::Result {
        for entry in self.operations.iter() {
            let count = entry.count();
            if count == 0 {
                writeln!(f, "{}: no samples", entry.operation)?;
                continue;
            }
            writeln!(
                f,
                "{}: {} samples",
                entry.operation,
                count.to_formatted_string(&Locale::en)
            )?;
            match self.histogram(entry) {
                Ok(hist) => Self::format_histogram(&hist, config, f)?,
                Err(e) => writeln!(f, "  {:#}", e)?,
            }
        }
        Ok(())
    }

    fn format_histogram<W: fmt::Write>(
        hist: &Histogram<u64>,
        config: &ReportConfig,
        f: &mut W,
    ) -> fmt::Result {
        let s = OperationSnapshot::summarize(hist);
        writeln!(
            f,
            "  p50={}ns p90={}ns p99={}ns p99.9={}ns max={}ns",
            s.p50, s.p90, s.p99, s.p999, s.max
        )?;

        match config.format {
            Format::Classic => writeln!(
                f,
                "{:>12} {:>12} {:>12} {:>12}\n",
                "Value", "Percentile", "TotalCount", "1/(1-Percentile)"
            )?,
            Format::Csv => writeln!(f, "Value,Percentile,TotalCount,1/(1-Percentile)")?,
        }

        let mut total = 0;
        for v in hist.iter_quantiles(config.ticks_per_half_distance) {
            total += v.count_since_last_iteration();
            let quantile = v.quantile_iterated_to();
            let inverse = 1.0 / (1.0 - quantile);
            match config.format {
                Format::Classic => writeln!(
                    f,
                    "{:>12.3} {:>12.6} {:>12} {:>12.2}",
                    v.value_iterated_to() as f64,
                    quantile,
                    total,
                    inverse
                )?,
                Format::Csv => writeln!(
                    f,
                    "{:.3},{:.6},{},{:.2}",
                    v.value_iterated_to() as f64,
                    quantile,
                    total,
                    inverse
                )?,
            }
        }

        if config.format == Format::Classic {
            writeln!(
                f,
                "#[Mean    = {:>12.3}, StdDeviation   = {:>12.3}]",
                s.mean, s.stdev
            )?;
            writeln!(
                f,
                "#[Max     = {:>12.3}, Total count    = {:>12}]",
                s.max as f64, s.count
            )?;
            writeln!(
                f,
                "#[Buckets = {:>12}, SubBuckets     = {:>12}]",
                LAYOUT.bucket_count, LAYOUT.sub_bucket_count
            )?;
        }
        Ok(())
    }

    /// The full report as a string.
    pub fn report(&self, config: &ReportConfig) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.fmt_report(config, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(op: Operation, samples: &[u64]) -> Snapshot {
        let mut snapshot = Snapshot::new(7);
        let mut counts: BTreeMap<u64, u64> = BTreeMap::new();
        for s in samples {
            let value = LAYOUT.value_at(LAYOUT.index_of(LAYOUT.clamp(*s)));
            *counts.entry(value).or_insert(0) += 1;
        }
        let entry = snapshot
            .operations
            .iter_mut()
            .find(|o| o.operation == op.name())
            .unwrap();
        entry.buckets = counts.into_iter().collect();
        snapshot
    }

    // Accept the sample at rank floor(q*n) or ceil(q*n), within the relative
    // error guaranteed by the configured precision.
    fn assert_quantile(actual: u64, sorted: &[u64], quantile: f64) {
        let n = sorted.len() as f64;
        let ranks = [(quantile * n).floor(), (quantile * n).ceil()];
        let tolerance = 10f64.powi(-(LAYOUT.sigfigs as i32));
        let ok = ranks.iter().any(|rank| {
            let rank = (*rank as usize).clamp(1, sorted.len());
            let expected = sorted[rank - 1] as f64;
            ((actual as f64) - expected).abs() <= expected * tolerance
        });
        assert!(ok, "q{}: got {}, samples {:?}", quantile, actual, sorted);
    }

    #[test]
    fn percentiles_within_precision() {
        let samples: Vec<u64> = (0..100).map(|i| 1_000 + i * (999_000 / 99)).collect();
        let snapshot = snapshot_of(Operation::Malloc, &samples);
        let summary = snapshot.summary(Operation::Malloc).unwrap().unwrap();

        assert_eq!(summary.count, 100);
        assert_quantile(summary.p50, &samples, 0.5);
        assert_quantile(summary.p90, &samples, 0.9);
        assert_quantile(summary.p99, &samples, 0.99);
        assert_quantile(summary.p999, &samples, 0.999);
        assert_quantile(summary.max, &samples, 1.0);
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let snapshot = snapshot_of(Operation::Free, &[1, 10_000_000_000]);
        let summary = snapshot.summary(Operation::Free).unwrap().unwrap();
        assert_eq!(summary.count, 2);
        assert!(summary.max <= LAYOUT.highest * 1001 / 1000);
        assert!(summary.max >= LAYOUT.highest * 999 / 1000);
    }

    #[test]
    fn empty_operation_has_no_summary() {
        let snapshot = Snapshot::new(1);
        assert_eq!(snapshot.summary(Operation::Calloc).unwrap(), None);
    }

    #[test]
    fn csv_report() {
        let snapshot = snapshot_of(Operation::Malloc, &[100, 200, 300, 4_000]);
        let report = snapshot.report(&ReportConfig::default());

        assert!(report.contains("malloc: 4 samples"));
        assert!(report.contains("p50="));
        assert!(report.contains("Value,Percentile,TotalCount,1/(1-Percentile)"));
        assert!(report.contains("free: no samples"));
        for op in Operation::ALL.iter() {
            assert!(report.contains(&format!("{}:", op.name())));
        }
    }

    #[test]
    fn classic_report() {
        let snapshot = snapshot_of(Operation::Realloc, &[1_500; 1_234]);
        let config = ReportConfig {
            format: Format::Classic,
            ..ReportConfig::default()
        };
        let report = snapshot.report(&config);

        assert!(report.contains("realloc: 1,234 samples"));
        assert!(report.contains("TotalCount"));
        assert!(report.contains("#[Mean    ="));
        assert!(report.contains("SubBuckets     =         2048"));
        assert!(!report.contains("Value,Percentile"));
    }

    #[test]
    fn merge_sums_counts() {
        let mut a = snapshot_of(Operation::Malloc, &[100, 100, 5_000]);
        let b = snapshot_of(Operation::Malloc, &[100, 70_000]);
        a.merge(&b).unwrap();

        let malloc = a.operation(Operation::Malloc).unwrap();
        assert_eq!(malloc.count(), 5);
        assert_eq!(malloc.buckets[0], (100, 3));
    }

    #[test]
    fn merge_rejects_other_bounds() {
        let mut a = Snapshot::new(1);
        let mut b = Snapshot::new(2);
        b.highest_ns *= 2;
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot_of(Operation::AlignedAlloc, &[42, 4_242]);

        let path = snapshot.save(dir.path()).unwrap();
        assert_eq!(path, Snapshot::file_name(dir.path(), 7));
        assert_eq!(Snapshot::load(&path).unwrap(), snapshot);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latalloc.1.yaml");
        fs::write(&path, "not: [a, profile").unwrap();
        assert!(Snapshot::load(&path).is_err());
    }

    #[test]
    fn format_names() {
        assert_eq!("CSV".parse::<Format>().unwrap(), Format::Csv);
        assert_eq!(" classic ".parse::<Format>().unwrap(), Format::Classic);
        assert!("json".parse::<Format>().is_err());
    }
}
