//! 📊 progress.rs: "Are we there yet?", now with two answers: read and written.
//!
//! One [`ProgressMetrics`] per run, shared by every worker behind a mutex. Source workers
//! report what they pulled (bytes and docs), sink workers report what the cluster
//! accepted. The bar is sized by the splitter's byte estimate when there is one, so the
//! percentage is exactly as honest as that estimate. Which is to say: roughly.
//!
//! ⚠️ Staring at the bar does not make the bulk queue drain faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

const MIB: f64 = 1024.0 * 1024.0;
/// 🔄 rates are computed over this much recent history
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 `1234567` → `1,234,567`.
fn with_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// ⏱️ `MM:SS`, or `HH:MM:SS` for the long haul.
fn clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// 🧮 One sample of the running totals.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes_read: u64,
    docs_read: u64,
    docs_written: u64,
}

/// 🚀 Per-second deltas over the sliding window.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Throughput {
    read_docs_per_sec: f64,
    written_docs_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Running totals plus the terminal display.
pub struct ProgressMetrics {
    label: String,
    estimated_bytes: u64,
    bytes_read: u64,
    docs_read: u64,
    docs_written: u64,
    bar: ProgressBar,
    window: VecDeque<Sample>,
    started: Instant,
}

// 🎭 the bar is terminal plumbing, the totals are what is worth printing
impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("estimated_bytes", &self.estimated_bytes)
            .field("bytes_read", &self.bytes_read)
            .field("docs_read", &self.docs_read)
            .field("docs_written", &self.docs_written)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 Visible bar. `estimated_bytes = 0` means "no idea", and the bar stays a spinner at heart.
    pub fn new(label: impl Into<String>, estimated_bytes: u64) -> Self {
        let bar = ProgressBar::new(estimated_bytes);
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        Self::with_bar(label.into(), estimated_bytes, bar)
    }

    /// 🙈 Same bookkeeping, nothing drawn. For tests and non-interactive runs.
    pub fn hidden(label: impl Into<String>, estimated_bytes: u64) -> Self {
        Self::with_bar(label.into(), estimated_bytes, ProgressBar::hidden())
    }

    fn with_bar(label: String, estimated_bytes: u64, bar: ProgressBar) -> Self {
        let started = Instant::now();
        let mut window = VecDeque::new();
        window.push_back(Sample {
            at: started,
            bytes_read: 0,
            docs_read: 0,
            docs_written: 0,
        });
        Self {
            label,
            estimated_bytes,
            bytes_read: 0,
            docs_read: 0,
            docs_written: 0,
            bar,
            window,
            started,
        }
    }

    pub fn docs_read(&self) -> u64 {
        self.docs_read
    }

    pub fn docs_written(&self) -> u64 {
        self.docs_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// 📥 A source worker pulled a bundle.
    pub fn record_read(&mut self, bytes: u64, docs: u64) {
        self.bytes_read += bytes;
        self.docs_read += docs;
        self.refresh();
        // 📏 estimates undershoot; the bar stops at full instead of overflowing
        let position = match self.estimated_bytes {
            0 => self.bytes_read,
            estimate => self.bytes_read.min(estimate),
        };
        self.bar.set_position(position);
    }

    /// 📤 A sink worker got a batch accepted.
    pub fn record_written(&mut self, docs: u64) {
        self.docs_written += docs;
        self.refresh();
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    fn refresh(&mut self) {
        let throughput = self.throughput(Instant::now());
        self.bar.set_message(self.render(throughput));
    }

    fn throughput(&mut self, now: Instant) -> Throughput {
        while self
            .window
            .front()
            .is_some_and(|s| now.duration_since(s.at) > RATE_WINDOW)
        {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            at: now,
            bytes_read: self.bytes_read,
            docs_read: self.docs_read,
            docs_written: self.docs_written,
        });
        let Some(oldest) = self.window.front().copied() else {
            return Throughput::default();
        };
        let elapsed = now.duration_since(oldest.at).as_secs_f64();
        if elapsed <= 0.0 {
            return Throughput::default();
        }
        Throughput {
            read_docs_per_sec: self.docs_read.saturating_sub(oldest.docs_read) as f64 / elapsed,
            written_docs_per_sec: self.docs_written.saturating_sub(oldest.docs_written) as f64
                / elapsed,
            mib_per_sec: self.bytes_read.saturating_sub(oldest.bytes_read) as f64 / elapsed / MIB,
        }
    }

    fn percent(&self) -> Option<f64> {
        (self.estimated_bytes > 0)
            .then(|| (self.bytes_read as f64 / self.estimated_bytes as f64 * 100.0).min(100.0))
    }

    /// 🎨 Three right-aligned rows under a label line.
    fn render(&self, throughput: Throughput) -> String {
        let elapsed = self.started.elapsed();
        let remaining = match self.percent() {
            Some(p) if p > 0.0 && p < 100.0 => {
                let total = elapsed.as_secs_f64() / (p / 100.0);
                clock(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)))
            }
            _ => "--:--".to_string(),
        };
        let percent = self
            .percent()
            .map_or_else(|| "?%".to_string(), |p| format!("{p:.1}%"));

        let right = |text: String| Cell::new(text).set_alignment(CellAlignment::Right);
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            right(format!("{} read/s", with_thousands(throughput.read_docs_per_sec as u64))),
            right(format!("{} read", with_thousands(self.docs_read))),
        ]);
        table.add_row(vec![
            right(format!("{} written/s", with_thousands(throughput.written_docs_per_sec as u64))),
            right(format!("{} written", with_thousands(self.docs_written))),
        ]);
        table.add_row(vec![
            right(format!("{:.2} MiB/s", throughput.mib_per_sec)),
            right(format!("{percent} of ~{:.1} MiB", self.estimated_bytes as f64 / MIB)),
        ]);
        table.add_row(vec![
            right(format!("{} elapsed", clock(elapsed))),
            right(format!("{remaining} remaining")),
        ]);
        format!("{}\n{}", self.label, table)
    }
}
