//! Concurrent consumption and classification of instance output.
//!
//! Every managed instance gets two consumer tasks: stderr lines are surfaced
//! verbatim as `Error`, stdout lines are decoded as protocol envelopes and
//! drive the instance's verdict:
//!
//! ```text
//! running --finish/ok-------------> passed
//! running --finish/failed|crashed-> failed   (also from passed; sticky)
//! running --end of stream---------> incomplete
//! running --cancellation----------> canceled
//! ```
//!
//! Failed and incomplete instances increment the shared failure counter once.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use colored::{Color, ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn, Instrument};

use groundwork_api::{
    Envelope, EventType, InstanceOutput, InstanceSink, InstanceStream, Outcome, RunContext,
};

use crate::obs;

/// Classification of one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    Error,
    Start,
    Ok,
    Fail,
    Crash,
    Incomplete,
    Message,
    Metric,
    Other,
    InternalErr,
}

impl LineClass {
    pub fn label(&self) -> &'static str {
        match self {
            LineClass::Error => "ERROR",
            LineClass::Start => "START",
            LineClass::Ok => "OK",
            LineClass::Fail => "FAIL",
            LineClass::Crash => "CRASH",
            LineClass::Incomplete => "INCOMPLETE",
            LineClass::Message => "MESSAGE",
            LineClass::Metric => "METRIC",
            LineClass::Other => "OTHER",
            LineClass::InternalErr => "INTERNAL_ERR",
        }
    }

    /// Informational classes are 0; Incomplete < Fail < Crash < InternalErr.
    pub fn severity(&self) -> u8 {
        match self {
            LineClass::Incomplete => 1,
            LineClass::Fail => 2,
            LineClass::Crash => 3,
            LineClass::InternalErr => 4,
            _ => 0,
        }
    }

    fn paint(&self) -> ColoredString {
        let label = self.label();
        match self {
            LineClass::Error | LineClass::Fail => label.white().on_red(),
            LineClass::Start => label.black().on_bright_cyan(),
            LineClass::Ok => label.white().on_green(),
            LineClass::Crash | LineClass::Incomplete | LineClass::InternalErr => {
                label.white().on_bright_red()
            }
            LineClass::Message => label.black().on_white(),
            LineClass::Metric => label.white().on_blue(),
            LineClass::Other => label.black().on_bright_white(),
        }
    }
}

impl fmt::Display for LineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const INSTANCE_COLORS: [Color; 15] = [
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::White,
    Color::BrightBlack,
    Color::BrightRed,
    Color::BrightGreen,
    Color::BrightYellow,
    Color::BrightBlue,
    Color::BrightMagenta,
    Color::BrightCyan,
    Color::BrightWhite,
];

/// One classified output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedLine {
    /// Registration order of the instance.
    pub index: u32,
    pub instance_id: String,
    /// Event timestamp, or arrival time for lines that carry none.
    pub at: DateTime<Utc>,
    pub class: LineClass,
    pub text: String,
}

impl ClassifiedLine {
    /// Console form: `<elapsed>s <CLASS> << id >> message`, colored when the
    /// terminal supports it.
    pub fn render(&self, start: DateTime<Utc>) -> String {
        let elapsed = (self.at - start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let tag = format!("<< {} >>", self.instance_id)
            .color(INSTANCE_COLORS[self.index as usize % INSTANCE_COLORS.len()]);
        format!("{:9.4}s {:>10} {} {}", elapsed, self.class.paint(), tag, self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceVerdict {
    Running,
    Passed,
    Failed,
    Incomplete,
    Canceled,
}

impl InstanceVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceVerdict::Running => "running",
            InstanceVerdict::Passed => "passed",
            InstanceVerdict::Failed => "failed",
            InstanceVerdict::Incomplete => "incomplete",
            InstanceVerdict::Canceled => "canceled",
        }
    }

    /// Counts towards the run's failure total.
    pub fn is_failure(&self) -> bool {
        matches!(self, InstanceVerdict::Failed | InstanceVerdict::Incomplete)
    }
}

impl fmt::Display for InstanceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure { failed: u32 },
    Canceled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure { .. } => "failure",
            RunOutcome::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Failure { failed } => write!(f, "{failed} instance(s) failed"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What [`Aggregator::wait`] returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub outcome: RunOutcome,
    pub instances: BTreeMap<String, InstanceVerdict>,
    /// Every classified line, in arrival order.
    pub log: Vec<ClassifiedLine>,
}

struct Inner {
    ctx: RunContext,
    start: DateTime<Utc>,
    console: bool,
    count: AtomicU32,
    failed: AtomicU32,
    tracker: TaskTracker,
    log: Mutex<Vec<ClassifiedLine>>,
    verdicts: Mutex<BTreeMap<String, InstanceVerdict>>,
}

/// Consumes instance streams and folds them into one verdict.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("run_id", &self.inner.ctx.run_id)
            .field("count", &self.count())
            .field("failed", &self.failed())
            .finish()
    }
}

impl Aggregator {
    pub fn new(ctx: RunContext) -> Self {
        Self::build(ctx, false)
    }

    /// Also print every classified line to stdout as it arrives.
    pub fn with_console(ctx: RunContext) -> Self {
        Self::build(ctx, true)
    }

    fn build(ctx: RunContext, console: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                start: Utc::now(),
                console,
                count: AtomicU32::new(0),
                failed: AtomicU32::new(0),
                tracker: TaskTracker::new(),
                log: Mutex::new(Vec::new()),
                verdicts: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.inner.start
    }

    /// Instances registered so far.
    pub fn count(&self) -> u32 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Instances that failed so far.
    pub fn failed(&self) -> u32 {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Wait for every registered instance's consumers to finish.
    pub async fn wait(&self) -> AggregateOutcome {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let instances = lock(&self.inner.verdicts).clone();
        let failed = self.failed();
        // cancellation only matters if it cut an instance short, or hit
        // before any instance was registered
        let canceled = self.inner.ctx.is_cancelled()
            && (instances.is_empty()
                || instances.values().any(|v| *v == InstanceVerdict::Canceled));
        let outcome = if canceled {
            RunOutcome::Canceled
        } else if failed > 0 {
            RunOutcome::Failure { failed }
        } else {
            RunOutcome::Success
        };

        AggregateOutcome {
            outcome,
            instances,
            log: lock(&self.inner.log).clone(),
        }
    }
}

impl InstanceSink for Aggregator {
    fn manage(&self, output: InstanceOutput) {
        let InstanceOutput {
            id, stdout, stderr, ..
        } = output;
        let idx = self.inner.count.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.verdicts).insert(id.clone(), InstanceVerdict::Running);
        debug!(instance = %id, index = idx, "managing instance output");

        let span = self.inner.ctx.span().clone();
        let inner = Arc::clone(&self.inner);
        let stderr_id = id.clone();
        self.inner.tracker.spawn(
            async move { inner.consume_stderr(idx, &stderr_id, stderr).await }.instrument(span.clone()),
        );

        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn(async move { inner.consume_stdout(idx, &id, stdout).await }.instrument(span));
    }

    fn fail_start(&self, id: &str, reason: &str) {
        let idx = self.inner.count.fetch_add(1, Ordering::SeqCst);
        self.inner.failed.fetch_add(1, Ordering::SeqCst);
        self.inner.record(
            idx,
            id,
            Utc::now(),
            LineClass::Incomplete,
            format!("failed to start: {reason}"),
        );
        lock(&self.inner.verdicts).insert(id.to_string(), InstanceVerdict::Incomplete);
        obs::emit_instance_verdict(id, InstanceVerdict::Incomplete.as_str());
    }
}

impl Inner {
    async fn consume_stderr(&self, idx: u32, id: &str, stderr: InstanceStream) {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break,
                r = read_line(&mut reader, &mut buf) => r,
            };
            match next {
                Ok(Some(Line::Text(line))) => self.record(idx, id, Utc::now(), LineClass::Error, line),
                Ok(Some(Line::Oversized(len))) => {
                    self.record(idx, id, Utc::now(), LineClass::Error, oversized_message(len));
                }
                Ok(None) => break,
                Err(e) => {
                    self.record(idx, id, Utc::now(), LineClass::Error, e.to_string());
                    break;
                }
            }
        }
    }

    async fn consume_stdout(&self, idx: u32, id: &str, stdout: InstanceStream) {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut state = InstanceVerdict::Running;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => {
                    if state == InstanceVerdict::Running {
                        state = InstanceVerdict::Canceled;
                    }
                    break;
                }
                r = read_line(&mut reader, &mut buf) => r,
            };
            match next {
                Ok(Some(Line::Text(line))) => {
                    if self.classify_stdout(idx, id, &line, &mut state).is_break() {
                        break;
                    }
                }
                Ok(Some(Line::Oversized(len))) => {
                    self.record(idx, id, Utc::now(), LineClass::InternalErr, oversized_message(len));
                }
                Ok(None) => break,
                Err(e) => {
                    self.record(
                        idx,
                        id,
                        Utc::now(),
                        LineClass::InternalErr,
                        format!("stdout error: {e}"),
                    );
                    break;
                }
            }
        }
        self.settle(idx, id, state);
    }

    /// Classify one stdout line, advancing `state`. Breaks when processing of
    /// this instance's stdout must stop.
    fn classify_stdout(
        &self,
        idx: u32,
        id: &str,
        raw: &str,
        state: &mut InstanceVerdict,
    ) -> ControlFlow<()> {
        let envelope = match Envelope::parse(raw.as_bytes()) {
            Ok(env) => env,
            Err(e) => {
                debug!(instance = %id, error = %e, "unstructured stdout line");
                self.record(idx, id, Utc::now(), LineClass::Other, raw.to_string());
                return ControlFlow::Continue(());
            }
        };

        let at = envelope.ts.unwrap_or_else(Utc::now);
        let event = envelope.event;
        match event.kind {
            EventType::Start => {
                let runenv = event.runenv.map(|v| v.to_string()).unwrap_or_default();
                self.record(idx, id, at, LineClass::Start, runenv);
            }
            EventType::Message => {
                self.record(idx, id, at, LineClass::Message, event.message.unwrap_or_default());
            }
            EventType::Metric => {
                let metric = event.metric.map(|v| v.to_string()).unwrap_or_default();
                self.record(idx, id, at, LineClass::Metric, metric);
            }
            EventType::Finish => match event.outcome() {
                Ok(Outcome::Ok) => {
                    if *state == InstanceVerdict::Running {
                        *state = InstanceVerdict::Passed;
                    }
                    self.record(idx, id, at, LineClass::Ok, String::new());
                }
                Ok(Outcome::Failed) => {
                    *state = InstanceVerdict::Failed;
                    self.record(idx, id, at, LineClass::Fail, event.error.unwrap_or_default());
                }
                Ok(Outcome::Crashed) => {
                    *state = InstanceVerdict::Failed;
                    let text = match (event.error, event.stacktrace) {
                        (Some(err), Some(trace)) => format!("{err}\n{trace}"),
                        (err, trace) => err.or(trace).unwrap_or_default(),
                    };
                    self.record(idx, id, at, LineClass::Crash, text);
                }
                Err(e) => {
                    self.record(idx, id, at, LineClass::InternalErr, e.to_string());
                    return ControlFlow::Break(());
                }
            },
        }
        ControlFlow::Continue(())
    }

    /// Fix the final verdict of an instance whose stdout has been drained.
    fn settle(&self, idx: u32, id: &str, state: InstanceVerdict) {
        let verdict = match state {
            InstanceVerdict::Running => {
                self.record(idx, id, Utc::now(), LineClass::Incomplete, String::new());
                InstanceVerdict::Incomplete
            }
            other => other,
        };
        if verdict.is_failure() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        lock(&self.verdicts).insert(id.to_string(), verdict);
        obs::emit_instance_verdict(id, verdict.as_str());
    }

    fn record(&self, index: u32, id: &str, at: DateTime<Utc>, class: LineClass, text: String) {
        if class.severity() > 0 || class == LineClass::Error {
            warn!(instance = %id, class = %class, "{text}");
        } else {
            debug!(instance = %id, class = %class, "{text}");
        }

        let line = ClassifiedLine {
            index,
            instance_id: id.to_string(),
            at,
            class,
            text,
        };
        if self.console {
            println!("{}", line.render(self.start));
        }
        lock(&self.log).push(line);
    }
}

/// Longest output line kept, terminator included. Longer lines are skipped.
pub const MAX_LINE_BYTES: usize = 1 << 20;

enum Line {
    Text(String),
    /// A line longer than [`MAX_LINE_BYTES`]; carries its full length.
    Oversized(usize),
}

fn oversized_message(len: usize) -> String {
    format!("ignoring line: {len} bytes exceeds the {MAX_LINE_BYTES} byte limit")
}

/// Read one line, without its terminator. Invalid UTF-8 is replaced rather
/// than treated as an error. At most [`MAX_LINE_BYTES`] are buffered; the
/// rest of an oversized line is drained and dropped.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<Line>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0usize;
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let (n, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if !oversized {
            if buf.len() + n > MAX_LINE_BYTES {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..n]);
            }
        }
        reader.consume(n);
        total += n;
        if done {
            break;
        }
    }

    if total == 0 {
        return Ok(None);
    }
    if oversized {
        return Ok(Some(Line::Oversized(total)));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(Line::Text(String::from_utf8_lossy(buf).into_owned())))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
