//! Shared ffmpeg invocation plumbing: spawn with piped stderr, stream lines
//! to the caller, poll a cancel signal, and terminate cooperatively.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::process_ext::terminate_child_two_stage;

/// Grace period between the polite termination request and the hard kill.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_LINES: usize = 30;

/// Outcome of a streamed subprocess run.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Success,
    Cancelled,
}

/// Run ffmpeg (or any line-oriented tool) streaming stderr lines to
/// `on_line`. `is_cancelled` is polled between lines; on cancellation the
/// child gets the two-stage kill and `RunOutcome::Cancelled` is returned.
/// Non-zero exits become errors carrying a bounded stderr tail.
pub(crate) fn run_streaming(
    mut cmd: Command,
    is_cancelled: &(dyn Fn() -> bool + Sync),
    on_line: &mut dyn FnMut(&str),
) -> Result<RunOutcome> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel::<String>();
    let pump = std::thread::spawn(move || {
        let Some(stderr) = stderr else { return };
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut tail: Vec<String> = Vec::new();
    let mut push_tail = |line: &str, tail: &mut Vec<String>| {
        if tail.len() >= STDERR_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line.to_string());
    };

    let status = loop {
        if is_cancelled() {
            terminate_child_two_stage(&mut child, KILL_GRACE);
            // Drain the pump so the reader thread can exit.
            while rx.try_recv().is_ok() {}
            let _ = pump.join();
            return Ok(RunOutcome::Cancelled);
        }

        if let Ok(line) = rx.recv_timeout(POLL_INTERVAL) {
            push_tail(&line, &mut tail);
            on_line(&line);
        }

        if let Some(status) = child.try_wait()? {
            break status;
        }
    };

    // The pump reads to EOF once the child is gone; lines emitted right
    // before exit are still worth reporting.
    let _ = pump.join();
    while let Ok(line) = rx.try_recv() {
        push_tail(&line, &mut tail);
        on_line(&line);
    }

    if !status.success() {
        let code = status
            .code()
            .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
        bail!("{program} failed ({code}): {}", tail.join("\n"));
    }
    Ok(RunOutcome::Success)
}

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex"));

/// Parse `time=HH:MM:SS.xx` from an ffmpeg stderr progress line.
pub(crate) fn parse_time_seconds(line: &str) -> Option<f64> {
    let caps = TIME_RE.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Map elapsed media time to a percentage of the known total.
pub(crate) fn percent_of(elapsed: f64, total: Option<f64>) -> Option<f64> {
    let total = total?;
    if !(total.is_finite() && total > 0.0 && elapsed.is_finite()) {
        return None;
    }
    Some((elapsed / total * 100.0).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffmpeg_time_lines() {
        let line = "frame=  100 fps=25 q=28.0 size=256kB time=00:01:30.55 bitrate=...";
        let secs = parse_time_seconds(line).expect("time parsed");
        assert!((secs - 90.55).abs() < 1e-9);
    }

    #[test]
    fn ignores_lines_without_time() {
        assert_eq!(parse_time_seconds("Press [q] to stop"), None);
    }

    #[test]
    fn percent_requires_a_positive_total() {
        assert_eq!(percent_of(10.0, None), None);
        assert_eq!(percent_of(10.0, Some(0.0)), None);
        assert_eq!(percent_of(30.0, Some(60.0)), Some(50.0));
        // Overshoot clamps instead of exceeding 100.
        assert_eq!(percent_of(90.0, Some(60.0)), Some(100.0));
    }

    #[cfg(unix)]
    #[test]
    fn run_streaming_reports_nonzero_exit_with_stderr_tail() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let mut lines = Vec::new();
        let err = run_streaming(cmd, &|| false, &mut |l| lines.push(l.to_string()))
            .expect_err("non-zero exit must error");
        let text = format!("{err:#}");
        assert!(text.contains("exit code 3"), "got: {text}");
        assert!(text.contains("boom"), "got: {text}");
        assert_eq!(lines, vec!["boom".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn run_streaming_cancels_a_long_running_child() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 30");
        let started = std::time::Instant::now();
        let outcome =
            run_streaming(cmd, &|| true, &mut |_| {}).expect("cancellation path returns Ok");
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
