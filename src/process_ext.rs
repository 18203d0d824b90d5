use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Run a short-lived helper command, capturing at most `stderr_capture_limit`
/// bytes of stderr. Returns `(status, timed_out, stderr_bytes)`.
pub(crate) fn run_command_with_timeout_capture_stderr(
    mut cmd: Command,
    timeout: Duration,
    stderr_capture_limit: usize,
) -> Result<(ExitStatus, bool, Vec<u8>), std::io::Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let mut stderr = child.stderr.take();
    let stderr_handle = std::thread::spawn(move || {
        let Some(mut stderr) = stderr.take() else {
            return Vec::<u8>::new();
        };

        let mut captured: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if captured.len() < stderr_capture_limit {
                let remaining = stderr_capture_limit - captured.len();
                let to_copy = remaining.min(n);
                captured.extend_from_slice(&buf[..to_copy]);
            }
        }
        captured
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            drop(child.kill());
            break child.wait()?;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    Ok((status, timed_out, stderr_bytes))
}

/// Ask a child to exit (SIGTERM on unix), then force-kill after the grace
/// period if it is still alive. Always reaps the child.
pub(crate) fn terminate_child_two_stage(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let start = Instant::now();
        while start.elapsed() < grace {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
    }
    drop(child.kill());
    drop(child.wait());
}

/// Keep only the last `limit` bytes of captured output, lossily decoded, so
/// failure messages stay bounded no matter how chatty the tool was.
pub(crate) fn stderr_tail(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let start = trimmed.len() - limit;
    // Re-align to a char boundary so we never split a code point.
    let mut start = start;
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_short_output_intact() {
        assert_eq!(stderr_tail(b"boom\n", 64), "boom");
    }

    #[test]
    fn stderr_tail_truncates_long_output_from_the_front() {
        let long = "x".repeat(100) + "tail";
        let tail = stderr_tail(long.as_bytes(), 8);
        assert_eq!(tail, "xxxxtail");
    }

    #[test]
    fn stderr_tail_respects_char_boundaries() {
        let text = "éééé";
        let tail = stderr_tail(text.as_bytes(), 3);
        assert!(tail.chars().all(|c| c == 'é'));
    }
}
