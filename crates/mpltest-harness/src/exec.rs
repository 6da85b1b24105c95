//! Subprocess execution with bounded wall time.
//!
//! Every child runs in its own process group so a timeout kill reaps the
//! background threads and helper processes a test case may have spawned,
//! not just the top-level process.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub wall: Duration,
    /// RLIMIT_CPU for the child, seconds. `None` leaves the limit inherited.
    pub cpu_time_limit_seconds: Option<u64>,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_status: i32,
    pub exit_signal: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Runs `argv` in `cwd`, capturing stdout/stderr with byte caps. On wall
/// timeout the whole process group is SIGKILLed and `timed_out` is set.
pub fn run_command(argv: &[String], cwd: &Path, limits: &ExecLimits) -> Result<ExecOutcome> {
    let (program, args) = argv
        .split_first()
        .context("empty command after substitution")?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        let cpu = limits.cpu_time_limit_seconds;
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(secs) = cpu {
                    apply_rlimits(secs)?;
                }
                Ok(())
            });
        }
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn: {program}"))?;

    let stdout = child.stdout.take().context("take stdout")?;
    let stderr = child.stderr.take().context("take stderr")?;

    let stdout_cap = limits.max_stdout_bytes;
    let stdout_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        read_to_end_capped(stdout, stdout_cap)
    });
    let stderr_cap = limits.max_stderr_bytes;
    let stderr_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        read_to_end_capped(stderr, stderr_cap)
    });

    let (status, timed_out) = wait_with_wall_timeout(&mut child, limits.wall)?;
    let duration = start.elapsed();

    let (stdout_bytes, stdout_truncated) = stdout_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;
    let (stderr_bytes, stderr_truncated) = stderr_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;

    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    let exit_status = match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    };

    Ok(ExecOutcome {
        exit_status,
        exit_signal,
        timed_out,
        duration,
        stdout: stdout_bytes,
        stderr: stderr_bytes,
        stdout_truncated,
        stderr_truncated,
    })
}

fn wait_with_wall_timeout(
    child: &mut std::process::Child,
    wall: Duration,
) -> Result<(std::process::ExitStatus, bool)> {
    let deadline = Instant::now().checked_add(wall);

    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            hard_kill_pid_and_group(child.id());
            let status = child.wait().context("wait child after kill")?;
            return Ok((status, true));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// SIGKILLs a child's whole process group, then the child itself in case the
/// group kill raced with the child changing groups.
pub fn hard_kill_pid_and_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(unix)]
fn apply_rlimits(cpu_seconds: u64) -> std::io::Result<()> {
    unsafe {
        let cpu = libc::rlimit {
            rlim_cur: cpu_seconds as libc::rlim_t,
            rlim_max: cpu_seconds as libc::rlim_t,
        };
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }

        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}
