//! macOS backend: ScreenCaptureKit audio capture via a helper subprocess.
//!
//! ScreenCaptureKit (macOS 13+) scopes audio capture to an application
//! bundle, so the backend resolves the target pid to its bundle identifier
//! and spawns the bundled `proctap-helper` binary, which configures an
//! audio-only `SCStream` and writes raw interleaved PCM to stdout.
//!
//! The Screen Recording permission prompt is owned by the helper; a denial
//! surfaces as `PermissionDenied`.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{pump_pipe_into_ring, CaptureBackend, CaptureTarget};
use crate::error::TapError;
use crate::format::{Format, SampleFormat};
use crate::session::Shared;

/// Environment variable overriding helper binary discovery.
const HELPER_ENV: &str = "PROCTAP_MACOS_HELPER";
/// Helper exit codes, matching the CLI contract.
const EXIT_UNSUPPORTED_OS: i32 = 2;
const EXIT_TARGET_NOT_FOUND: i32 = 3;
const EXIT_PERMISSION_DENIED: i32 = 4;

extern "C" {
    fn kill(pid: i32, sig: i32) -> i32;
}
const SIGTERM: i32 = 15;

pub(crate) struct MacosBackend {
    bundle_id: String,
    helper_path: PathBuf,
    format: Format,
    shared: Arc<Shared>,
    child: Option<Child>,
    reader: Option<thread::JoinHandle<()>>,
}

impl MacosBackend {
    pub(crate) fn new(target: &CaptureTarget, shared: Arc<Shared>) -> Result<Self, TapError> {
        check_macos_version()?;

        let bundle_id = match target {
            CaptureTarget::BundleId(id) => id.clone(),
            CaptureTarget::Pid(pid) => bundle_id_for_pid(*pid)?,
        };
        let helper_path = find_helper_binary().ok_or_else(|| TapError::BackendUnavailable {
            reasons: vec![format!(
                "proctap-helper not found (set {HELPER_ENV} to its absolute path)"
            )],
        })?;

        // The helper speaks int16 and float32; anything else is produced by
        // the conversion pipeline from a float32 native stream.
        let format = match shared.output_format() {
            Some(requested) if requested.sample_format == SampleFormat::I16 => Format::new(
                requested.sample_rate,
                requested.channels,
                SampleFormat::I16,
            ),
            Some(requested) => Format::new(
                requested.sample_rate,
                requested.channels,
                SampleFormat::F32,
            ),
            None => Format::new(48000, 2, SampleFormat::F32),
        };

        Ok(Self {
            bundle_id,
            helper_path,
            format,
            shared,
            child: None,
            reader: None,
        })
    }
}

impl CaptureBackend for MacosBackend {
    fn activate(&mut self) -> Result<Format, TapError> {
        tracing::info!(
            bundle_id = %self.bundle_id,
            helper = %self.helper_path.display(),
            "starting ScreenCaptureKit helper"
        );

        let mut child = Command::new(&self.helper_path)
            .arg("--bundle-id")
            .arg(&self.bundle_id)
            .arg("--sample-rate")
            .arg(self.format.sample_rate.to_string())
            .arg("--channels")
            .arg(self.format.channels.to_string())
            .arg("--sample-format")
            .arg(self.format.sample_format.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TapError::BackendUnavailable {
                reasons: vec![format!("failed to spawn helper: {e}")],
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            let _ = child.kill();
            TapError::internal("helper stdout unavailable")
        })?;
        let stderr = child.stderr.take();

        // Collect helper diagnostics for the failure path.
        let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        if let Some(stderr) = stderr {
            let tail = Arc::clone(&stderr_tail);
            let _ = thread::Builder::new()
                .name("proctap-helper-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        tracing::debug!(target: "proctap::helper", "{line}");
                        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                        if tail.len() >= 20 {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                });
        }

        // Fast failures (bad bundle, denied permission without a prompt)
        // show up as an immediate exit; give the helper a short grace
        // window before trusting the stream.
        let grace_deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < grace_deadline {
            if let Ok(Some(status)) = child.try_wait() {
                let tail = stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
                return Err(map_helper_exit(status.code(), &tail));
            }
            thread::sleep(Duration::from_millis(20));
        }

        self.shared.set_native_format(self.format);
        let reader = {
            let shared = Arc::clone(&self.shared);
            let frame_size = self.format.frame_size();
            let tail = Arc::clone(&stderr_tail);
            thread::Builder::new()
                .name("proctap-helper-reader".into())
                .spawn(move || {
                    if let Err(reason) = pump_pipe_into_ring(stdout, &shared, frame_size) {
                        let tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                        let diagnostic = if tail.is_empty() {
                            reason
                        } else {
                            format!("{reason} ({})", tail.join(" | "))
                        };
                        shared.fail(TapError::backend_lost(format!("helper: {diagnostic}")));
                    }
                })
                .map_err(|e| TapError::internal(format!("failed to spawn reader: {e}")))?
        };

        self.child = Some(child);
        self.reader = Some(reader);
        Ok(self.format)
    }

    fn deactivate(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id() as i32;
            // SIGTERM lets the helper stop its SCStream cleanly; escalate
            // only if it hangs.
            // SAFETY: plain kill(2) on our own child process.
            unsafe {
                kill(pid, SIGTERM);
            }
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    _ => {
                        tracing::warn!("helper ignored SIGTERM; killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn strategy(&self) -> &'static str {
        "screencapturekit-helper"
    }
}

fn map_helper_exit(code: Option<i32>, stderr_tail: &[String]) -> TapError {
    let detail = stderr_tail.join(" | ");
    match code {
        Some(EXIT_PERMISSION_DENIED) => TapError::permission_denied(if detail.is_empty() {
            "Screen Recording permission refused".into()
        } else {
            detail
        }),
        Some(EXIT_TARGET_NOT_FOUND) => TapError::target_not_found(detail),
        Some(EXIT_UNSUPPORTED_OS) => TapError::UnsupportedOs { reason: detail },
        code => TapError::BackendUnavailable {
            reasons: vec![format!("helper exited early (code {code:?}): {detail}")],
        },
    }
}

/// Requires macOS 13 (Ventura) or later.
fn check_macos_version() -> Result<(), TapError> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .map_err(|e| TapError::UnsupportedOs {
            reason: format!("cannot determine macOS version: {e}"),
        })?;
    let version = String::from_utf8_lossy(&output.stdout);
    let major: u32 = version
        .trim()
        .split('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if major < 13 {
        return Err(TapError::UnsupportedOs {
            reason: format!("ScreenCaptureKit audio capture requires macOS 13+, found {version}"),
        });
    }
    Ok(())
}

/// Resolves a pid to the owning application's bundle identifier via
/// `lsappinfo`, handling both its output dialects.
fn bundle_id_for_pid(pid: u32) -> Result<String, TapError> {
    let output = Command::new("lsappinfo")
        .args(["info", "-only", "bundleid", &pid.to_string()])
        .output()
        .map_err(|e| TapError::internal(format!("lsappinfo not runnable: {e}")))?;

    let text = String::from_utf8_lossy(&output.stdout);
    if let Some(bundle_id) = parse_lsappinfo(&text) {
        tracing::debug!(pid, %bundle_id, "resolved bundle identifier");
        return Ok(bundle_id);
    }
    Err(TapError::target_not_found(format!(
        "no application bundle owns pid {pid}"
    )))
}

fn parse_lsappinfo(output: &str) -> Option<String> {
    let output = output.trim();
    // Newer: "CFBundleIdentifier"="com.hnc.Discord"
    if let Some(rest) = output.split("\"CFBundleIdentifier\"=").nth(1) {
        let id = rest.trim().trim_matches('"');
        if !id.is_empty() && id != "NULL" {
            return Some(id.to_string());
        }
    }
    // Older: bundleid="com.apple.Safari"
    if let Some(rest) = output.split("bundleid=").nth(1) {
        let id = rest.trim().trim_matches('"');
        if !id.is_empty() && id != "NULL" {
            return Some(id.to_string());
        }
    }
    None
}

/// Locates the helper binary: env override first, then well-known locations
/// relative to the running executable.
fn find_helper_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(HELPER_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
        tracing::warn!(
            path = %path.display(),
            "{HELPER_ENV} is set but does not point at a file"
        );
    }

    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    for relative in [
        "proctap-helper",
        "../libexec/proctap-helper",
        "../share/proctap/proctap-helper",
    ] {
        let candidate = exe_dir.join(relative);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsappinfo_new_format() {
        let out = "\"CFBundleIdentifier\"=\"com.hnc.Discord\"";
        assert_eq!(parse_lsappinfo(out), Some("com.hnc.Discord".into()));
    }

    #[test]
    fn test_parse_lsappinfo_old_format() {
        let out = "bundleid=\"com.apple.Safari\"";
        assert_eq!(parse_lsappinfo(out), Some("com.apple.Safari".into()));
    }

    #[test]
    fn test_parse_lsappinfo_null_and_empty() {
        assert_eq!(parse_lsappinfo("bundleid=\"NULL\""), None);
        assert_eq!(parse_lsappinfo(""), None);
    }

    #[test]
    fn test_helper_exit_mapping() {
        assert_eq!(
            map_helper_exit(Some(EXIT_PERMISSION_DENIED), &[]).kind(),
            crate::ErrorKind::PermissionDenied
        );
        assert_eq!(
            map_helper_exit(Some(EXIT_TARGET_NOT_FOUND), &["gone".into()]).kind(),
            crate::ErrorKind::TargetNotFound
        );
        assert_eq!(
            map_helper_exit(None, &[]).kind(),
            crate::ErrorKind::BackendUnavailable
        );
    }
}
