//! PulseAudio null-sink strategy.
//!
//! Creates a private null-sink, *moves* the target's sink-inputs onto it so
//! no other application is captured, and records the sink's monitor source
//! with `parec`. Deactivation moves the inputs back to their previous sink
//! and unloads the module.
//!
//! Moving a sink-input is audible to the target (its output device changes);
//! this is a known limitation of the approach.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use crate::backend::linux::{subprocess_format, ActiveCapture};
use crate::backend::pump_pipe_into_ring;
use crate::error::TapError;
use crate::format::Format;
use crate::session::Shared;

/// A sink-input owned by the target process, with the sink it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SinkInput {
    index: u32,
    original_sink: u32,
}

pub(crate) fn activate(
    pid: u32,
    shared: Arc<Shared>,
) -> Result<(Format, Box<dyn ActiveCapture>), String> {
    let listing = pactl(&["-f", "json", "list", "sink-inputs"])?;
    let inputs = find_sink_inputs(&listing, pid)?;
    if inputs.is_empty() {
        return Err(format!("no sink-input with application.process.id={pid}"));
    }

    // Session-unique sink name so concurrent captures don't collide.
    let sink_name = format!("proctap-{pid}-{}", std::process::id());
    let module_id: u32 = pactl(&[
        "load-module",
        "module-null-sink",
        &format!("sink_name={sink_name}"),
        "sink_properties=device.description=proctap",
    ])?
    .trim()
    .parse()
    .map_err(|_| "module-null-sink did not return a module id".to_string())?;

    let mut teardown = NullSinkGuard {
        sink_name: sink_name.clone(),
        module_id,
        moved: Vec::new(),
    };

    for input in &inputs {
        match pactl(&["move-sink-input", &input.index.to_string(), &sink_name]) {
            Ok(_) => teardown.moved.push(input.clone()),
            Err(e) => {
                tracing::warn!(index = input.index, error = %e, "failed to move sink-input");
            }
        }
    }
    if teardown.moved.is_empty() {
        teardown.restore();
        return Err("no sink-input could be moved onto the null sink".into());
    }
    tracing::info!(
        moved = teardown.moved.len(),
        %sink_name,
        "routing target audio through private null sink"
    );

    let format = subprocess_format();
    shared.set_native_format(format);
    let mut child = Command::new("parec")
        .arg(format!("--device={sink_name}.monitor"))
        .arg("--format=float32le")
        .arg(format!("--rate={}", format.sample_rate))
        .arg(format!("--channels={}", format.channels))
        .arg("--raw")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            teardown.restore();
            format!("parec not runnable: {e}")
        })?;

    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.kill();
            teardown.restore();
            return Err("parec stdout unavailable".into());
        }
    };

    let reader = {
        let shared = Arc::clone(&shared);
        let frame_size = format.frame_size();
        thread::Builder::new()
            .name("proctap-parec".into())
            .spawn(move || {
                if let Err(reason) = pump_pipe_into_ring(stdout, &shared, frame_size) {
                    shared.fail(TapError::backend_lost(format!("parec: {reason}")));
                }
            })
            .map_err(|e| format!("failed to spawn reader thread: {e}"))?
    };

    Ok((
        format,
        Box::new(ActivePulse {
            child,
            reader: Some(reader),
            teardown: Some(teardown),
        }),
    ))
}

fn pactl(args: &[&str]) -> Result<String, String> {
    let output = Command::new("pactl")
        .args(args)
        .output()
        .map_err(|e| format!("pactl not runnable: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "pactl {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `pactl -f json list sink-inputs`, returning the inputs owned by
/// `pid` together with the sinks they are currently connected to.
fn find_sink_inputs(json: &str, pid: u32) -> Result<Vec<SinkInput>, String> {
    let inputs: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("pactl output unparsable: {e}"))?;
    let Some(inputs) = inputs.as_array() else {
        return Err("pactl output is not a JSON array".into());
    };

    let mut matches = Vec::new();
    for input in inputs {
        let owner = input["properties"]["application.process.id"]
            .as_u64()
            .or_else(|| {
                input["properties"]["application.process.id"]
                    .as_str()?
                    .parse()
                    .ok()
            });
        if owner != Some(u64::from(pid)) {
            continue;
        }
        let (Some(index), Some(sink)) = (input["index"].as_u64(), input["sink"].as_u64()) else {
            continue;
        };
        matches.push(SinkInput {
            index: index as u32,
            original_sink: sink as u32,
        });
    }
    Ok(matches)
}

/// Owns the null sink and the moved inputs; restores routing on release.
struct NullSinkGuard {
    sink_name: String,
    module_id: u32,
    moved: Vec<SinkInput>,
}

impl NullSinkGuard {
    fn restore(&mut self) {
        for input in self.moved.drain(..) {
            if let Err(e) = pactl(&[
                "move-sink-input",
                &input.index.to_string(),
                &input.original_sink.to_string(),
            ]) {
                // The input may have gone away with its stream; that is fine.
                tracing::debug!(index = input.index, error = %e, "sink-input not restored");
            }
        }
        if let Err(e) = pactl(&["unload-module", &self.module_id.to_string()]) {
            tracing::warn!(module = self.module_id, error = %e, "null sink not unloaded");
        } else {
            tracing::debug!(sink = %self.sink_name, "null sink removed");
        }
    }
}

struct ActivePulse {
    child: Child,
    reader: Option<thread::JoinHandle<()>>,
    teardown: Option<NullSinkGuard>,
}

impl ActiveCapture for ActivePulse {
    fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(mut teardown) = self.teardown.take() {
            teardown.restore();
        }
    }

    fn name(&self) -> &'static str {
        "pulseaudio-null-sink"
    }
}

impl Drop for ActivePulse {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"[
      {
        "index": 12,
        "sink": 1,
        "properties": {
          "application.name": "mpv",
          "application.process.id": "4242"
        }
      },
      {
        "index": 13,
        "sink": 0,
        "properties": {
          "application.name": "Firefox",
          "application.process.id": 7777
        }
      },
      {
        "index": 14,
        "sink": 2,
        "properties": {}
      }
    ]"#;

    #[test]
    fn test_find_sink_inputs_string_pid() {
        let found = find_sink_inputs(LISTING, 4242).unwrap();
        assert_eq!(
            found,
            vec![SinkInput {
                index: 12,
                original_sink: 1
            }]
        );
    }

    #[test]
    fn test_find_sink_inputs_numeric_pid() {
        let found = find_sink_inputs(LISTING, 7777).unwrap();
        assert_eq!(found[0].index, 13);
        assert_eq!(found[0].original_sink, 0);
    }

    #[test]
    fn test_inputs_without_pid_skipped() {
        assert!(find_sink_inputs(LISTING, 99).unwrap().is_empty());
    }

    #[test]
    fn test_unparsable_listing_is_error() {
        assert!(find_sink_inputs("<xml/>", 1).is_err());
    }
}
