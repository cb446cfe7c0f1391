//! `pw-record` subprocess strategy.
//!
//! Discovers the target's PipeWire output node from `pw-dump` and records it
//! with `pw-record`, reading raw PCM from the child's stdout.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use crate::backend::linux::{subprocess_format, ActiveCapture};
use crate::backend::pump_pipe_into_ring;
use crate::error::TapError;
use crate::format::Format;
use crate::session::Shared;

/// Runs `pw-dump` and returns the id of the target's playback node.
pub(crate) fn discover_node(pid: u32) -> Result<u32, String> {
    let dump = Command::new("pw-dump")
        .output()
        .map_err(|e| format!("pw-dump not runnable: {e}"))?;
    if !dump.status.success() {
        return Err(format!("pw-dump exited with {}", dump.status));
    }
    let dump = String::from_utf8_lossy(&dump.stdout);
    let node_id = find_output_node(&dump, pid)?
        .ok_or_else(|| format!("no playback node with application.process.id={pid}"))?;
    tracing::info!(node_id, pid, "found PipeWire output node");
    Ok(node_id)
}

pub(crate) fn activate(
    pid: u32,
    shared: Arc<Shared>,
) -> Result<(Format, Box<dyn ActiveCapture>), String> {
    let node_id = discover_node(pid)?;

    let format = subprocess_format();
    shared.set_native_format(format);
    let mut child = Command::new("pw-record")
        .arg("--target")
        .arg(node_id.to_string())
        .arg("--rate")
        .arg(format.sample_rate.to_string())
        .arg("--channels")
        .arg(format.channels.to_string())
        .arg("--format")
        .arg("f32")
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("pw-record not runnable: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "pw-record stdout unavailable".to_string())?;

    let reader = {
        let shared = Arc::clone(&shared);
        let frame_size = format.frame_size();
        thread::Builder::new()
            .name("proctap-pw-record".into())
            .spawn(move || {
                if let Err(reason) = pump_pipe_into_ring(stdout, &shared, frame_size) {
                    shared.fail(TapError::backend_lost(format!("pw-record: {reason}")));
                }
            })
            .map_err(|e| format!("failed to spawn reader thread: {e}"))?
    };

    Ok((
        format,
        Box::new(ActivePwRecord {
            child,
            reader: Some(reader),
        }),
    ))
}

/// Finds the id of a `Stream/Output/Audio` node owned by `pid` in `pw-dump`
/// JSON output.
fn find_output_node(dump: &str, pid: u32) -> Result<Option<u32>, String> {
    let objects: serde_json::Value =
        serde_json::from_str(dump).map_err(|e| format!("pw-dump output unparsable: {e}"))?;
    let Some(objects) = objects.as_array() else {
        return Err("pw-dump output is not a JSON array".into());
    };

    for object in objects {
        if object["type"] != "PipeWire:Interface:Node" {
            continue;
        }
        let props = &object["info"]["props"];
        if props["media.class"] != "Stream/Output/Audio" {
            continue;
        }
        // The property is a number in recent PipeWire and a string in older
        // releases.
        let owner = props["application.process.id"]
            .as_u64()
            .or_else(|| props["application.process.id"].as_str()?.parse().ok());
        if owner == Some(u64::from(pid)) {
            if let Some(id) = object["id"].as_u64() {
                return Ok(Some(id as u32));
            }
        }
    }
    Ok(None)
}

struct ActivePwRecord {
    child: Child,
    reader: Option<thread::JoinHandle<()>>,
}

impl ActiveCapture for ActivePwRecord {
    fn shutdown(&mut self) {
        // The session's stop flag is already set; killing the child ends the
        // reader's pipe with a clean EOF.
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn name(&self) -> &'static str {
        "pipewire-record"
    }
}

impl Drop for ActivePwRecord {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"[
      {
        "id": 30,
        "type": "PipeWire:Interface:Device",
        "info": { "props": { "media.class": "Audio/Device" } }
      },
      {
        "id": 55,
        "type": "PipeWire:Interface:Node",
        "info": {
          "props": {
            "media.class": "Stream/Output/Audio",
            "application.name": "Firefox",
            "application.process.id": 4242
          }
        }
      },
      {
        "id": 61,
        "type": "PipeWire:Interface:Node",
        "info": {
          "props": {
            "media.class": "Stream/Input/Audio",
            "application.process.id": 4242
          }
        }
      },
      {
        "id": 77,
        "type": "PipeWire:Interface:Node",
        "info": {
          "props": {
            "media.class": "Stream/Output/Audio",
            "application.process.id": "9001"
          }
        }
      }
    ]"#;

    #[test]
    fn test_find_node_by_numeric_pid() {
        assert_eq!(find_output_node(DUMP, 4242).unwrap(), Some(55));
    }

    #[test]
    fn test_find_node_by_string_pid() {
        // Older PipeWire emits the pid property as a string.
        assert_eq!(find_output_node(DUMP, 9001).unwrap(), Some(77));
    }

    #[test]
    fn test_input_streams_are_ignored() {
        // pid 4242 also has a capture stream (id 61) that must not match.
        assert_eq!(find_output_node(DUMP, 4242).unwrap(), Some(55));
    }

    #[test]
    fn test_no_match_returns_none() {
        assert_eq!(find_output_node(DUMP, 1).unwrap(), None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(find_output_node("not json", 1).is_err());
        assert!(find_output_node("{}", 1).is_err());
    }
}
