//! Native PipeWire stream strategy (`pipewire-native` feature).
//!
//! Runs a PipeWire main loop on a dedicated thread with an input-direction
//! stream connected to the target's output node. The `process` callback body
//! obeys the real-time contract: a single non-allocating write into the
//! ring.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pipewire as pw;
use pw::spa;

use crate::backend::linux::{ActiveCapture, subprocess_format};
use crate::backend::linux::pw_record::discover_node;
use crate::format::{Format, SampleFormat};
use crate::session::Shared;

/// How long to wait for the stream to negotiate a format.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

struct StreamData {
    shared: Arc<Shared>,
    format_tx: mpsc::Sender<Format>,
    frame_size: usize,
}

pub(crate) fn activate(
    pid: u32,
    shared: Arc<Shared>,
) -> Result<(Format, Box<dyn ActiveCapture>), String> {
    let node_id = discover_node(pid)?;

    let (format_tx, format_rx) = mpsc::channel::<Format>();
    let (quit_tx, quit_rx) = pw::channel::channel::<()>();
    let (setup_tx, setup_rx) = mpsc::channel::<Result<(), String>>();

    let loop_thread = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("proctap-pw-native".into())
            .spawn(move || run_loop(node_id, shared, format_tx, quit_rx, &setup_tx))
            .map_err(|e| format!("failed to spawn PipeWire loop thread: {e}"))?
    };

    // Stream construction errors surface before negotiation.
    match setup_rx.recv_timeout(NEGOTIATION_TIMEOUT) {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => {
            let _ = loop_thread.join();
            return Err(reason);
        }
        Err(_) => {
            let _ = quit_tx.send(());
            let _ = loop_thread.join();
            return Err("PipeWire loop did not start in time".into());
        }
    }

    match format_rx.recv_timeout(NEGOTIATION_TIMEOUT) {
        Ok(format) => Ok((
            format,
            Box::new(ActivePwNative {
                quit_tx: Some(quit_tx),
                thread: Some(loop_thread),
            }),
        )),
        Err(_) => {
            let _ = quit_tx.send(());
            let _ = loop_thread.join();
            Err("format negotiation timed out".into())
        }
    }
}

fn run_loop(
    node_id: u32,
    shared: Arc<Shared>,
    format_tx: mpsc::Sender<Format>,
    quit_rx: pw::channel::Receiver<()>,
    setup_tx: &mpsc::Sender<Result<(), String>>,
) {
    let report = |r: Result<(), String>| {
        let _ = setup_tx.send(r);
    };

    pw::init();
    let mainloop = match pw::main_loop::MainLoop::new(None) {
        Ok(l) => l,
        Err(e) => return report(Err(format!("main loop: {e}"))),
    };
    let context = match pw::context::Context::new(&mainloop) {
        Ok(c) => c,
        Err(e) => return report(Err(format!("context: {e}"))),
    };
    let core = match context.connect(None) {
        Ok(c) => c,
        Err(e) => return report(Err(format!("connect: {e}"))),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::TARGET_OBJECT => node_id.to_string(),
    };
    let stream = match pw::stream::Stream::new(&core, "proctap-capture", props) {
        Ok(s) => s,
        Err(e) => return report(Err(format!("stream: {e}"))),
    };

    let requested = subprocess_format();
    let data = StreamData {
        shared,
        format_tx,
        frame_size: requested.frame_size(),
    };

    let _listener = match stream
        .add_local_listener_with_user_data(data)
        .param_changed(|_, data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            let Ok((media_type, media_subtype)) = spa::param::format_utils::parse_format(param)
            else {
                return;
            };
            if media_type != spa::param::format::MediaType::Audio
                || media_subtype != spa::param::format::MediaSubtype::Raw
            {
                return;
            }

            let mut info = spa::param::audio::AudioInfoRaw::new();
            if info.parse(param).is_err() {
                return;
            }
            let sample_format = match info.format() {
                spa::param::audio::AudioFormat::F32LE => SampleFormat::F32,
                spa::param::audio::AudioFormat::S16LE => SampleFormat::I16,
                spa::param::audio::AudioFormat::S24LE => SampleFormat::I24,
                spa::param::audio::AudioFormat::S32LE => SampleFormat::I32,
                other => {
                    tracing::warn!(?other, "unsupported negotiated sample format");
                    return;
                }
            };
            let format = Format::new(info.rate(), info.channels() as u16, sample_format);
            data.frame_size = format.frame_size();
            // Must precede the first process-callback write.
            data.shared.set_native_format(format);
            tracing::info!(%format, "PipeWire stream format negotiated");
            let _ = data.format_tx.send(format);
        })
        .process(|stream, data| {
            // Real-time path: one frame-aligned copy into the ring.
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            let Some(d) = datas.first_mut() else { return };
            let valid = d.chunk().size() as usize;
            if let Some(slice) = d.data() {
                let whole = valid.min(slice.len());
                let whole = whole - whole % data.frame_size;
                if whole > 0 {
                    data.shared.ring().write(&slice[..whole]);
                }
            }
        })
        .register()
    {
        Ok(listener) => listener,
        Err(e) => return report(Err(format!("stream listener: {e}"))),
    };

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(requested.sample_rate);
    audio_info.set_channels(u32::from(requested.channels));
    let pod_object = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };
    let pod_bytes = match spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(pod_object),
    ) {
        Ok((cursor, _)) => cursor.into_inner(),
        Err(e) => return report(Err(format!("format pod: {e:?}"))),
    };
    let Some(pod) = spa::pod::Pod::from_bytes(&pod_bytes) else {
        return report(Err("format pod serialization produced no pod".into()));
    };
    let mut params = [pod];

    if let Err(e) = stream.connect(
        spa::utils::Direction::Input,
        Some(node_id),
        pw::stream::StreamFlags::AUTOCONNECT
            | pw::stream::StreamFlags::MAP_BUFFERS
            | pw::stream::StreamFlags::RT_PROCESS,
        &mut params,
    ) {
        return report(Err(format!("stream connect: {e}")));
    }

    report(Ok(()));

    let loop_clone = mainloop.clone();
    let _quit_watch = quit_rx.attach(mainloop.loop_(), move |()| {
        loop_clone.quit();
    });

    mainloop.run();
    tracing::debug!("PipeWire loop exited");
}

struct ActivePwNative {
    quit_tx: Option<pw::channel::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ActiveCapture for ActivePwNative {
    fn shutdown(&mut self) {
        if let Some(quit_tx) = self.quit_tx.take() {
            let _ = quit_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn name(&self) -> &'static str {
        "pipewire-native"
    }
}

impl Drop for ActivePwNative {
    fn drop(&mut self) {
        self.shutdown();
    }
}
