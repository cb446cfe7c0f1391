//! Windows backend: WASAPI process loopback.
//!
//! Captures the playback audio of a target process tree on Windows 10 build
//! 19041+ by activating an `IAudioClient` against the process-loopback
//! virtual device. All COM work happens on one dedicated pump thread; the
//! façade only exchanges a format handshake and a stop flag with it.

use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use windows::core::{implement, ComInterface, IUnknown, HRESULT};
use windows::Win32::Foundation::{CloseHandle, E_ACCESSDENIED, E_INVALIDARG, E_NOINTERFACE, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Media::Audio::{
    ActivateAudioInterfaceAsync, IActivateAudioInterfaceAsyncOperation,
    IActivateAudioInterfaceCompletionHandler, IActivateAudioInterfaceCompletionHandler_Impl,
    IAudioCaptureClient, IAudioClient, AUDCLNT_BUFFERFLAGS_SILENT, AUDCLNT_SHAREMODE_SHARED,
    AUDIOCLIENT_ACTIVATION_PARAMS, AUDIOCLIENT_ACTIVATION_PARAMS_0,
    AUDIOCLIENT_ACTIVATION_TYPE_PROCESS_LOOPBACK, AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS,
    PROCESS_LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE, VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK,
    WAVEFORMATEX,
};
use windows::Win32::System::Com::StructuredStorage::{
    PROPVARIANT, PROPVARIANT_0, PROPVARIANT_0_0, PROPVARIANT_0_0_0,
};
use windows::Win32::System::Com::{CoInitializeEx, CoTaskMemFree, CoUninitialize, BLOB, COINIT_MULTITHREADED};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
use windows::Win32::System::Variant::VT_BLOB;

use parking_lot::{Condvar, Mutex};

use crate::backend::{CaptureBackend, CaptureTarget};
use crate::error::TapError;
use crate::format::{Format, SampleFormat};
use crate::session::Shared;

/// Deadline for the asynchronous activation to complete.
const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Capture-event wait slice; bounds stop latency.
const EVENT_WAIT_MS: u32 = 100;
/// Client buffer duration: 20ms in 100ns units.
const BUFFER_DURATION_HNS: i64 = 20 * 10_000;

// Stream flags (Win32 AudioClient.h); EVENTCALLBACK drives the pump,
// LOOPBACK + the cross-process flag select process loopback on the virtual
// device.
const AUDCLNT_STREAMFLAGS_LOOPBACK: u32 = 0x0002_0000;
const AUDCLNT_STREAMFLAGS_EVENTCALLBACK: u32 = 0x0004_0000;
const AUDCLNT_SESSIONFLAGS_EXPIREWHENUNOWNED: u32 = 0x1000_0000;
const AUDCLNT_E_DEVICE_INVALIDATED: i32 = 0x8889_0004_u32 as i32;
const E_NOTFOUND: i32 = 0x8007_0490_u32 as i32;

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

pub(crate) struct WindowsBackend {
    pid: u32,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    pump: Option<thread::JoinHandle<()>>,
}

impl WindowsBackend {
    pub(crate) fn new(target: &CaptureTarget, shared: Arc<Shared>) -> Result<Self, TapError> {
        let pid = match target {
            CaptureTarget::Pid(pid) => *pid,
            CaptureTarget::BundleId(_) => {
                return Err(TapError::invalid_target(
                    "bundle identifiers are only valid on macOS",
                ))
            }
        };
        Ok(Self {
            pid,
            shared,
            stop: Arc::new(AtomicBool::new(false)),
            pump: None,
        })
    }
}

impl CaptureBackend for WindowsBackend {
    fn activate(&mut self) -> Result<Format, TapError> {
        let (format_tx, format_rx) = mpsc::channel::<Result<Format, TapError>>();
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let pid = self.pid;

        let pump = thread::Builder::new()
            .name("proctap-wasapi".into())
            .spawn(move || pump_thread(pid, shared, stop, &format_tx))
            .map_err(|e| TapError::internal(format!("failed to spawn pump thread: {e}")))?;
        self.pump = Some(pump);

        // Margin over the in-thread activation deadline so its own timeout
        // error wins the race.
        match format_rx.recv_timeout(ACTIVATION_TIMEOUT + Duration::from_secs(1)) {
            Ok(Ok(format)) => Ok(format),
            Ok(Err(e)) => {
                self.deactivate();
                Err(e)
            }
            Err(_) => {
                self.deactivate();
                Err(TapError::BackendTimeout {
                    timeout: ACTIVATION_TIMEOUT,
                })
            }
        }
    }

    fn deactivate(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }

    fn strategy(&self) -> &'static str {
        "wasapi-process-loopback"
    }
}

/// Signals activation completion from the COM worker back to the waiter.
#[implement(IActivateAudioInterfaceCompletionHandler)]
struct ActivationHandler {
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl IActivateAudioInterfaceCompletionHandler_Impl for ActivationHandler {
    fn ActivateCompleted(
        &self,
        _operation: Option<&IActivateAudioInterfaceAsyncOperation>,
    ) -> windows::core::Result<()> {
        let (flag, condvar) = &*self.done;
        *flag.lock() = true;
        condvar.notify_all();
        Ok(())
    }
}

/// Everything COM happens here: MTA init, async activation, format setup,
/// then the event-driven capture loop until the stop flag is observed.
fn pump_thread(
    pid: u32,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    format_tx: &mpsc::Sender<Result<Format, TapError>>,
) {
    // SAFETY: COM init/teardown is paired on this thread.
    unsafe {
        if let Err(e) = CoInitializeEx(None, COINIT_MULTITHREADED).ok() {
            let _ = format_tx.send(Err(TapError::internal(format!(
                "CoInitializeEx failed: {e}"
            ))));
            return;
        }
    }
    let _com = ComGuard;

    let session = match unsafe { activate_loopback_client(pid) } {
        Ok(session) => session,
        Err(e) => {
            let _ = format_tx.send(Err(e));
            return;
        }
    };
    shared.set_native_format(session.format);
    let _ = format_tx.send(Ok(session.format));

    if let Err(e) = unsafe { run_capture_loop(&session, &shared, &stop) } {
        if !stop.load(Ordering::Acquire) {
            shared.fail(e);
        }
    }

    unsafe {
        let _ = session.client.Stop();
        let _ = CloseHandle(session.event);
    }
}

struct LoopbackSession {
    client: IAudioClient,
    capture: IAudioCaptureClient,
    event: HANDLE,
    format: Format,
    frame_size: usize,
}

unsafe fn activate_loopback_client(pid: u32) -> Result<LoopbackSession, TapError> {
    // Activation descriptor: this process tree, playback side.
    let activation_params = AUDIOCLIENT_ACTIVATION_PARAMS {
        ActivationType: AUDIOCLIENT_ACTIVATION_TYPE_PROCESS_LOOPBACK,
        Anonymous: AUDIOCLIENT_ACTIVATION_PARAMS_0 {
            ProcessLoopbackParams: AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS {
                TargetProcessId: pid,
                ProcessLoopbackMode: PROCESS_LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE,
            },
        },
    };
    let blob = BLOB {
        cbSize: std::mem::size_of::<AUDIOCLIENT_ACTIVATION_PARAMS>() as u32,
        pBlobData: std::ptr::addr_of!(activation_params) as *mut u8,
    };
    let propvariant = PROPVARIANT {
        Anonymous: PROPVARIANT_0 {
            Anonymous: ManuallyDrop::new(PROPVARIANT_0_0 {
                vt: VT_BLOB,
                wReserved1: 0,
                wReserved2: 0,
                wReserved3: 0,
                Anonymous: PROPVARIANT_0_0_0 { blob },
            }),
        },
    };

    let done = Arc::new((Mutex::new(false), Condvar::new()));
    let handler: IActivateAudioInterfaceCompletionHandler = ActivationHandler {
        done: Arc::clone(&done),
    }
    .into();

    let operation = ActivateAudioInterfaceAsync(
        VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK,
        &IAudioClient::IID,
        Some(std::ptr::addr_of!(propvariant)),
        &handler,
    )
    .map_err(|e| map_activation_error(e.code()))?;

    // Wait for the completion callback with the activation deadline.
    {
        let (flag, condvar) = &*done;
        let mut completed = flag.lock();
        if !*completed
            && condvar
                .wait_for(&mut completed, ACTIVATION_TIMEOUT)
                .timed_out()
            && !*completed
        {
            return Err(TapError::BackendTimeout {
                timeout: ACTIVATION_TIMEOUT,
            });
        }
    }

    let mut activate_hr = HRESULT(0);
    let mut activated: Option<IUnknown> = None;
    operation
        .GetActivateResult(&mut activate_hr, &mut activated)
        .map_err(|e| TapError::internal(format!("GetActivateResult failed: {e}")))?;
    if activate_hr.is_err() {
        return Err(map_activation_error(activate_hr));
    }
    let client: IAudioClient = activated
        .ok_or_else(|| TapError::internal("activation returned no interface"))?
        .cast()
        .map_err(|e| TapError::internal(format!("IAudioClient cast failed: {e}")))?;

    // Preferred format: 48kHz stereo float32. Fallback: 44.1kHz stereo i16.
    let preferred = Format::new(48000, 2, SampleFormat::F32);
    let fallback = Format::new(44100, 2, SampleFormat::I16);
    let mut chosen = preferred;
    let mut wave_format = waveformatex_for(preferred);

    let flags = AUDCLNT_STREAMFLAGS_LOOPBACK
        | AUDCLNT_STREAMFLAGS_EVENTCALLBACK
        | AUDCLNT_SESSIONFLAGS_EXPIREWHENUNOWNED;

    if client
        .Initialize(
            AUDCLNT_SHAREMODE_SHARED,
            flags,
            BUFFER_DURATION_HNS,
            0,
            &wave_format,
            None,
        )
        .is_err()
    {
        chosen = fallback;
        wave_format = waveformatex_for(fallback);
        client
            .Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                flags,
                BUFFER_DURATION_HNS,
                0,
                &wave_format,
                None,
            )
            .map_err(|e| TapError::BackendUnavailable {
                reasons: vec![format!("IAudioClient::Initialize failed: {e}")],
            })?;
    }

    // Loopback may substitute a different engine format; trust what the
    // client reports over what we asked for. The virtual device offers no
    // mix format on some builds, in which case the request stands.
    let native = match client.GetMixFormat() {
        Ok(mix) => {
            let format = format_from_waveformatex(&*mix).unwrap_or(chosen);
            CoTaskMemFree(Some(mix as *const _ as *const _));
            format
        }
        Err(_) => chosen,
    };
    if native != chosen {
        tracing::info!(requested = %chosen, actual = %native, "loopback substituted the mix format");
    }

    let event = CreateEventW(None, false, false, None)
        .map_err(|e| TapError::internal(format!("CreateEventW failed: {e}")))?;
    client
        .SetEventHandle(event)
        .map_err(|e| TapError::internal(format!("SetEventHandle failed: {e}")))?;

    let capture: IAudioCaptureClient = client
        .GetService()
        .map_err(|e| TapError::internal(format!("GetService failed: {e}")))?;

    client
        .Start()
        .map_err(|e| TapError::internal(format!("IAudioClient::Start failed: {e}")))?;

    tracing::info!(pid, format = %native, "WASAPI process loopback capturing");
    Ok(LoopbackSession {
        client,
        capture,
        event,
        frame_size: native.frame_size(),
        format: native,
    })
}

/// Event-driven packet pump. Writes exactly `frames * frame_size` bytes per
/// packet into the ring, zero-filled when the engine flags the packet silent.
unsafe fn run_capture_loop(
    session: &LoopbackSession,
    shared: &Shared,
    stop: &AtomicBool,
) -> Result<(), TapError> {
    // Packets are at most the 20ms client buffer; one zero block covers the
    // silent-flag path without allocating per packet.
    let zeros = vec![0u8; session.format.bytes_for_ms(25)];

    while !stop.load(Ordering::Acquire) {
        let wait = WaitForSingleObject(session.event, EVENT_WAIT_MS);
        if wait != WAIT_OBJECT_0 {
            continue;
        }

        loop {
            let packet = session
                .capture
                .GetNextPacketSize()
                .map_err(|e| map_stream_error(e.code()))?;
            if packet == 0 {
                break;
            }

            let mut data: *mut u8 = std::ptr::null_mut();
            let mut frames: u32 = 0;
            let mut flags: u32 = 0;
            session
                .capture
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                .map_err(|e| map_stream_error(e.code()))?;

            if frames > 0 && !data.is_null() {
                let byte_len = frames as usize * session.frame_size;
                if flags & AUDCLNT_BUFFERFLAGS_SILENT.0 as u32 != 0 {
                    let mut remaining = byte_len;
                    while remaining > 0 {
                        let n = remaining.min(zeros.len());
                        shared.ring().write(&zeros[..n]);
                        remaining -= n;
                    }
                } else {
                    let bytes = std::slice::from_raw_parts(data, byte_len);
                    shared.ring().write(bytes);
                }
            }

            session
                .capture
                .ReleaseBuffer(frames)
                .map_err(|e| map_stream_error(e.code()))?;
        }
    }
    Ok(())
}

fn waveformatex_for(format: Format) -> WAVEFORMATEX {
    let bits = (format.sample_format.bytes_per_sample() * 8) as u16;
    let block_align = format.frame_size() as u16;
    WAVEFORMATEX {
        wFormatTag: match format.sample_format {
            SampleFormat::F32 => WAVE_FORMAT_IEEE_FLOAT,
            _ => WAVE_FORMAT_PCM,
        },
        nChannels: format.channels,
        nSamplesPerSec: format.sample_rate,
        nAvgBytesPerSec: format.sample_rate * u32::from(block_align),
        nBlockAlign: block_align,
        wBitsPerSample: bits,
        cbSize: 0,
    }
}

fn format_from_waveformatex(wf: &WAVEFORMATEX) -> Option<Format> {
    let sample_format = match (wf.wFormatTag, wf.wBitsPerSample) {
        (WAVE_FORMAT_IEEE_FLOAT, 32) => SampleFormat::F32,
        (WAVE_FORMAT_PCM, 16) => SampleFormat::I16,
        (WAVE_FORMAT_PCM, 24) => SampleFormat::I24,
        (WAVE_FORMAT_PCM, 32) => SampleFormat::I32,
        _ => return None,
    };
    if wf.nChannels == 0 || wf.nSamplesPerSec == 0 {
        return None;
    }
    Some(Format::new(
        wf.nSamplesPerSec,
        wf.nChannels,
        sample_format,
    ))
}

fn map_activation_error(hr: HRESULT) -> TapError {
    if hr == E_ACCESSDENIED {
        return TapError::permission_denied(format!("process loopback activation refused ({hr})"));
    }
    if hr == E_INVALIDARG || hr.0 == E_NOTFOUND {
        return TapError::TargetNotFound {
            target: "no such process".into(),
        };
    }
    if hr == E_NOINTERFACE {
        return TapError::UnsupportedOs {
            reason: "WASAPI process loopback requires Windows 10 build 19041+".into(),
        };
    }
    TapError::BackendUnavailable {
        reasons: vec![format!("activation failed: {hr}")],
    }
}

fn map_stream_error(hr: HRESULT) -> TapError {
    if hr.0 == AUDCLNT_E_DEVICE_INVALIDATED {
        TapError::backend_lost("audio device invalidated")
    } else {
        TapError::backend_lost(format!("capture stream error: {hr}"))
    }
}

struct ComGuard;

impl Drop for ComGuard {
    fn drop(&mut self) {
        // SAFETY: pairs the CoInitializeEx at pump start.
        unsafe { CoUninitialize() };
    }
}
