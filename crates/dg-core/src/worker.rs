//! Standalone guardian entry point (`devguard worker --config <path>`).
//!
//! The worker trusts nothing but the channel: its config file, whose
//! directory also holds the PID file and the log. It exits when SIGTERM or
//! SIGINT arrives or the license gate reports invalid, deleting the config
//! and (if still its own) the PID file on the way out.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::{ChannelLogSink, ChannelPaths, KnownGoodConfig};
use crate::enforce::{EnforcementLoop, LoopExit, LoopSettings};
use crate::license::LicenseGate;
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::store::DiskStoreOpener;
use dg_common::{GuardianMode, ProcessId, Result};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route SIGTERM and SIGINT to [`stop_requested`].
#[cfg(unix)]
pub fn install_stop_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_stop_signal(_: libc::c_int) {
        STOP_REQUESTED.store(true, Ordering::SeqCst);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }
            .map_err(|e| dg_common::Error::Io(std::io::Error::from(e)))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_stop_handlers() -> Result<()> {
    Ok(())
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Ask the current process's guardian to stop (tests and embedding).
pub fn request_stop() {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Run a standalone guardian until stopped.
pub fn run_worker(
    config_path: &Path,
    loop_settings: LoopSettings,
    gate: Arc<dyn LicenseGate>,
    should_stop: impl Fn() -> bool,
) -> Result<LoopExit> {
    let channel = ChannelPaths::new(config_path.parent().unwrap_or_else(|| Path::new(".")));
    let me = ProcessId::current();
    let ctx = LogContext::for_new_run().with_mode(GuardianMode::Standalone);

    let source = match KnownGoodConfig::load(config_path) {
        Ok(source) => source,
        Err(e) => {
            let _ = channel.remove_pid_if_owned(me);
            return Err(e.into());
        }
    };
    let config = source.current().clone();
    if channel.read_pid()? != Some(me) {
        channel.write_pid(me)?;
    }

    let _ = channel.append_log(&format!(
        "[{}] guardian started pid={} ide={} fields={}",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        me,
        config.selected_ide,
        config.target_identity.len()
    ));
    log_event!(
        ctx,
        INFO,
        event_names::SUPERVISE_SPAWNED,
        Stage::Supervise,
        "standalone guardian running",
        pid = me.0,
        config = config_path.display().to_string().as_str()
    );

    let mut enforcement = EnforcementLoop::new(
        config,
        loop_settings,
        Arc::new(DiskStoreOpener),
        gate,
        Arc::new(ChannelLogSink::new(channel.clone())),
    )
    .with_config_source(Box::new(source))
    .with_log_context(ctx.clone());

    let exit = enforcement.run_until(should_stop);

    let reason = match exit {
        LoopExit::Stopped => "stopped",
        LoopExit::LicenseInvalid => "license invalid",
    };
    let _ = channel.append_log(&format!(
        "[{}] guardian exiting pid={} reason={}",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        me,
        reason
    ));
    for error in channel.cleanup(Some(me)) {
        log_event!(
            ctx,
            WARN,
            event_names::CHANNEL_CLEANUP,
            Stage::Channel,
            "channel cleanup failed",
            error = error.to_string().as_str()
        );
    }
    Ok(exit)
}
