//! Crash collection through the on-device crash_serializer helper.
//!
//! The helper writes framed [`FetchCrashesResponse`] messages to stdout and
//! free-form diagnostics to stderr. Stderr is drained on its own thread for the
//! whole lifetime of the stream so the helper can never block on a full pipe.

pub mod messages;
pub mod reader;

pub use messages::{
    CoreDump, CrashBlob, CrashInfo, CrashMetadata, CrashPayload, FetchCrashesResponse,
};
pub use reader::{encode_frame, CrashStreamReader};

use log::{debug, info, warn};
use std::io::{self, BufRead, BufReader, Read};

use crate::error::{Error, ErrorContext, Result};
use crate::remote::{DutAdapter, RunningCommand};

/// Default on-device location of the helper.
pub const DEFAULT_SERIALIZER_PATH: &str = "/usr/local/sbin/crash_serializer";

/// Default maximum blob chunk the helper emits, in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

pub fn serializer_command(path: &str, chunk_size: u64, fetch_core: bool) -> String {
    let mut command = format!("{} --chunk_size={}", path, chunk_size);
    if fetch_core {
        command.push_str(" --fetch_coredumps");
    }
    command
}

/// Streams every crash the device holds to `on_message`, in order.
///
/// Returns the number of messages delivered. Fails with
/// [`Error::NotFound`] when the helper is missing, [`Error::Unavailable`] on
/// a truncated stream and [`Error::Corrupt`] on an undecodable payload.
pub async fn fetch_crashes<F>(
    adapter: &DutAdapter,
    serializer_path: &str,
    chunk_size: u64,
    fetch_core: bool,
    on_message: F,
) -> Result<usize>
where
    F: FnMut(FetchCrashesResponse) -> Result<()> + Send + 'static,
{
    let exists = adapter
        .path_exists(serializer_path)
        .await
        .context("failed to check crash_serializer existence")?;
    if !exists {
        return Err(Error::NotFound(format!(
            "crash_serializer at {}",
            serializer_path
        )));
    }

    let command = serializer_command(serializer_path, chunk_size, fetch_core);
    debug!("Streaming crashes with `{}`", command);
    adapter
        .stream_cmd(&command, move |running| drain(running, on_message))
        .await
}

fn drain<F>(running: RunningCommand, mut on_message: F) -> Result<usize>
where
    F: FnMut(FetchCrashesResponse) -> Result<()>,
{
    let RunningCommand {
        stdout,
        stderr,
        finish,
    } = running;

    let delivered = std::thread::scope(|scope| {
        scope.spawn(move || log_stderr(stderr));

        let mut reader = CrashStreamReader::new(stdout);
        let mut count = 0usize;
        loop {
            let next = reader
                .read_message::<FetchCrashesResponse>()
                .and_then(|msg| match msg {
                    Some(msg) => {
                        debug!("{}", msg.summary());
                        on_message(msg).map(|_| true)
                    }
                    None => Ok(false),
                });
            match next {
                Ok(true) => count += 1,
                Ok(false) => break Ok(count),
                Err(e) => {
                    // Keep the helper writing until it exits so stderr reaches EOF.
                    let _ = io::copy(&mut reader.into_inner(), &mut io::sink());
                    break Err(e);
                }
            }
        }
    })?;

    match finish() {
        Ok(0) => {}
        Ok(status) => warn!("crash_serializer exited with status {}", status),
        Err(e) => warn!("crash_serializer did not close cleanly: {}", e),
    }
    info!("Fetched {} crash messages", delivered);
    Ok(delivered)
}

fn log_stderr(stderr: Box<dyn Read + Send>) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) => info!("crash_serializer: {}", line),
            Err(e) => {
                warn!("Failed to read crash_serializer stderr: {}", e);
                break;
            }
        }
    }
}
