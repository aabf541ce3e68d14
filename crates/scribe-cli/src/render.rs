/// Terminal rendering of the live upload view.
///
/// Status goes to stderr so stdout carries only the transcript (text mode)
/// or one JSON object per view update (`--json`).

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use scribe_client::{UploadPhase, UploadProgress, UploadView};
use tokio::sync::watch;

/// How often upload progress is sampled.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

pub async fn run(mut view: watch::Receiver<UploadView>, progress: Arc<UploadProgress>, json: bool) {
    let mut last = UploadView::default();
    let mut last_percent = None;
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                if json {
                    print_json(&current);
                } else {
                    print_changes(&last, &current);
                }
                let settled = current.transfer_id.is_some() && current.is_settled();
                last = current;
                if settled {
                    break;
                }
            }
            _ = ticker.tick() => {
                if json || progress.phase() != UploadPhase::Uploading {
                    continue;
                }
                let percent = (progress.fraction() * 100.0) as u32;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    eprint!("\ruploading {:>3}% ({}/{} bytes)", percent, progress.bytes_done(), progress.bytes_total());
                    let _ = std::io::stderr().flush();
                }
            }
        }
    }
}

fn print_json(view: &UploadView) {
    match serde_json::to_string(view) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("cannot encode view: {}", e),
    }
}

fn print_changes(last: &UploadView, current: &UploadView) {
    if current.connected != last.connected {
        eprintln!("{}", if current.connected { "connected" } else { "disconnected" });
    }

    if current.phase != last.phase {
        match current.phase {
            UploadPhase::Connecting => eprintln!("connecting..."),
            UploadPhase::Sent => eprintln!("\rupload complete, transcribing..."),
            _ => {}
        }
    }

    if let Some(error) = &current.upload_error {
        if last.upload_error.as_ref() != Some(error) {
            eprintln!("upload failed: {}", error);
        }
    }

    // Partial text only grows within a transfer; show the new tail.
    let partial = &current.result.partial_text;
    if current.transfer_id == last.transfer_id && partial.len() > last.result.partial_text.len() {
        if let Some(tail) = partial.get(last.result.partial_text.len()..) {
            eprint!("{}", tail);
            let _ = std::io::stderr().flush();
        }
    }

    if current.result.is_failed() && !last.result.is_failed() {
        if let Some(error) = &current.result.error {
            eprintln!("\nservice error: {}", error);
        }
    }
    if current.result.is_terminal() && !current.result.is_failed() && !last.result.is_terminal() {
        eprintln!();
    }
}
