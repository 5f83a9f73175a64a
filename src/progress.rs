//! Progress display for uploads.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress tracker for one upload.
///
/// Uses a byte bar when the source size is known and a spinner when it is
/// not (uploads from standard input).
pub struct TransferProgress {
    bar: Option<ProgressBar>,
}

impl TransferProgress {
    /// Create a new progress tracker.
    pub fn new(total_bytes: Option<u64>, show: bool) -> Self {
        let bar = if show {
            let pb = match total_bytes {
                Some(total) => {
                    let pb = ProgressBar::new(total);
                    pb.set_style(
                        ProgressStyle::default_bar()
                            .template(
                                "{msg:12} {bytes:>10}/{total_bytes:>10} {percent:>3}% {bytes_per_sec:>12} {eta:>8}",
                            )
                            .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    pb
                }
                None => {
                    let pb = ProgressBar::new_spinner();
                    pb.set_style(
                        ProgressStyle::default_spinner()
                            .template("{msg:12} {bytes:>10} {bytes_per_sec:>12}")
                            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                    );
                    pb
                }
            };
            pb.set_message("uploading");
            Some(pb)
        } else {
            None
        };
        Self { bar }
    }

    /// Moves the display to an absolute byte position.
    pub fn set_position(&self, bytes: u64) {
        if let Some(ref pb) = self.bar {
            pb.set_position(bytes);
        }
    }

    /// Finish the display.
    pub fn finish(&self) {
        if let Some(ref pb) = self.bar {
            pb.finish_with_message("done");
        }
    }
}
