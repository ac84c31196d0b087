//! Progress reporting for a collapse run
//!
//! One main bar counts loans over the whole run; each shard adds its own bar
//! below it.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Default style for a main progress bar
pub const DEFAULT_MAIN_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}) {msg}";

/// Default style for a shard progress bar
pub const DEFAULT_GROUP_TEMPLATE: &str =
    "{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}";

fn styled(length: u64, template: &str, description: Option<&str>) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let pb = ProgressBar::new(length).with_style(style);
    if let Some(desc) = description {
        pb.set_message(desc.to_string());
    }
    pb
}

/// Create a main progress bar with the standard style
#[must_use]
pub fn create_main_progress_bar(length: u64, description: Option<&str>) -> ProgressBar {
    styled(length, DEFAULT_MAIN_TEMPLATE, description)
}

/// Create a shard progress bar with the standard style
#[must_use]
pub fn create_group_progress_bar(length: u64, description: Option<&str>) -> ProgressBar {
    styled(length, DEFAULT_GROUP_TEMPLATE, description)
}

/// Create a multi-progress display with a main bar
///
/// When `visible` is false nothing is drawn, but the bars still count.
#[must_use]
pub fn create_multi_progress(total: u64, description: Option<&str>, visible: bool) -> (MultiProgress, ProgressBar) {
    let mp = if visible {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };
    let main_pb = mp.add(create_main_progress_bar(total, description));
    (mp, main_pb)
}

/// Add a shard bar to a multi-progress display
#[must_use]
pub fn add_group_progress_bar(mp: &MultiProgress, length: u64, description: Option<&str>) -> ProgressBar {
    mp.add(create_group_progress_bar(length, description))
}

/// Finish a progress bar, optionally with a completion message
pub fn finish_progress_bar(pb: &ProgressBar, message: Option<&str>) {
    if let Some(msg) = message {
        pb.finish_with_message(msg.to_string());
    } else {
        pb.finish();
    }
}
