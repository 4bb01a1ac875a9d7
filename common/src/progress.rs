use std::{
    future::Future,
    time::{Duration, Instant},
};

use anyhow::Result;
use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};

lazy_static::lazy_static! {
    pub static ref DOTS_STYLE: ProgressStyle = ProgressStyle::with_template("{spinner} {msg} {elapsed_precise}").unwrap().tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    pub static ref GREEN_TICK: StyledObject<&'static str> = style("✔").green();
    pub static ref RED_CROSS: StyledObject<&'static str> = style("✗").red();
}

pub const TOPOLOGY: [&str; 3] = [
    "Deriving cluster topology",
    "Could not derive cluster topology",
    "Topology derived",
];

pub const DISCOVERY: [&str; 3] = [
    "Requesting etcd discovery token",
    "Could not obtain discovery token",
    "Discovery token obtained",
];

pub const ISSUANCE: [&str; 3] = [
    "Issuing cluster certificates",
    "Could not issue cluster certificates",
    "Certificates issued",
];

pub const RENDER: [&str; 3] = [
    "Rendering cluster artifacts",
    "Could not render cluster artifacts",
    "Artifacts rendered",
];

pub const WRITE: [&str; 3] = [
    "Writing artifacts",
    "Could not write artifacts",
    "Artifacts written",
];

pub fn progress(msg: &str) -> ProgressBar {
    let w = ProgressBar::new_spinner();
    w.set_style(DOTS_STYLE.clone());
    w.enable_steady_tick(Duration::from_millis(80));
    w.set_message(msg.to_string());
    w
}

/// Runs one pipeline stage behind a spinner. `msgs` is (ongoing, failure, success).
pub async fn stage<T, F>(msgs: [&str; 3], context: &str, verbose: bool, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let pb = if verbose { None } else { Some(progress(msgs[0])) };

    let start_time = Instant::now();
    let res = fut.await;
    let dur = start_time.elapsed();
    match res {
        Ok(v) => {
            finish_progress(msgs[2], context, dur, pb);
            Ok(v)
        }
        Err(err) => {
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            tracing::error!("{} {}", RED_CROSS.to_string(), msgs[1]);
            Err(err.context(msgs[1].to_string()))
        }
    }
}

fn elapsed_time_str(dur: &Duration) -> String {
    let seconds = dur.as_secs() % 60;
    let minutes = (dur.as_secs() / 60) % 60;
    let hours = (dur.as_secs() / 60) / 60;
    format!("{:0>2}:{:0>2}:{:0>2}", hours, minutes, seconds)
}

pub fn finish_progress(
    status_message: &str,
    context: &str,
    dur: Duration,
    pb: Option<ProgressBar>,
) {
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    println!(
        "{} {} ({}) took, {}",
        GREEN_TICK.to_string(),
        status_message,
        context,
        elapsed_time_str(&dur)
    );
}
